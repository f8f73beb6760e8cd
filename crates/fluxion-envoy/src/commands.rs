// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Device mutations: production power, export limiting, grid profiles, storage

use crate::endpoints::{ADMIN_TARIFF, DPEL, INSTALLER_AGF, PRODUCTION_POWER, paths};
use crate::errors::{EnvoyError, EnvoyResult};
use crate::reader::EnvoyReader;
use crate::transport::RawResponse;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

const DPEL_FILENAME: &str = "site_settings";
const DPEL_VERSION: &str = "00.00.01";

/// Battery operating mode as stored in the tariff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    Backup,
    SelfConsumption,
    SavingsMode,
    Economy,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::SelfConsumption => "self-consumption",
            Self::SavingsMode => "savings-mode",
            Self::Economy => "economy",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorageMode {
    type Err = EnvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Self::Backup),
            "self-consumption" => Ok(Self::SelfConsumption),
            "savings-mode" => Ok(Self::SavingsMode),
            "economy" => Ok(Self::Economy),
            other => Err(EnvoyError::ConfigError(format!("Unknown storage mode: {other}"))),
        }
    }
}

/// Export limiting settings for [`EnvoyReader::enable_dpel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DpelSettings {
    pub limit_watts: f64,
    pub slew_rate: f64,
    pub export_limit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GridProfiles {
    pub selected: Option<String>,
    pub available: Vec<String>,
}

fn ensure_success(response: &RawResponse, action: &str) -> EnvoyResult<()> {
    if response.is_success() {
        return Ok(());
    }
    warn!(
        "❌ [ENVOY COMMAND] {} failed with HTTP {}",
        action, response.status
    );
    Err(EnvoyError::ApiError {
        status: response.status,
        message: format!("{action}: {}", response.body),
    })
}

fn rejection(response: &RawResponse) -> EnvoyError {
    let body = response.json().unwrap_or(Value::Null);
    let field = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    EnvoyError::DeviceRejected {
        message: field("message"),
        reason: field("reason"),
    }
}

fn profile_id(entry: &Value) -> Option<String> {
    match entry {
        Value::String(id) => Some(id.clone()),
        Value::Object(fields) => fields.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

impl EnvoyReader {
    fn endpoint_url(&self, name: &str) -> EnvoyResult<String> {
        let registry = self.fetcher.registry();
        let descriptor = registry
            .lookup(name)
            .ok_or_else(|| EnvoyError::ConfigError(format!("Unknown endpoint {name}")))?;
        registry.device_url(&descriptor.path)
    }

    /// Turn inverter production on or off.
    pub async fn set_production_power(&mut self, on: bool) -> EnvoyResult<()> {
        let url = self.endpoint_url(PRODUCTION_POWER)?;
        let forced_off = i32::from(!on);
        info!("⚡ [ENVOY COMMAND] Setting production power on={}", on);

        let response = self
            .fetcher
            .transport()
            .put_json(&url, &json!({"length": 1, "arr": [forced_off]}))
            .await?;
        ensure_success(&response, "set production power")?;
        self.fetcher.invalidate(PRODUCTION_POWER);
        Ok(())
    }

    pub async fn enable_dpel(&mut self, settings: DpelSettings) -> EnvoyResult<()> {
        info!(
            "⚡ [ENVOY COMMAND] Enabling DPEL limit={}W slew={} export_limit={}",
            settings.limit_watts, settings.slew_rate, settings.export_limit
        );
        self.post_dpel(json!({
            "enable": true,
            "export_limit": settings.export_limit,
            "limit_value_W": settings.limit_watts,
            "slew_rate": settings.slew_rate,
            "enable_dynamic_limiting": false,
        }))
        .await
    }

    pub async fn disable_dpel(&mut self) -> EnvoyResult<()> {
        info!("⚡ [ENVOY COMMAND] Disabling DPEL");
        self.post_dpel(json!({"enable": false})).await
    }

    async fn post_dpel(&mut self, settings: Value) -> EnvoyResult<()> {
        let url = self.endpoint_url(DPEL)?;
        let body = json!({
            "dynamic_pel_settings": settings,
            "filename": DPEL_FILENAME,
            "version": DPEL_VERSION,
        });
        let response = self.fetcher.transport().post_json(&url, &body).await?;
        ensure_success(&response, "update DPEL settings")?;
        self.fetcher.invalidate(DPEL);
        Ok(())
    }

    /// Selected grid profile and the ids the Envoy offers.
    pub async fn grid_profiles(&mut self) -> EnvoyResult<GridProfiles> {
        self.update_endpoints(Some(&BTreeSet::from([INSTALLER_AGF.to_string()])))
            .await?;
        let Some(agf) = self.fetcher.data(INSTALLER_AGF) else {
            return Ok(GridProfiles::default());
        };

        Ok(GridProfiles {
            selected: agf
                .get("selected_profile")
                .and_then(Value::as_str)
                .map(str::to_string),
            available: agf
                .get("profiles")
                .and_then(Value::as_array)
                .map(|profiles| profiles.iter().filter_map(profile_id).collect())
                .unwrap_or_default(),
        })
    }

    pub async fn set_grid_profile(&mut self, profile_id: &str) -> EnvoyResult<()> {
        let url = self.fetcher.registry().device_url(paths::AGF_SET_PROFILE)?;
        info!("⚡ [ENVOY COMMAND] Selecting grid profile {}", profile_id);

        let response = self
            .fetcher
            .transport()
            .put_json(&url, &json!({"selected_profile": profile_id}))
            .await?;
        if !response.body.contains("accepted") {
            return Err(rejection(&response));
        }
        self.fetcher.invalidate(INSTALLER_AGF);
        Ok(())
    }

    /// Upload a grid profile package file.
    pub async fn upload_grid_profile(&mut self, file: &Path) -> EnvoyResult<()> {
        let url = self.fetcher.registry().device_url(paths::AGF_UPLOAD_PROFILE)?;
        let content = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .map_or_else(|| "profile".to_string(), |n| n.to_string_lossy().into_owned());
        info!(
            "⚡ [ENVOY COMMAND] Uploading grid profile package {} ({} bytes)",
            file_name,
            content.len()
        );

        let form = Form::new().part("file", Part::bytes(content).file_name(file_name));
        let response = self.fetcher.transport().post_multipart(&url, form).await?;
        let message = response
            .json()
            .ok()
            .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string));
        if message.as_deref() != Some("success") {
            return Err(rejection(&response));
        }
        self.fetcher.invalidate(INSTALLER_AGF);
        Ok(())
    }

    /// Change one key of the tariff's storage settings.
    pub async fn set_storage_setting(&mut self, key: &str, value: Value) -> EnvoyResult<()> {
        if self.fetcher.data(ADMIN_TARIFF).is_none() {
            self.update_endpoints(Some(&BTreeSet::from([ADMIN_TARIFF.to_string()])))
                .await?;
        }
        let mut tariff = self
            .fetcher
            .data(ADMIN_TARIFF)
            .and_then(|t| t.get("tariff"))
            .cloned()
            .ok_or_else(|| EnvoyError::ConfigError("Tariff settings are not available".to_string()))?;

        let Some(settings) = tariff
            .get_mut("storage_settings")
            .and_then(Value::as_object_mut)
        else {
            return Err(EnvoyError::ConfigError(
                "Tariff has no storage settings".to_string(),
            ));
        };
        info!("⚡ [ENVOY COMMAND] Setting storage {} = {}", key, value);
        settings.insert(key.to_string(), value);

        let url = self.endpoint_url(ADMIN_TARIFF)?;
        let response = self
            .fetcher
            .transport()
            .put_json(&url, &json!({"tariff": tariff}))
            .await?;
        ensure_success(&response, "update storage settings")?;
        self.fetcher.invalidate(ADMIN_TARIFF);
        Ok(())
    }

    pub async fn set_storage_mode(&mut self, mode: StorageMode) -> EnvoyResult<()> {
        self.set_storage_setting("mode", json!(mode.as_str())).await
    }

    pub async fn set_reserved_soc(&mut self, percent: u8) -> EnvoyResult<()> {
        self.set_storage_setting("reserved_soc", json!(percent)).await
    }

    pub async fn set_very_low_soc(&mut self, percent: u8) -> EnvoyResult<()> {
        self.set_storage_setting("very_low_soc", json!(percent)).await
    }

    pub async fn set_charge_from_grid(&mut self, enabled: bool) -> EnvoyResult<()> {
        self.set_storage_setting("charge_from_grid", json!(enabled))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mode_names() {
        for mode in [
            StorageMode::Backup,
            StorageMode::SelfConsumption,
            StorageMode::SavingsMode,
            StorageMode::Economy,
        ] {
            assert_eq!(mode.as_str().parse::<StorageMode>().unwrap(), mode);
            assert_eq!(
                serde_json::to_value(mode).unwrap(),
                json!(mode.to_string())
            );
        }
        assert!("turbo".parse::<StorageMode>().is_err());
    }

    #[test]
    fn test_profile_ids() {
        assert_eq!(profile_id(&json!({"id": "EN 50549-1"})), Some("EN 50549-1".to_string()));
        assert_eq!(profile_id(&json!("IEEE 1547")), Some("IEEE 1547".to_string()));
        assert_eq!(profile_id(&json!(7)), None);
    }
}
