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

//! Reader configuration

use crate::endpoints::{DEVICE_DATA, DEVSTATUS, EndpointSource, PCU_COMM_CHECK, device_base_url};
use crate::errors::{EnvoyError, EnvoyResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REALTIME_THROTTLE_SECS: u64 = 10;
pub const DEFAULT_GETDATA_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STREAM_RECONNECT_SECS: u64 = 30;
pub const ENTREZ_URL: &str = "https://entrez.enphaseenergy.com";
pub const ENLIGHTEN_URL: &str = "https://enlighten.enphaseenergy.com";

fn default_60() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_10() -> u64 {
    DEFAULT_REALTIME_THROTTLE_SECS
}

fn default_30() -> u64 {
    DEFAULT_STREAM_RECONNECT_SECS
}

fn default_request_timeout() -> u64 {
    30
}

fn default_entrez_url() -> String {
    ENTREZ_URL.to_string()
}

fn default_enlighten_url() -> String {
    ENLIGHTEN_URL.to_string()
}

/// How a new token is obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlow {
    /// Code-challenge login through Entrez, exchanged at the Envoy's `/auth/get_jwt`
    #[default]
    Gateway,
    /// Enlighten owner login, token issued by Entrez `/tokens`
    Owner,
}

/// Which endpoint feeds per-device inverter/relay readings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceDataSource {
    #[default]
    DeviceData,
    Devstatus,
}

impl DeviceDataSource {
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::DeviceData => DEVICE_DATA,
            Self::Devstatus => DEVSTATUS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvoyConfig {
    /// Hostname or IP of the Envoy
    pub host: String,

    /// Enlighten account e-mail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Envoy serial number as registered in Enlighten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    #[serde(default)]
    pub auth_flow: AuthFlow,

    /// Report small negative production (-15 W < x < 0) as zero
    #[serde(default)]
    pub disable_negative_production: bool,

    /// Never use installer-only endpoints even with an installer token
    #[serde(default)]
    pub disable_installer_account_use: bool,

    /// Optional endpoints that must not be polled
    #[serde(default)]
    pub disabled_endpoints: Vec<String>,

    /// Poll the installer PCU communication check (slow on large sites)
    #[serde(default)]
    pub enable_pcu_comm_check: bool,

    /// Offset in Wh added to lifetime production
    #[serde(default)]
    pub lifetime_production_correction: f64,

    #[serde(default)]
    pub device_data_source: DeviceDataSource,

    /// Refresh interval used by the host polling loop (seconds)
    #[serde(default = "default_60")]
    pub scan_interval_secs: u64,

    #[serde(default)]
    pub enable_realtime_updates: bool,

    /// Minimum seconds between realtime metric emissions
    #[serde(default = "default_10")]
    pub realtime_throttle_secs: u64,

    /// Seconds to wait before reconnecting the meter stream
    #[serde(default = "default_30")]
    pub stream_reconnect_secs: u64,

    /// Deadline for one full refresh (seconds)
    #[serde(default = "default_60")]
    pub getdata_timeout_secs: u64,

    /// Per-request HTTP timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Treat a token as expired this many seconds early
    #[serde(default)]
    pub token_refresh_buffer_secs: u64,

    /// Custom device base URL for testing (overrides `https://<host>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Read endpoint responses from files instead of the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixtures_dir: Option<PathBuf>,

    #[serde(default = "default_entrez_url")]
    pub entrez_url: String,

    #[serde(default = "default_enlighten_url")]
    pub enlighten_url: String,
}

impl Default for EnvoyConfig {
    fn default() -> Self {
        Self {
            host: "envoy.local".to_string(),
            username: None,
            password: None,
            serial: None,
            auth_flow: AuthFlow::default(),
            disable_negative_production: false,
            disable_installer_account_use: false,
            disabled_endpoints: Vec::new(),
            enable_pcu_comm_check: false,
            lifetime_production_correction: 0.0,
            device_data_source: DeviceDataSource::default(),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            enable_realtime_updates: false,
            realtime_throttle_secs: DEFAULT_REALTIME_THROTTLE_SECS,
            stream_reconnect_secs: DEFAULT_STREAM_RECONNECT_SECS,
            getdata_timeout_secs: DEFAULT_GETDATA_TIMEOUT_SECS,
            request_timeout_secs: default_request_timeout(),
            token_refresh_buffer_secs: 0,
            base_url: None,
            fixtures_dir: None,
            entrez_url: default_entrez_url(),
            enlighten_url: default_enlighten_url(),
        }
    }
}

impl EnvoyConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EnvoyResult<()> {
        if self.host.trim().is_empty() && self.base_url.is_none() && self.fixtures_dir.is_none() {
            return Err(EnvoyError::ConfigError("Envoy host must be set".to_string()));
        }
        if self.getdata_timeout_secs == 0 {
            return Err(EnvoyError::ConfigError(
                "getdata_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(EnvoyError::ConfigError(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the Enlighten credentials needed to obtain a token are present.
    pub fn has_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.username) && filled(&self.password) && filled(&self.serial)
    }

    pub fn endpoint_source(&self) -> EndpointSource {
        if let Some(dir) = &self.fixtures_dir {
            return EndpointSource::Fixtures { dir: dir.clone() };
        }
        EndpointSource::Device {
            base_url: self.device_base_url(),
        }
    }

    pub fn device_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| device_base_url(&self.host))
    }

    /// Disabled optional endpoints, including the PCU check unless opted in.
    pub fn effective_disabled_endpoints(&self) -> Vec<String> {
        let mut disabled = self.disabled_endpoints.clone();
        if !self.enable_pcu_comm_check && !disabled.iter().any(|e| e == PCU_COMM_CHECK) {
            disabled.push(PCU_COMM_CHECK.to_string());
        }
        disabled
    }

    pub fn getdata_timeout(&self) -> Duration {
        Duration::from_secs(self.getdata_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn realtime_throttle(&self) -> Duration {
        Duration::from_secs(self.realtime_throttle_secs)
    }

    pub fn stream_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.stream_reconnect_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: EnvoyConfig = serde_json::from_str(r#"{"host": "192.168.1.20"}"#).unwrap();
        assert_eq!(config.scan_interval_secs, 60);
        assert_eq!(config.realtime_throttle_secs, 10);
        assert_eq!(config.getdata_timeout_secs, 60);
        assert_eq!(config.auth_flow, AuthFlow::Gateway);
        assert_eq!(config.device_data_source, DeviceDataSource::DeviceData);
        assert_eq!(config.entrez_url, ENTREZ_URL);
        assert!(!config.has_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_enum_spelling() {
        let config: EnvoyConfig = serde_json::from_str(
            r#"{"host": "h", "auth_flow": "owner", "device_data_source": "devstatus"}"#,
        )
        .unwrap();
        assert_eq!(config.auth_flow, AuthFlow::Owner);
        assert_eq!(config.device_data_source.endpoint(), DEVSTATUS);
    }

    #[test]
    fn test_pcu_comm_check_disabled_unless_enabled() {
        let mut config = EnvoyConfig::new("h");
        assert_eq!(config.effective_disabled_endpoints(), vec![PCU_COMM_CHECK.to_string()]);

        config.enable_pcu_comm_check = true;
        config.disabled_endpoints = vec!["dpel".to_string()];
        assert_eq!(config.effective_disabled_endpoints(), vec!["dpel".to_string()]);
    }

    #[test]
    fn test_base_url_override() {
        let mut config = EnvoyConfig::new("fe80::2");
        assert_eq!(config.device_base_url(), "https://[fe80::2]");
        config.base_url = Some("http://127.0.0.1:1234".to_string());
        assert_eq!(
            config.endpoint_source(),
            EndpointSource::Device {
                base_url: "http://127.0.0.1:1234".to_string()
            }
        );
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let config = EnvoyConfig::new("  ");
        assert!(matches!(config.validate(), Err(EnvoyError::ConfigError(_))));
    }
}
