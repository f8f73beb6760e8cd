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

use anyhow::{Context, Result};
use fluxion_envoy::EnvoyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "envoy.toml";

fn default_token_file() -> PathBuf {
    PathBuf::from("envoy_token.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub envoy: EnvoyConfig,

    /// Where the access token is persisted between runs
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            envoy: EnvoyConfig::default(),
            token_file: default_token_file(),
        }
    }
}

impl CliConfig {
    /// Load from `path` (or `envoy.toml`), then apply `ENVOY_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let mut config = Self::read_file(file, path.is_some())?;
        config.apply_env(|key| std::env::var(key).ok());
        config.envoy.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(config_str) => {
                let config: Self = toml::from_str(&config_str)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                info!("✅ Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if required => {
                Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
            Err(_) => {
                warn!("No configuration file found, using defaults with environment overrides");
                Ok(Self::default())
            }
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("ENVOY_HOST") {
            self.envoy.host = host;
        }
        if let Some(username) = lookup("ENVOY_USERNAME") {
            self.envoy.username = Some(username);
        }
        if let Some(password) = lookup("ENVOY_PASSWORD") {
            self.envoy.password = Some(password);
        }
        if let Some(serial) = lookup("ENVOY_SERIAL") {
            self.envoy.serial = Some(serial);
        }
        if let Some(token_file) = lookup("ENVOY_TOKEN_FILE") {
            self.token_file = PathBuf::from(token_file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxion_envoy::{AuthFlow, DeviceDataSource};
    use std::collections::HashMap;

    #[test]
    fn test_parse_toml() {
        let config: CliConfig = toml::from_str(
            r#"
            host = "192.168.1.40"
            username = "owner@example.com"
            password = "secret"
            serial = "122233445566"
            auth_flow = "owner"
            device_data_source = "devstatus"
            disabled_endpoints = ["installer_agf"]
            disable_negative_production = true
            token_file = "/var/lib/envoy/token.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.envoy.host, "192.168.1.40");
        assert_eq!(config.envoy.auth_flow, AuthFlow::Owner);
        assert_eq!(config.envoy.device_data_source, DeviceDataSource::Devstatus);
        assert_eq!(config.envoy.disabled_endpoints, vec!["installer_agf"]);
        assert!(config.envoy.disable_negative_production);
        assert_eq!(config.envoy.scan_interval_secs, 60);
        assert_eq!(config.token_file, PathBuf::from("/var/lib/envoy/token.json"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ENVOY_HOST", "envoy.lan"),
            ("ENVOY_PASSWORD", "from-env"),
        ]);
        let mut config = CliConfig::default();
        config.envoy.username = Some("file@example.com".to_string());
        config.apply_env(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.envoy.host, "envoy.lan");
        assert_eq!(config.envoy.password.as_deref(), Some("from-env"));
        assert_eq!(config.envoy.username.as_deref(), Some("file@example.com"));
        assert_eq!(config.token_file, PathBuf::from("envoy_token.json"));
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(CliConfig::read_file(&missing, true).is_err());
        assert!(CliConfig::read_file(&missing, false).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envoy.toml");
        std::fs::write(&path, "host = \"10.0.0.5\"\nscan_interval_secs = 30\n").unwrap();

        let config = CliConfig::read_file(&path, true).unwrap();
        assert_eq!(config.envoy.host, "10.0.0.5");
        assert_eq!(config.envoy.scan_interval_secs, 30);
    }
}
