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

//! Named Envoy endpoints with their cache lifetimes and access rules

use crate::errors::{EnvoyError, EnvoyResult};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

pub const HOME_JSON: &str = "home_json";
pub const INFO: &str = "info";
pub const PRODUCTION_JSON: &str = "production_json";
pub const PRODUCTION_V1: &str = "production_v1";
pub const PRODUCTION_INVERTERS: &str = "production_inverters";
pub const PRODUCTION_REPORT: &str = "production_report";
pub const PRODUCTION_POWER: &str = "production_power";
pub const PDM_ENERGY: &str = "pdm_energy";
pub const DEVICE_DATA: &str = "device_data";
pub const ENSEMBLE_INVENTORY: &str = "ensemble_inventory";
pub const ENSEMBLE_SECCTRL: &str = "ensemble_secctrl";
pub const ENSEMBLE_POWER: &str = "ensemble_power";
pub const INVENTORY: &str = "inventory";
pub const DEVSTATUS: &str = "devstatus";
pub const PCU_COMM_CHECK: &str = "pcu_comm_check";
pub const INSTALLER_AGF: &str = "installer_agf";
pub const ADMIN_TARIFF: &str = "admin_tariff";
pub const DPEL: &str = "dpel";
pub const METERS: &str = "meters";
pub const METERS_READINGS: &str = "meters_readings";
pub const PEB_NEWSCAN: &str = "peb_newscan";

/// Paths that are not cached endpoints but are called directly.
pub mod paths {
    pub const STREAM_METER: &str = "/stream/meter";
    pub const AUTH_GET_JWT: &str = "/auth/get_jwt";
    pub const AUTH_CHECK_JWT: &str = "/auth/check_jwt";
    pub const AGF_SET_PROFILE: &str = "/installer/agf/set_profile.json";
    pub const AGF_UPLOAD_PROFILE: &str = "/installer/agf/upload_profile_package";
}

// name, path, ttl seconds, installer required, optional
const DEFAULT_ENDPOINTS: &[(&str, &str, u64, bool, bool)] = &[
    (HOME_JSON, "/home.json", 60, false, false),
    (INFO, "/info.xml", 3600, false, false),
    (PRODUCTION_JSON, "/production.json?details=1", 10, false, false),
    (PRODUCTION_V1, "/api/v1/production", 10, false, false),
    (PRODUCTION_INVERTERS, "/api/v1/production/inverters", 60, false, false),
    (PRODUCTION_REPORT, "/ivp/meters/reports/production", 10, false, false),
    (PRODUCTION_POWER, "/ivp/mod/603980032/mode/power", 60, true, false),
    (PDM_ENERGY, "/ivp/pdm/energy", 10, true, false),
    (DEVICE_DATA, "/ivp/pdm/device_data", 60, true, false),
    (ENSEMBLE_INVENTORY, "/ivp/ensemble/inventory", 60, false, false),
    (ENSEMBLE_SECCTRL, "/ivp/ensemble/secctrl", 10, false, false),
    (ENSEMBLE_POWER, "/ivp/ensemble/power", 10, false, false),
    (INVENTORY, "/inventory.json", 300, false, false),
    (DEVSTATUS, "/ivp/peb/devstatus", 60, true, false),
    (PCU_COMM_CHECK, "/installer/pcu_comm_check", 3600, true, true),
    (INSTALLER_AGF, "/installer/agf/index.json", 3600, true, true),
    (ADMIN_TARIFF, "/admin/lib/tariff", 300, false, true),
    (DPEL, "/ivp/ss/dpel", 600, true, true),
    (METERS, "/ivp/meters", 3600, false, false),
    (METERS_READINGS, "/ivp/meters/readings", 10, false, false),
    (PEB_NEWSCAN, "/ivp/peb/newscan", 3600, true, true),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub name: String,
    pub path: String,
    pub ttl: Duration,
    pub installer_required: bool,
    pub optional: bool,
}

/// Where endpoint URLs point to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSource {
    /// Live device, e.g. `https://192.168.1.20`
    Device { base_url: String },
    /// Directory of captured responses named `<endpoint>.json` / `<endpoint>.xml`
    Fixtures { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    source: EndpointSource,
    endpoints: BTreeMap<String, EndpointDescriptor>,
}

impl EndpointRegistry {
    pub fn new(source: EndpointSource) -> Self {
        Self {
            source,
            endpoints: BTreeMap::new(),
        }
    }

    /// Registry with every endpoint the Envoy firmware family exposes.
    pub fn with_defaults(source: EndpointSource) -> Self {
        let mut registry = Self::new(source);
        for &(name, path, ttl, installer, optional) in DEFAULT_ENDPOINTS {
            registry.endpoints.insert(
                name.to_string(),
                EndpointDescriptor {
                    name: name.to_string(),
                    path: path.to_string(),
                    ttl: Duration::from_secs(ttl),
                    installer_required: installer,
                    optional,
                },
            );
        }
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        path: &str,
        ttl_secs: u64,
        installer_required: bool,
        optional: bool,
    ) -> EnvoyResult<()> {
        if self.endpoints.contains_key(name) {
            return Err(EnvoyError::ConfigError(format!(
                "Endpoint '{name}' is already registered"
            )));
        }
        if !path.starts_with('/') {
            return Err(EnvoyError::ConfigError(format!(
                "Endpoint '{name}' path must start with '/': {path}"
            )));
        }
        self.endpoints.insert(
            name.to_string(),
            EndpointDescriptor {
                name: name.to_string(),
                path: path.to_string(),
                ttl: Duration::from_secs(ttl_secs),
                installer_required,
                optional,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.get(name)
    }

    pub fn source(&self) -> &EndpointSource {
        &self.source
    }

    /// Fetch location of a registered endpoint.
    pub fn url(&self, name: &str) -> Option<String> {
        let descriptor = self.lookup(name)?;
        Some(match &self.source {
            EndpointSource::Device { base_url } => join(base_url, &descriptor.path),
            EndpointSource::Fixtures { dir } => {
                let ext = if descriptor.path.ends_with(".xml") {
                    "xml"
                } else {
                    "json"
                };
                dir.join(format!("{name}.{ext}"))
                    .to_string_lossy()
                    .into_owned()
            }
        })
    }

    /// URL of an ad-hoc device path (commands, auth, stream).
    pub fn device_url(&self, path: &str) -> EnvoyResult<String> {
        match &self.source {
            EndpointSource::Device { base_url } => Ok(join(base_url, path)),
            EndpointSource::Fixtures { dir } => Err(EnvoyError::ConfigError(format!(
                "{path} is not available when reading fixtures from {}",
                dir.display()
            ))),
        }
    }
}

fn join(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// `https://<host>`, bracketing IPv6 literals.
pub fn device_base_url(host: &str) -> String {
    let host = host.trim();
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("https://[{host}]")
    } else {
        format!("https://{host}")
    }
}
