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

//! Per-endpoint cache bookkeeping and the raw endpoint store

use crate::endpoints::{
    DEVICE_DATA, DEVSTATUS, EndpointDescriptor, EndpointRegistry, METERS, METERS_READINGS,
    PRODUCTION_JSON,
};
use crate::errors::EnvoyResult;
use crate::parsers::{merge_meters, parse_device_data, parse_devstatus, xml_to_value};
use crate::transport::{EnvoyTransport, RawResponse};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchState {
    pub last_fetch: Option<Instant>,
    pub last_status: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    InstallerOnly,
    Fresh,
}

/// Fetches stale endpoints and keeps their latest parsed payloads.
#[derive(Debug)]
pub struct EndpointFetcher {
    registry: EndpointRegistry,
    transport: EnvoyTransport,
    store: Map<String, Value>,
    states: HashMap<String, FetchState>,
    ttl_overrides: HashMap<String, Duration>,
    disabled: HashSet<String>,
}

impl EndpointFetcher {
    pub fn new(
        registry: EndpointRegistry,
        transport: EnvoyTransport,
        disabled_endpoints: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            registry,
            transport,
            store: Map::new(),
            states: HashMap::new(),
            ttl_overrides: HashMap::new(),
            disabled: disabled_endpoints.into_iter().collect(),
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &EnvoyTransport {
        &self.transport
    }

    /// Latest payload per endpoint name.
    pub fn store(&self) -> &Map<String, Value> {
        &self.store
    }

    pub fn data(&self, name: &str) -> Option<&Value> {
        self.store.get(name)
    }

    pub fn state(&self, name: &str) -> FetchState {
        self.states.get(name).copied().unwrap_or_default()
    }

    pub fn set_ttl_overrides(&mut self, overrides: &[(&str, Duration)]) {
        self.ttl_overrides = overrides
            .iter()
            .map(|&(name, ttl)| (name.to_string(), ttl))
            .collect();
    }

    pub fn ttl(&self, descriptor: &EndpointDescriptor) -> Duration {
        self.ttl_overrides
            .get(&descriptor.name)
            .copied()
            .unwrap_or(descriptor.ttl)
    }

    /// Forget the last fetch so the next cycle fetches again.
    pub fn invalidate(&mut self, name: &str) {
        if let Some(state) = self.states.get_mut(name) {
            state.last_fetch = None;
        }
    }

    pub fn skip_reason(
        &self,
        descriptor: &EndpointDescriptor,
        installer_allowed: bool,
        now: Instant,
    ) -> Option<SkipReason> {
        if descriptor.optional && self.disabled.contains(&descriptor.name) {
            return Some(SkipReason::Disabled);
        }
        if descriptor.installer_required && !installer_allowed {
            return Some(SkipReason::InstallerOnly);
        }
        let ttl = self.ttl(descriptor);
        let last_fetch = self.states.get(&descriptor.name).and_then(|s| s.last_fetch);
        match last_fetch {
            Some(last) if !ttl.is_zero() && now.saturating_duration_since(last) < ttl => {
                Some(SkipReason::Fresh)
            }
            _ => None,
        }
    }

    pub async fn update_endpoints(
        &mut self,
        names: &BTreeSet<String>,
        installer_allowed: bool,
    ) -> EnvoyResult<()> {
        self.update_endpoints_at(names, installer_allowed, Instant::now())
            .await
    }

    /// Fetch every named endpoint that is enabled, authorized and stale at `now`.
    pub async fn update_endpoints_at(
        &mut self,
        names: &BTreeSet<String>,
        installer_allowed: bool,
        now: Instant,
    ) -> EnvoyResult<()> {
        info!("🔄 [ENVOY UPDATE] Updating endpoints {:?}", names);

        for name in names {
            let Some(descriptor) = self.registry.lookup(name).cloned() else {
                error!("❌ [ENVOY UPDATE] No settings found for endpoint {}", name);
                continue;
            };

            if let Some(reason) = self.skip_reason(&descriptor, installer_allowed, now) {
                debug!("⏭️ [ENVOY UPDATE] Skipping {} ({:?})", name, reason);
                continue;
            }

            self.fetch(&descriptor, now).await?;
        }
        Ok(())
    }

    async fn fetch(&mut self, descriptor: &EndpointDescriptor, now: Instant) -> EnvoyResult<()> {
        let name = descriptor.name.as_str();
        let Some(url) = self.registry.url(name) else {
            return Ok(());
        };

        let state = self.states.entry(name.to_string()).or_default();
        state.last_fetch = Some(now);

        let started = Instant::now();
        let result = self.transport.get(&url).await;
        debug!(
            "⏱️ [ENVOY UPDATE] Fetching {} took {:.3}s",
            name,
            started.elapsed().as_secs_f64()
        );

        match result {
            Ok(Some(raw)) => {
                self.record_status(name, raw.status);
                if raw.status >= 400 {
                    warn!(
                        "⚠️ [ENVOY UPDATE] {} answered HTTP {}, keeping previous data",
                        name, raw.status
                    );
                    return Ok(());
                }
                if let Err(e) = self.store_response(name, &raw) {
                    warn!("⚠️ [ENVOY UPDATE] Could not parse {}: {}", name, e);
                }
                Ok(())
            }
            Ok(None) => {
                self.record_status(name, 404);
                Ok(())
            }
            Err(e) if e.is_unauthorized() && name != PRODUCTION_JSON => {
                self.record_status(name, 401);
                warn!("⚠️ [ENVOY UPDATE] Not authorized for {}", name);
                Ok(())
            }
            Err(e) if e.is_unauthorized() => {
                self.record_status(name, 401);
                Err(e)
            }
            Err(e) if descriptor.optional => {
                warn!("⚠️ [ENVOY UPDATE] Optional endpoint {} failed: {}", name, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn record_status(&mut self, name: &str, status: u16) {
        self.states.entry(name.to_string()).or_default().last_status = Some(status);
    }

    /// Parse a successful response and place it in the store.
    pub fn store_response(&mut self, name: &str, raw: &RawResponse) -> EnvoyResult<()> {
        let value = match name {
            DEVICE_DATA => parse_device_data(&raw.json()?)?,
            DEVSTATUS => parse_devstatus(&raw.json()?),
            _ if raw.is_xml() => xml_to_value(&raw.body)?,
            _ if raw.is_json() => raw.json()?,
            _ => Value::String(raw.body.clone()),
        };

        if name == METERS || name == METERS_READINGS {
            let merged = merge_meters(self.store.get(METERS_READINGS), &value);
            self.store.insert(METERS_READINGS.to_string(), merged);
            if name == METERS {
                self.store.insert(METERS.to_string(), value);
            }
        } else {
            self.store.insert(name.to_string(), value);
        }
        Ok(())
    }
}
