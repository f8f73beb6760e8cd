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

//! Envoy reader: one refresh cycle from authentication to metrics

use crate::auth::{Authenticator, SessionAuthority};
use crate::config::EnvoyConfig;
use crate::endpoints::{EndpointRegistry, EndpointSource, INFO, PRODUCTION_JSON, PRODUCTION_V1, paths};
use crate::errors::{EnvoyError, EnvoyResult};
use crate::fetcher::EndpointFetcher;
use crate::profile::{DeviceProfile, EnvoyModel, MetricContext, ProfileKind, clamp_negative_production};
use crate::storage::TokenStore;
use crate::stream::{DeltaTracker, MeterStream, RealtimeLoop};
use crate::transport::EnvoyTransport;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Polling client for a single Envoy.
///
/// Call [`EnvoyReader::get_data`] (or [`EnvoyReader::refresh_with_timeout`])
/// periodically, then read metrics with [`EnvoyReader::get`].
#[derive(Debug)]
pub struct EnvoyReader {
    pub(crate) config: EnvoyConfig,
    pub(crate) auth: Arc<Authenticator>,
    pub(crate) fetcher: EndpointFetcher,
    model: Option<EnvoyModel>,
    profile: Option<DeviceProfile>,
    always_required: BTreeSet<String>,
    receiving: Arc<AtomicBool>,
}

impl EnvoyReader {
    pub fn new(config: EnvoyConfig, store: Arc<dyn TokenStore>) -> EnvoyResult<Self> {
        config.validate()?;

        let auth = Arc::new(Authenticator::new(&config, store)?);
        let authority: Arc<dyn SessionAuthority> = auth.clone();
        let transport = EnvoyTransport::new(authority, config.request_timeout())?;
        let registry = EndpointRegistry::with_defaults(config.endpoint_source());
        let fetcher = EndpointFetcher::new(registry, transport, config.effective_disabled_endpoints());
        let always_required = BTreeSet::from([config.device_data_source.endpoint().to_string()]);

        if config.fixtures_dir.is_none() && !config.has_credentials() {
            warn!("⚠️ [ENVOY] No Enlighten credentials configured, relying on a stored token");
        }

        info!(
            "🔌 [ENVOY] Reader created for {} ({:?} flow)",
            config.host, config.auth_flow
        );

        Ok(Self {
            config,
            auth,
            fetcher,
            model: None,
            profile: None,
            always_required,
            receiving: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &EnvoyConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    pub fn fetcher(&self) -> &EndpointFetcher {
        &self.fetcher
    }

    pub fn model(&self) -> Option<EnvoyModel> {
        self.model
    }

    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    pub fn profile_kind(&self) -> Option<ProfileKind> {
        self.profile.as_ref().map(DeviceProfile::kind)
    }

    fn uses_fixtures(&self) -> bool {
        matches!(self.fetcher.registry().source(), EndpointSource::Fixtures { .. })
    }

    /// Installer-only endpoints and paths may be used this session.
    pub fn installer_allowed(&self) -> bool {
        if self.uses_fixtures() {
            !self.config.disable_installer_account_use
        } else {
            self.auth.installer_enabled()
        }
    }

    /// Ensure a valid token and session; a no-op when reading fixtures.
    pub async fn authenticate(&self) -> EnvoyResult<()> {
        if self.uses_fixtures() {
            debug!("🔑 [AUTH] Reading fixtures, no authentication needed");
            return Ok(());
        }
        self.auth.ensure_authenticated().await
    }

    /// Probe the capability endpoints and select the device profile.
    pub async fn detect_model(&mut self) -> EnvoyResult<ProfileKind> {
        let installer = self.installer_allowed();

        self.fetcher
            .update_endpoints(&BTreeSet::from([PRODUCTION_JSON.to_string()]), installer)
            .await?;
        let production_json = self.fetcher.data(PRODUCTION_JSON);
        let metered = self.fetcher.state(PRODUCTION_JSON).last_status == Some(200)
            && production_json
                .is_some_and(|p| p.get("production").is_some() && p.get("consumption").is_some());

        let model = if metered {
            EnvoyModel::Metered
        } else {
            self.fetcher
                .update_endpoints(&BTreeSet::from([PRODUCTION_V1.to_string()]), installer)
                .await?;
            if self.fetcher.state(PRODUCTION_V1).last_status != Some(200) {
                return Err(EnvoyError::ModelDetection(format!(
                    "neither production.json nor the v1 production API answered on {}",
                    self.config.host
                )));
            }
            EnvoyModel::Standard
        };

        let kind = ProfileKind::select(model, self.fetcher.data(PRODUCTION_JSON));
        let profile = DeviceProfile::new(kind)?;
        self.fetcher.set_ttl_overrides(profile.ttl_overrides());
        info!("🔍 [ENVOY] Detected {:?} model, using {} profile", model, kind.alias());

        self.model = Some(model);
        self.profile = Some(profile);
        Ok(kind)
    }

    /// Endpoints the next cycle needs: profile metrics plus the device data source.
    pub fn required_endpoints(&mut self) -> BTreeSet<String> {
        let installer = self.installer_allowed();
        let mut endpoints = self.always_required.clone();
        if let Some(profile) = self.profile.as_mut() {
            let ctx = MetricContext {
                store: self.fetcher.store(),
                installer,
                lifetime_correction: self.config.lifetime_production_correction,
                device_data_endpoint: self.config.device_data_source.endpoint(),
            };
            endpoints.extend(profile.required_endpoints(&ctx));
        }
        endpoints
    }

    /// Fetch the given endpoints, or everything currently required.
    pub async fn update_endpoints(&mut self, names: Option<&BTreeSet<String>>) -> EnvoyResult<()> {
        let names = match names {
            Some(names) => names.clone(),
            None => self.required_endpoints(),
        };
        let installer = self.installer_allowed();
        self.fetcher.update_endpoints(&names, installer).await
    }

    /// One full refresh cycle.
    pub async fn get_data(&mut self) -> EnvoyResult<()> {
        self.authenticate().await?;

        if self.profile.is_none() {
            self.detect_model().await?;
        }

        self.update_endpoints(None).await?;

        if let Some(profile) = self.profile.as_mut()
            && !profile.initial_update_finished()
        {
            profile.mark_initial_update_finished();
            debug!("🔄 [ENVOY UPDATE] Initial update finished");
        }
        Ok(())
    }

    /// [`Self::get_data`] bounded by the configured get-data timeout.
    pub async fn refresh_with_timeout(&mut self) -> EnvoyResult<()> {
        let deadline = self.config.getdata_timeout();
        match tokio::time::timeout(deadline, self.get_data()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("⏱️ [ENVOY UPDATE] Refresh did not finish within {:?}", deadline);
                Err(EnvoyError::Timeout(format!(
                    "refresh exceeded {}s",
                    deadline.as_secs()
                )))
            }
        }
    }

    fn metric_context(&self) -> MetricContext<'_> {
        MetricContext {
            store: self.fetcher.store(),
            installer: self.installer_allowed(),
            lifetime_correction: self.config.lifetime_production_correction,
            device_data_endpoint: self.config.device_data_source.endpoint(),
        }
    }

    fn finish_value(&self, name: &str, value: Value) -> Value {
        if name.starts_with("production") {
            clamp_negative_production(value, self.config.disable_negative_production)
        } else {
            value
        }
    }

    /// Current value of a metric; null before the first refresh or when unavailable.
    pub fn get(&self, name: &str) -> Value {
        let Some(profile) = &self.profile else {
            return Value::Null;
        };
        let value = profile.get(name, &self.metric_context());
        self.finish_value(name, value)
    }

    pub fn all_values(&self) -> BTreeMap<String, Value> {
        let Some(profile) = &self.profile else {
            return BTreeMap::new();
        };
        profile
            .all_values(&self.metric_context())
            .into_iter()
            .map(|(name, value)| {
                let value = self.finish_value(&name, value);
                (name, value)
            })
            .collect()
    }

    /// Serial number from `/info.xml`, read directly from the device.
    pub async fn full_serial_number(&self) -> EnvoyResult<Option<String>> {
        let Some(url) = self.fetcher.registry().url(INFO) else {
            return Ok(None);
        };
        let Some(response) = self.fetcher.transport().get(&url).await? else {
            return Ok(None);
        };
        let serial = response
            .body
            .split_once("<sn>")
            .and_then(|(_, rest)| rest.split_once("</sn>"))
            .map(|(sn, _)| sn.trim().to_string())
            .filter(|sn| !sn.is_empty());
        debug!("🔍 [ENVOY] Serial number: {:?}", serial);
        Ok(serial)
    }

    pub fn is_receiving_realtime_data(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Meter stream for this Envoy; needs a completed refresh on a metered
    /// Envoy with CTs.
    pub fn meter_stream(&self) -> EnvoyResult<MeterStream> {
        let supported = self.model == Some(EnvoyModel::Metered)
            && self.profile_kind() == Some(ProfileKind::MeteredWithCt);
        if !supported {
            return Err(EnvoyError::StreamNotSupported);
        }
        let url = self.fetcher.registry().device_url(paths::STREAM_METER)?;
        Ok(MeterStream::new(
            self.fetcher.transport().clone(),
            url,
            Arc::clone(&self.receiving),
        ))
    }

    /// Reconnecting realtime loop configured from this reader's settings.
    pub fn realtime_loop(&self, shutdown: Arc<Notify>) -> EnvoyResult<RealtimeLoop> {
        let tracker = DeltaTracker::new(
            self.config.realtime_throttle(),
            self.config.disable_negative_production,
        );
        Ok(RealtimeLoop::new(
            self.meter_stream()?,
            tracker,
            self.config.stream_reconnect_delay(),
            shutdown,
        ))
    }
}
