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

//! Device profiles and metric resolution
//!
//! A [`DeviceProfile`] is chosen once per session from the capability probe
//! and owns a metric table composed from ordered layers:
//!
//! - base: production from the inverters, batteries, inventory, tariff
//! - consumption: CT consumption and net-consumption totals and phases
//! - CT detail: per-phase electrical readings from the production report
//!
//! Later layers replace entries of earlier ones. A metric is either a path
//! into the raw endpoint store (optionally different for installer tokens) or
//! a computed accessor.

use crate::endpoints::{
    ENSEMBLE_INVENTORY, ENSEMBLE_POWER, INVENTORY, METERS, METERS_READINGS, PRODUCTION_INVERTERS,
    PRODUCTION_JSON, PRODUCTION_POWER, PRODUCTION_V1,
};
use crate::errors::EnvoyResult;
use crate::path::PathExpr;
use chrono::{Local, TimeZone};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, trace};

pub const PHASES: [&str; 3] = ["l1", "l2", "l3"];

/// Negative production above this (exclusive) is relay self-consumption noise.
pub const NEGATIVE_PRODUCTION_FLOOR: f64 = -15.0;

const PRODUCTION_CT: &str = "production_json.production[?(@.type=='eim' && @.activeCount > 0)]";
const CONSUMPTION_CT: &str =
    "production_json.consumption[?(@.measurementType == 'total-consumption' && @.activeCount > 0)]";
const NET_CONSUMPTION_CT: &str =
    "production_json.consumption[?(@.measurementType == 'net-consumption' && @.activeCount > 0)]";
const INVERTERS_ENTRY: &str = "production_json.production[?(@.type=='inverters')]";

// metric family, field suffix
const CONSUMPTION_FIELDS: &[(&str, &str)] = &[
    ("consumption", ".wNow"),
    ("daily_consumption", ".whToday"),
    ("lifetime_consumption", ".whLifetime"),
];

const NET_CONSUMPTION_FIELDS: &[(&str, &str)] = &[
    ("net_consumption", ".wNow"),
    ("daily_net_consumption", ".whToday"),
    ("lifetime_net_consumption", ".whLifetime"),
];

const REPORT_FIELDS: &[(&str, &str)] = &[
    ("production", ".currW"),
    ("lifetime_production", ".whDlvdCum"),
    ("voltage", ".rmsVoltage"),
    ("ampere", ".rmsCurrent"),
    ("apparent_power", ".apprntPwr"),
    ("power_factor", ".pwrFactor"),
    ("reactive_power", ".reactPwr"),
    ("frequency", ".freqHz"),
];

// metric family, meter measurement type, reading field
const METER_READING_FIELDS: &[(&str, &str, &str)] = &[
    ("lifetime_net_production", "net-consumption", "actEnergyRcvd"),
    ("lifetime_batteries_charged", "storage", "actEnergyRcvd"),
    ("lifetime_batteries_discharged", "storage", "actEnergyDlvd"),
];

/// Result of the capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvoyModel {
    /// Production only (`/api/v1/production`)
    Standard,
    /// `production.json` carries production and consumption
    Metered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Standard,
    Metered,
    MeteredWithCt,
}

impl ProfileKind {
    pub fn select(model: EnvoyModel, production_json: Option<&Value>) -> Self {
        if model == EnvoyModel::Standard {
            return Self::Standard;
        }
        let has_active_eim = production_json
            .and_then(|p| p.get("production"))
            .and_then(Value::as_array)
            .is_some_and(|entries| {
                entries.iter().any(|e| {
                    e.get("type").and_then(Value::as_str) == Some("eim")
                        && e.get("activeCount").and_then(Value::as_f64).unwrap_or(0.0) > 0.0
                })
            });
        if has_active_eim {
            Self::MeteredWithCt
        } else {
            Self::Metered
        }
    }

    pub fn alias(self) -> &'static str {
        match self {
            Self::Standard => "Standard",
            Self::Metered => "Metered",
            Self::MeteredWithCt => "Metered (with CT)",
        }
    }
}

/// Path that may differ for installer tokens.
#[derive(Debug, Clone)]
pub enum PathSource {
    Fixed(PathExpr),
    ByTier { owner: PathExpr, installer: PathExpr },
}

impl PathSource {
    pub fn for_tier(&self, installer: bool) -> &PathExpr {
        match self {
            Self::Fixed(path) => path,
            Self::ByTier { installer: path, .. } if installer => path,
            Self::ByTier { owner, .. } => owner,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Accessor {
    EnvoyInfo,
    LifetimeProduction(PathSource),
    ProductionPower,
    GridStatus,
    InverterProduction,
    InverterInfo,
    RelayInfo,
    InverterDeviceData,
    RelayDeviceData,
    Batteries,
    BatteriesPower,
    AggBatteriesPower,
    MetersReadings,
}

#[derive(Debug, Clone)]
pub enum MetricDef {
    Path(PathSource),
    Computed {
        accessor: Accessor,
        required: Vec<&'static str>,
    },
}

/// Everything a metric needs besides its definition.
#[derive(Debug, Clone, Copy)]
pub struct MetricContext<'a> {
    pub store: &'a Map<String, Value>,
    pub installer: bool,
    pub lifetime_correction: f64,
    pub device_data_endpoint: &'a str,
}

#[derive(Debug, Clone)]
struct AccessorPaths {
    production_power: PathExpr,
    grid_status: PathExpr,
    inverter_production: PathExpr,
    inverter_info: PathExpr,
    relay_info: PathExpr,
    batteries: PathExpr,
    battery_power: PathExpr,
}

impl AccessorPaths {
    fn compile() -> EnvoyResult<Self> {
        Ok(Self {
            production_power: PathExpr::parse("production_power.powerForcedOff")?,
            grid_status: PathExpr::parse(
                "ensemble_inventory.[?(@.type=='ENPOWER')].devices[0].mains_oper_state",
            )?,
            inverter_production: PathExpr::parse("production_inverters.[?(@.devType==1)]")?,
            inverter_info: PathExpr::parse(
                "inventory.[?(@.type=='PCU')].devices[?(@.dev_type==1)]",
            )?,
            relay_info: PathExpr::parse(
                "inventory.[?(@.type=='NSRB')].devices[?(@.dev_type==12)]",
            )?,
            batteries: PathExpr::parse("ensemble_inventory[0].devices")?,
            battery_power: PathExpr::parse("ensemble_power.devices:")?,
        })
    }
}

#[derive(Debug, Default)]
struct TableBuilder {
    metrics: BTreeMap<String, MetricDef>,
}

impl TableBuilder {
    fn path(&mut self, name: &str, expr: &str) -> EnvoyResult<()> {
        let def = MetricDef::Path(PathSource::Fixed(PathExpr::parse(expr)?));
        self.metrics.insert(name.to_string(), def);
        Ok(())
    }

    fn by_tier(&mut self, name: &str, owner: &str, installer: &str) -> EnvoyResult<()> {
        let def = MetricDef::Path(by_tier(owner, installer)?);
        self.metrics.insert(name.to_string(), def);
        Ok(())
    }

    fn computed(&mut self, name: &str, accessor: Accessor, required: &[&'static str]) {
        self.metrics.insert(
            name.to_string(),
            MetricDef::Computed {
                accessor,
                required: required.to_vec(),
            },
        );
    }

    /// `<family>` from `<base><suffix>` and `<family>_lN` from `<base>.lines[N]<suffix>`.
    fn with_phases(&mut self, fields: &[(&str, &str)], base: &str) -> EnvoyResult<()> {
        for &(family, suffix) in fields {
            self.path(family, &format!("{base}{suffix}"))?;
            for (i, phase) in PHASES.iter().enumerate() {
                self.path(
                    &format!("{family}_{phase}"),
                    &format!("{base}.lines[{i}]{suffix}"),
                )?;
            }
        }
        Ok(())
    }
}

fn by_tier(owner: &str, installer: &str) -> EnvoyResult<PathSource> {
    Ok(PathSource::ByTier {
        owner: PathExpr::parse(owner)?,
        installer: PathExpr::parse(installer)?,
    })
}

fn base_layer(t: &mut TableBuilder) -> EnvoyResult<()> {
    t.path("envoy_pn", "info.envoy_info.device.pn")?;
    t.path("has_integrated_meter", "info.envoy_info.device.imeter")?;
    t.path("envoy_software", "info.envoy_info.device.software")?;
    t.path("serial_number", "info.envoy_info.device.sn")?;
    t.path("grid_profile", "installer_agf.selected_profile")?;
    t.path("grid_profiles_available", "installer_agf.profiles")?;
    t.path("polling_interval", "peb_newscan.newDeviceScan.polling-period-secs")?;
    t.computed("envoy_info", Accessor::EnvoyInfo, &[]);

    t.by_tier(
        "production",
        "production_v1.wattsNow",
        "pdm_energy.production.pcu.wattsNow",
    )?;
    t.by_tier(
        "daily_production",
        "production_v1.wattHoursToday",
        "pdm_energy.production.pcu.wattHoursToday",
    )?;
    t.computed(
        "lifetime_production",
        Accessor::LifetimeProduction(by_tier(
            "production_v1.wattHoursLifetime",
            "pdm_energy.production.pcu.wattHoursLifetime",
        )?),
        &[PRODUCTION_V1],
    );
    t.computed("production_power", Accessor::ProductionPower, &[PRODUCTION_POWER]);
    t.computed("grid_status", Accessor::GridStatus, &[ENSEMBLE_INVENTORY]);
    t.computed(
        "inverter_production",
        Accessor::InverterProduction,
        &[PRODUCTION_INVERTERS],
    );
    t.path("pcu_availability", "pcu_comm_check")?;
    t.computed("inverter_info", Accessor::InverterInfo, &[INVENTORY]);
    t.computed("relay_info", Accessor::RelayInfo, &[INVENTORY]);
    t.computed("inverter_device_data", Accessor::InverterDeviceData, &[]);
    t.computed("relay_device_data", Accessor::RelayDeviceData, &[]);

    t.computed("batteries", Accessor::Batteries, &[ENSEMBLE_INVENTORY]);
    t.computed("batteries_power", Accessor::BatteriesPower, &[ENSEMBLE_POWER]);
    t.computed("agg_batteries_power", Accessor::AggBatteriesPower, &[ENSEMBLE_POWER]);
    t.path(
        "agg_batteries_capacity",
        "ensemble_secctrl.Enc_max_available_capacity",
    )?;
    t.path("agg_batteries_soc", "ensemble_secctrl.ENC_agg_soc")?;
    t.path(
        "agg_batteries_available_energy",
        "ensemble_secctrl.ENC_agg_avail_energy",
    )?;

    t.path("tariff", "admin_tariff.tariff")?;
    t.path("storage_mode", "admin_tariff.tariff.storage_settings.mode")?;
    t.path(
        "storage_reserved_soc",
        "admin_tariff.tariff.storage_settings.reserved_soc",
    )?;
    t.path(
        "storage_very_low_soc",
        "admin_tariff.tariff.storage_settings.very_low_soc",
    )?;
    t.path(
        "storage_charge_from_grid",
        "admin_tariff.tariff.storage_settings.charge_from_grid",
    )?;
    Ok(())
}

fn consumption_layer(t: &mut TableBuilder) -> EnvoyResult<()> {
    t.with_phases(CONSUMPTION_FIELDS, CONSUMPTION_CT)?;
    t.with_phases(NET_CONSUMPTION_FIELDS, NET_CONSUMPTION_CT)?;

    t.path("production", &format!("{INVERTERS_ENTRY}.wNow"))?;
    t.path("daily_production", "pdm_energy.production.pcu.wattHoursToday")?;
    t.computed(
        "lifetime_production",
        Accessor::LifetimeProduction(by_tier(
            &format!("{INVERTERS_ENTRY}.whLifetime"),
            "pdm_energy.production.pcu.wattHoursLifetime",
        )?),
        &[PRODUCTION_JSON],
    );
    t.path("voltage", &format!("{PRODUCTION_CT}.rmsVoltage"))?;
    Ok(())
}

fn ct_layer(t: &mut TableBuilder) -> EnvoyResult<()> {
    for &(family, suffix) in REPORT_FIELDS {
        t.path(family, &format!("production_report.cumulative{suffix}"))?;
        for (i, phase) in PHASES.iter().enumerate() {
            t.path(
                &format!("{family}_{phase}"),
                &format!("production_report.lines[{i}]{suffix}"),
            )?;
        }
    }

    // Production totals come from the CT entry of production.json
    t.path("production", &format!("{PRODUCTION_CT}.wNow"))?;
    t.computed(
        "lifetime_production",
        Accessor::LifetimeProduction(PathSource::Fixed(PathExpr::parse(&format!(
            "{PRODUCTION_CT}.whLifetime"
        ))?)),
        &[PRODUCTION_JSON],
    );
    t.path(
        "daily_production",
        "production_json.production[?(@.type=='eim')].whToday",
    )?;
    for (i, phase) in PHASES.iter().enumerate() {
        t.path(
            &format!("daily_production_{phase}"),
            &format!("production_json.production[?(@.type=='eim')].lines[{i}].whToday"),
        )?;
    }

    for &(family, measurement, field) in METER_READING_FIELDS {
        let filter = format!("meters_readings.[?(@.measurementType == '{measurement}' && @.state == 'enabled'");
        t.path(family, &format!("{filter})].{field}"))?;
        for (i, phase) in PHASES.iter().enumerate() {
            t.path(
                &format!("{family}_{phase}"),
                &format!("{filter} && @.phaseCount > {i})].channels[{i}].{field}"),
            )?;
        }
    }

    t.computed("meters_readings", Accessor::MetersReadings, &[METERS, METERS_READINGS]);
    t.path("dpel_enabled", "dpel.dynamic_pel_settings.enable")?;
    Ok(())
}

/// Metric table of the detected device.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    kind: ProfileKind,
    metrics: BTreeMap<String, MetricDef>,
    paths: AccessorPaths,
    initial_update_finished: bool,
    required_cache: Option<BTreeSet<String>>,
}

impl DeviceProfile {
    pub fn new(kind: ProfileKind) -> EnvoyResult<Self> {
        let mut table = TableBuilder::default();
        base_layer(&mut table)?;
        if matches!(kind, ProfileKind::Metered | ProfileKind::MeteredWithCt) {
            consumption_layer(&mut table)?;
        }
        if kind == ProfileKind::MeteredWithCt {
            ct_layer(&mut table)?;
        }

        Ok(Self {
            kind,
            metrics: table.metrics,
            paths: AccessorPaths::compile()?,
            initial_update_finished: false,
            required_cache: None,
        })
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn definition(&self, name: &str) -> Option<&MetricDef> {
        self.metrics.get(name)
    }

    /// Endpoints whose refresh rate this profile raises.
    pub fn ttl_overrides(&self) -> &'static [(&'static str, Duration)] {
        const CT_OVERRIDES: &[(&str, Duration)] = &[
            (PRODUCTION_JSON, Duration::from_secs(60)),
            (PRODUCTION_V1, Duration::from_secs(60)),
        ];
        match self.kind {
            ProfileKind::MeteredWithCt => CT_OVERRIDES,
            ProfileKind::Standard | ProfileKind::Metered => &[],
        }
    }

    pub fn initial_update_finished(&self) -> bool {
        self.initial_update_finished
    }

    pub fn mark_initial_update_finished(&mut self) {
        self.initial_update_finished = true;
    }

    /// Resolve one metric; unknown names give null.
    pub fn get(&self, name: &str, ctx: &MetricContext<'_>) -> Value {
        let value = match self.metrics.get(name) {
            Some(MetricDef::Path(source)) => source
                .for_tier(ctx.installer)
                .resolve_in(ctx.store, Value::Null),
            Some(MetricDef::Computed { accessor, .. }) => self.compute(accessor, ctx),
            None => {
                debug!("Metric {} unknown for {} profile", name, self.kind.alias());
                Value::Null
            }
        };
        trace!("get({}) -> {}", name, value);
        value
    }

    pub fn all_values(&self, ctx: &MetricContext<'_>) -> BTreeMap<String, Value> {
        self.metrics
            .keys()
            .map(|name| (name.clone(), self.get(name, ctx)))
            .collect()
    }

    /// Endpoints the metric table reads from. After the first full update,
    /// metrics that resolved to nothing are dropped and the set is frozen.
    pub fn required_endpoints(&mut self, ctx: &MetricContext<'_>) -> BTreeSet<String> {
        if let Some(cached) = &self.required_cache {
            return cached.clone();
        }

        let mut endpoints = BTreeSet::new();
        for (name, def) in &self.metrics {
            match def {
                MetricDef::Path(source) => {
                    let path = source.for_tier(ctx.installer);
                    if self.initial_update_finished && path.resolve_in(ctx.store, Value::Null).is_null()
                    {
                        continue;
                    }
                    if let Some(head) = path.head() {
                        endpoints.insert(head.to_string());
                    }
                }
                MetricDef::Computed { accessor, required } => {
                    if self.initial_update_finished && is_empty(&self.compute(accessor, ctx)) {
                        trace!("Metric {} is empty, not requiring {:?}", name, required);
                        continue;
                    }
                    endpoints.extend(required.iter().map(|e| (*e).to_string()));
                }
            }
        }

        if self.initial_update_finished {
            debug!("Required endpoints frozen: {:?}", endpoints);
            self.required_cache = Some(endpoints.clone());
        }
        endpoints
    }

    fn compute(&self, accessor: &Accessor, ctx: &MetricContext<'_>) -> Value {
        let store = ctx.store;
        match accessor {
            Accessor::EnvoyInfo => json!({
                "pn": self.get("envoy_pn", ctx),
                "software": self.get("envoy_software", ctx),
                "model": self.kind.alias(),
            }),
            Accessor::LifetimeProduction(source) => {
                let value = source.for_tier(ctx.installer).resolve_in(store, Value::Null);
                add_correction(&value, ctx.lifetime_correction)
            }
            Accessor::ProductionPower => match self.paths.production_power.resolve_in(store, Value::Null) {
                Value::Bool(forced_off) => Value::Bool(!forced_off),
                Value::Number(n) => Value::Bool(n.as_f64() == Some(0.0)),
                _ => Value::Null,
            },
            Accessor::GridStatus => match self.paths.grid_status.resolve_in(store, Value::Null) {
                Value::Null => Value::Null,
                state => Value::Bool(state.as_str() == Some("closed")),
            },
            Accessor::InverterProduction => {
                keyed_by(self.paths.inverter_production.matches_in(store), "serialNumber")
            }
            Accessor::InverterInfo => keyed_by(self.paths.inverter_info.matches_in(store), "serial_num"),
            Accessor::RelayInfo => keyed_by(self.paths.relay_info.matches_in(store), "serial_num"),
            Accessor::InverterDeviceData => device_records(ctx, "pcu"),
            Accessor::RelayDeviceData => device_records(ctx, "nsrb"),
            Accessor::Batteries => batteries(&self.paths.batteries.resolve_in(store, Value::Null)),
            Accessor::BatteriesPower => keyed_by(self.paths.battery_power.matches_in(store), "serial_num"),
            Accessor::AggBatteriesPower => {
                let devices = self.paths.battery_power.matches_in(store);
                if devices.is_empty() {
                    return Value::Null;
                }
                let milliwatts: f64 = devices
                    .iter()
                    .filter_map(|d| d.get("real_power_mw").and_then(Value::as_f64))
                    .sum();
                #[expect(clippy::cast_possible_truncation, reason = "whole watts")]
                let watts = (milliwatts / 1000.0).trunc() as i64;
                json!(watts)
            }
            Accessor::MetersReadings => store.get(METERS_READINGS).cloned().unwrap_or(Value::Null),
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => false,
    }
}

fn add_correction(value: &Value, correction: f64) -> Value {
    match value.as_f64() {
        Some(_) if correction == 0.0 => value.clone(),
        Some(n) => json!(n + correction),
        None => Value::Null,
    }
}

fn key_of(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Map of records keyed by `field`; list matches are expanded, duplicates merged.
fn keyed_by<'a>(found: impl IntoIterator<Item = &'a Value>, field: &str) -> Value {
    let mut map = Map::new();
    let records = found.into_iter().flat_map(|v| match v {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![other],
    });
    for record in records {
        let (Some(key), Value::Object(fields)) = (key_of(record, field), record) else {
            continue;
        };
        match map.get_mut(&key) {
            Some(Value::Object(existing)) => {
                for (k, v) in fields {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                map.insert(key, record.clone());
            }
        }
    }
    Value::Object(map)
}

fn device_records(ctx: &MetricContext<'_>, device_type: &str) -> Value {
    let records = ctx
        .store
        .get(ctx.device_data_endpoint)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|r| r.get("type").and_then(Value::as_str) == Some(device_type))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    keyed_by(records, "sn")
}

fn batteries(devices: &Value) -> Value {
    let Some(devices) = devices.as_array().filter(|d| !d.is_empty()) else {
        return Value::Null;
    };

    let mut map = Map::new();
    for device in devices {
        let Value::Object(fields) = device else { continue };
        let mut battery = fields.clone();
        if let Some(epoch) = fields.get("last_rpt_date").and_then(Value::as_i64)
            && let Some(local) = Local.timestamp_opt(epoch, 0).single()
        {
            battery.insert(
                "report_date".to_string(),
                json!(local.format("%Y-%m-%d %H:%M:%S").to_string()),
            );
        }
        if let (Some(capacity), Some(percent)) = (
            fields.get("encharge_capacity").and_then(Value::as_f64),
            fields.get("percentFull").and_then(Value::as_f64),
        ) {
            battery.insert(
                "encharge_available_energy".to_string(),
                json!(capacity * (percent / 100.0)),
            );
        }
        if let Some(key) = key_of(device, "serial_num") {
            map.insert(key, Value::Object(battery));
        }
    }
    Value::Object(map)
}

/// Small negative production readings become zero when enabled.
pub fn clamp_negative_production(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    match value.as_f64() {
        Some(v) if v > NEGATIVE_PRODUCTION_FLOOR && v < 0.0 => json!(0),
        _ => value,
    }
}
