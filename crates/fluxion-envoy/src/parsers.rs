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

//! Payload normalization applied before responses enter the endpoint store

use crate::errors::{EnvoyError, EnvoyResult};
use crate::path::PathExpr;
use chrono::{Local, TimeZone};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value, json};
use tracing::{debug, trace};

const WH_PER_JOULE: f64 = 0.000277778;

/// Converts an XML document into nested objects: repeated child elements
/// become lists, attributes are prefixed with `@`, text next to children is
/// kept under `#text`, and leaf elements become strings.
pub fn xml_to_value(text: &str) -> EnvoyResult<Value> {
    struct Frame {
        name: String,
        attrs: Map<String, Value>,
        children: Vec<(String, Vec<Value>)>,
        text: String,
    }

    impl Frame {
        fn new(start: &BytesStart<'_>) -> EnvoyResult<Self> {
            let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
            let mut attrs = Map::new();
            for attr in start.attributes() {
                let attr = attr.map_err(|e| EnvoyError::XmlError(e.to_string()))?;
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                let value = attr
                    .unescape_value()
                    .map_err(|e| EnvoyError::XmlError(e.to_string()))?;
                attrs.insert(format!("@{key}"), Value::String(value.into_owned()));
            }
            Ok(Self {
                name,
                attrs,
                children: Vec::new(),
                text: String::new(),
            })
        }

        fn add_child(&mut self, name: String, value: Value) {
            match self.children.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.push(value),
                None => self.children.push((name, vec![value])),
            }
        }

        fn into_value(self) -> (String, Value) {
            let text = self.text.trim().to_string();
            if self.children.is_empty() && self.attrs.is_empty() {
                let value = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                return (self.name, value);
            }

            let mut map = self.attrs;
            for (name, mut values) in self.children {
                let value = if values.len() == 1 {
                    values.pop().unwrap_or(Value::Null)
                } else {
                    Value::Array(values)
                };
                map.insert(name, value);
            }
            if !text.is_empty() {
                map.insert("#text".to_string(), Value::String(text));
            }
            (self.name, Value::Object(map))
        }
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root = Map::new();

    let mut finish = |stack: &mut Vec<Frame>, frame: Frame| {
        let (name, value) = frame.into_value();
        match stack.last_mut() {
            Some(parent) => parent.add_child(name, value),
            None => {
                root.insert(name, value);
            }
        }
    };

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Frame::new(&start)?),
            Event::Empty(start) => {
                let frame = Frame::new(&start)?;
                finish(&mut stack, frame);
            }
            Event::Text(content) => {
                if let Some(frame) = stack.last_mut() {
                    let content = content
                        .unescape()
                        .map_err(|e| EnvoyError::XmlError(e.to_string()))?;
                    frame.text.push_str(&content);
                }
            }
            Event::CData(content) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&content));
                }
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| EnvoyError::XmlError("unbalanced end tag".to_string()))?;
                finish(&mut stack, frame);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(EnvoyError::XmlError("document ended inside an element".to_string()));
    }
    Ok(Value::Object(root))
}

fn local_time_string(epoch: i64) -> Option<String> {
    Local
        .timestamp_opt(epoch, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn milli(value: &Value) -> Value {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .map_or(Value::Null, |v| json!(v / 1000.0))
}

// output field, devstatus column
const DEVSTATUS_PCU_FIELDS: &[(&str, &str)] = &[
    ("sn", "serialNumber"),
    ("type", "devType"),
    ("last_reading", "reportDate"),
    ("temperature", "temperature"),
    ("dc_voltage", "dcVoltageINmV"),
    ("dc_current", "dcCurrentINmA"),
    ("ac_voltage", "acVoltageINmV"),
    ("ac_power", "acPowerINmW"),
    ("gone", "communicating"),
];

/// Zips the column/row layout of `/ivp/peb/devstatus` into one record per
/// micro-inverter.
pub fn parse_devstatus(data: &Value) -> Value {
    let mut devices = Vec::new();
    let Some(pcu) = data.get("pcu") else {
        return Value::Array(devices);
    };

    let fields: Vec<&str> = pcu
        .get("fields")
        .and_then(Value::as_array)
        .map(|f| f.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let columns: Vec<(&str, &str, usize)> = DEVSTATUS_PCU_FIELDS
        .iter()
        .filter_map(|&(out, column)| {
            fields
                .iter()
                .position(|f| *f == column)
                .map(|idx| (out, column, idx))
        })
        .collect();

    let rows = pcu.get("values").and_then(Value::as_array);
    for row in rows.into_iter().flatten() {
        let Some(row) = row.as_array() else { continue };
        let mut device = Map::new();
        for &(out, column, idx) in &columns {
            let Some(value) = row.get(idx) else { continue };
            let normalized = if column.ends_with("mA")
                || column.ends_with("mV")
                || column.ends_with("mHz")
            {
                milli(value)
            } else if out == "type" {
                match value.as_i64() {
                    Some(1) => json!("pcu"),
                    Some(12) => json!("nsrb"),
                    _ => value.clone(),
                }
            } else if out == "gone" {
                Value::Bool(!value.as_bool().unwrap_or(false))
            } else if out == "last_reading" {
                value
                    .as_i64()
                    .and_then(local_time_string)
                    .map_or_else(|| value.clone(), Value::String)
            } else {
                value.clone()
            };
            device.insert(out.to_string(), normalized);
        }
        trace!("Device status record: {:?}", device);
        devices.push(Value::Object(device));
    }

    debug!("Parsed {} device status records", devices.len());
    Value::Array(devices)
}

const DEVICE_DATA_PCU: &[(&str, &str)] = &[
    ("type", "devName"),
    ("sn", "sn"),
    ("active", "active"),
    ("watts", "channels[0].watts.now"),
    ("watts_max", "channels[0].watts.max"),
    ("watt_hours_today", "channels[0].wattHours.today"),
    ("watt_hours_yesterday", "channels[0].wattHours.yesterday"),
    ("watt_hours_week", "channels[0].wattHours.week"),
    ("ac_voltage", "channels[0].lastReading.acVoltageINmV"),
    ("ac_frequency", "channels[0].lastReading.acFrequencyINmHz"),
    ("ac_current", "channels[0].lastReading.acCurrentInmA"),
    ("dc_voltage", "channels[0].lastReading.dcVoltageINmV"),
    ("dc_current", "channels[0].lastReading.dcCurrentINmA"),
    ("temperature", "channels[0].lastReading.channelTemp"),
    ("rssi", "channels[0].lastReading.rssi"),
    ("issi", "channels[0].lastReading.issi"),
    ("lifetime_power", "channels[0].lifetime.joulesProduced"),
    ("conversion_error", "channels[0].lastReading.pwrConvErrSecs"),
    ("conversion_error_cycles", "channels[0].lastReading.pwrConvMaxErrCycles"),
    ("gone", "modGone"),
    ("last_reading", "channels[0].lastReading.endDate"),
    ("last_reading_interval", "channels[0].lastReading.duration"),
];

const DEVICE_DATA_NSRB: &[(&str, &str)] = &[
    ("type", "devName"),
    ("sn", "sn"),
    ("active", "active"),
    ("temperature", "channels[0].lastReading.temperature"),
    ("frequency", "channels[0].lastReading.freqInmHz"),
    ("state_change_count", "channels[0].lastReading.stateChngCnt"),
    ("voltage_l1", "channels[0].lastReading.[voltRmsL1,VrmsL1N]"),
    ("voltage_l2", "channels[0].lastReading.[voltRmsL2,VrmsL2N]"),
    ("voltage_l3", "channels[0].lastReading.[voltRmsL3,VrmsL3N]"),
    ("gone", "modGone"),
    ("last_reading", "channels[0].lastReading.endDate"),
];

/// Flattens `/ivp/pdm/device_data` into one record per active inverter or relay.
pub fn parse_device_data(data: &Value) -> EnvoyResult<Value> {
    let pcu = compile(DEVICE_DATA_PCU)?;
    let nsrb = compile(DEVICE_DATA_NSRB)?;

    let devices: Vec<&Value> = match data {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    };

    let mut records = Vec::new();
    for device in devices {
        if !device.is_object() || device.get("active") != Some(&Value::Bool(true)) {
            continue;
        }
        let table = match device.get("devName").and_then(Value::as_str) {
            Some("pcu") => &pcu,
            Some("nsrb") => &nsrb,
            _ => continue,
        };

        let mut record = Map::new();
        for (field, expr) in table {
            let Some(value) = expr.matches(device).into_iter().next() else {
                continue;
            };
            let source = expr.as_str();
            let normalized = if source.ends_with("mA")
                || source.ends_with("mV")
                || source.ends_with("mHz")
                || field.starts_with("voltage_")
            {
                milli(value)
            } else if source.ends_with("joulesProduced") {
                value.as_f64().map_or(Value::Null, |j| json!(j * WH_PER_JOULE))
            } else {
                value.clone()
            };
            record.insert((*field).to_string(), normalized);
        }
        records.push(Value::Object(record));
    }

    debug!("Parsed {} device data records", records.len());
    Ok(Value::Array(records))
}

fn compile(table: &[(&'static str, &str)]) -> EnvoyResult<Vec<(&'static str, PathExpr)>> {
    table
        .iter()
        .map(|&(field, path)| Ok((field, PathExpr::parse(path)?)))
        .collect()
}

/// Merges meter records by `eid`, later records updating earlier ones.
pub fn merge_meters(existing: Option<&Value>, incoming: &Value) -> Value {
    let mut merged: Vec<Value> = existing
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let Some(incoming) = incoming.as_array() else {
        return Value::Array(merged);
    };

    for record in incoming {
        let eid = record.get("eid");
        let position = merged
            .iter()
            .position(|m| eid.is_some() && m.get("eid") == eid);
        if let (Some(idx), Value::Object(update)) = (position, record)
            && let Some(Value::Object(target)) = merged.get_mut(idx)
        {
            for (key, value) in update {
                target.insert(key.clone(), value.clone());
            }
            continue;
        }
        merged.push(record.clone());
    }
    Value::Array(merged)
}
