//! In-memory device state as seen by the host platform.
//!
//! Every attribute is optional: `None` means the value has never been observed and the
//! corresponding entity is "unavailable". Polls merge into the snapshot field by field, so a
//! response that omits a field leaves the last-known value in place.

use crate::models::cosa::{Mode, ModeOption, PresetTemperatures};
use crate::utils::approx_eq;
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Heat,
    Off,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Heating,
    Idle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Home,
    Away,
    Sleep,
    Custom,
    Auto,
    Schedule,
    /// Reported while the device is off (frost protection); not user-selectable.
    Frozen,
}

impl Preset {
    /// Presets offered to the user, in display order.
    pub const SELECTABLE: [Preset; 6] = [
        Preset::Home,
        Preset::Sleep,
        Preset::Away,
        Preset::Custom,
        Preset::Auto,
        Preset::Schedule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Home => "home",
            Preset::Away => "away",
            Preset::Sleep => "sleep",
            Preset::Custom => "custom",
            Preset::Auto => "auto",
            Preset::Schedule => "schedule",
            Preset::Frozen => "frozen",
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" => Ok(Preset::Home),
            "away" => Ok(Preset::Away),
            "sleep" => Ok(Preset::Sleep),
            "custom" => Ok(Preset::Custom),
            "auto" => Ok(Preset::Auto),
            "schedule" => Ok(Preset::Schedule),
            "frozen" => Ok(Preset::Frozen),
            other => Err(format!("unknown preset: {}", other)),
        }
    }
}

/// Attributes that can be written from the platform side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TargetTemperature,
    HvacMode,
    Preset,
    ChildLock,
    OpenWindowDetection,
    Calibration,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::TargetTemperature => "target_temperature",
            Field::HvacMode => "hvac_mode",
            Field::Preset => "preset",
            Field::ChildLock => "child_lock",
            Field::OpenWindowDetection => "open_window_detection",
            Field::Calibration => "calibration",
        }
    }

    /// Parse a textual value into the value type this field carries.
    pub fn parse_value(self, raw: &str) -> Result<FieldValue, String> {
        let raw = raw.trim();
        match self {
            Field::TargetTemperature | Field::Calibration => {
                let v = raw
                    .parse::<f64>()
                    .map_err(|_| format!("{} expects a number, got {:?}", self, raw))?;
                Ok(if self == Field::TargetTemperature {
                    FieldValue::Temperature(v)
                } else {
                    FieldValue::Offset(v)
                })
            }
            Field::HvacMode => match raw.to_ascii_lowercase().as_str() {
                "heat" | "on" => Ok(FieldValue::HvacMode(HvacMode::Heat)),
                "off" => Ok(FieldValue::HvacMode(HvacMode::Off)),
                other => Err(format!("hvac_mode expects heat/off, got {:?}", other)),
            },
            Field::Preset => raw.parse::<Preset>().map(FieldValue::Preset),
            Field::ChildLock | Field::OpenWindowDetection => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(FieldValue::Switch(true)),
                "0" | "false" | "off" => Ok(FieldValue::Switch(false)),
                other => Err(format!("{} expects on/off, got {:?}", self, other)),
            },
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "target_temperature" | "temperature" => Ok(Field::TargetTemperature),
            "hvac_mode" => Ok(Field::HvacMode),
            "preset" | "preset_mode" => Ok(Field::Preset),
            "child_lock" => Ok(Field::ChildLock),
            "open_window_detection" => Ok(Field::OpenWindowDetection),
            "calibration" => Ok(Field::Calibration),
            other => Err(format!("unknown field: {}", other)),
        }
    }
}

/// A typed value for one writable [`Field`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Temperature(f64),
    HvacMode(HvacMode),
    Preset(Preset),
    Switch(bool),
    Offset(f64),
}

impl FieldValue {
    /// Equality with float tolerance; used to decide whether a poll confirms a write.
    pub fn matches(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Temperature(a), FieldValue::Temperature(b)) => approx_eq(*a, *b),
            (FieldValue::Offset(a), FieldValue::Offset(b)) => approx_eq(*a, *b),
            (a, b) => a == b,
        }
    }

    /// Whether this value has the right shape for `field`.
    pub fn fits(&self, field: Field) -> bool {
        matches!(
            (field, self),
            (Field::TargetTemperature, FieldValue::Temperature(_))
                | (Field::HvacMode, FieldValue::HvacMode(_))
                | (Field::Preset, FieldValue::Preset(_))
                | (Field::ChildLock, FieldValue::Switch(_))
                | (Field::OpenWindowDetection, FieldValue::Switch(_))
                | (Field::Calibration, FieldValue::Offset(_))
        )
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Temperature(v) => write!(f, "{:.1}°C", v),
            FieldValue::Offset(v) => write!(f, "{:+.1}°C", v),
            FieldValue::HvacMode(HvacMode::Heat) => f.write_str("heat"),
            FieldValue::HvacMode(HvacMode::Off) => f.write_str("off"),
            FieldValue::Preset(p) => f.write_str(p.as_str()),
            FieldValue::Switch(true) => f.write_str("on"),
            FieldValue::Switch(false) => f.write_str("off"),
        }
    }
}

/// An optimistic local mutation awaiting confirmation by a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub field: Field,
    pub desired: FieldValue,
    /// Last polled value for the field, never an earlier optimistic one.
    pub previous: Option<FieldValue>,
    pub issued_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.issued_at >= timeout
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutdoorConditions {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub icon: Option<String>,
}

/// Aggregates over the last 24 hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DailyStats {
    pub runtime_hours: Option<f64>,
    /// Runtime in hours keyed by program/preset name (`home`, `sleep`, `schedule`, ...).
    pub runtime_by_mode: BTreeMap<String, f64>,
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub temperature_avg: Option<f64>,
    pub humidity_min: Option<f64>,
    pub humidity_max: Option<f64>,
    pub humidity_avg: Option<f64>,
    pub outdoor_temperature_avg: Option<f64>,
    pub network_quality: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceSnapshot {
    pub endpoint_id: Option<String>,
    pub name: Option<String>,
    pub connected: Option<bool>,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub hvac_mode: Option<HvacMode>,
    pub hvac_action: Option<HvacAction>,
    pub preset: Option<Preset>,
    /// Program as the device reports it; `preset` is derived from this and `option`.
    pub mode: Option<Mode>,
    /// Active temperature slot. Under `schedule` or `auto` this is the slot the program selected.
    pub option: Option<ModeOption>,
    pub operation_mode: Option<String>,
    pub power_state: Option<String>,
    pub preset_temperatures: PresetTemperatures,
    pub child_lock: Option<bool>,
    pub open_window_detection: Option<bool>,
    pub open_window: Option<bool>,
    pub calibration_offset: Option<f64>,
    pub firmware_version: Option<String>,
    pub rssi: Option<i64>,
    pub battery_voltage: Option<f64>,
    pub outdoor: OutdoorConditions,
    pub stats: DailyStats,
    pub updated_at: Option<DateTime<Utc>>,
}

fn keep_or_replace<T: Clone>(slot: &mut Option<T>, fresh: &Option<T>) {
    if fresh.is_some() {
        slot.clone_from(fresh);
    }
}

impl DeviceSnapshot {
    /// Overlay every field `fresh` knows about; unknown fields keep their last value.
    pub fn merge(&mut self, fresh: &DeviceSnapshot) {
        keep_or_replace(&mut self.endpoint_id, &fresh.endpoint_id);
        keep_or_replace(&mut self.name, &fresh.name);
        keep_or_replace(&mut self.connected, &fresh.connected);
        keep_or_replace(&mut self.current_temperature, &fresh.current_temperature);
        keep_or_replace(&mut self.target_temperature, &fresh.target_temperature);
        keep_or_replace(&mut self.humidity, &fresh.humidity);
        keep_or_replace(&mut self.hvac_mode, &fresh.hvac_mode);
        keep_or_replace(&mut self.hvac_action, &fresh.hvac_action);
        keep_or_replace(&mut self.preset, &fresh.preset);
        keep_or_replace(&mut self.mode, &fresh.mode);
        keep_or_replace(&mut self.option, &fresh.option);
        keep_or_replace(&mut self.operation_mode, &fresh.operation_mode);
        keep_or_replace(&mut self.power_state, &fresh.power_state);
        keep_or_replace(&mut self.preset_temperatures.home, &fresh.preset_temperatures.home);
        keep_or_replace(&mut self.preset_temperatures.away, &fresh.preset_temperatures.away);
        keep_or_replace(&mut self.preset_temperatures.sleep, &fresh.preset_temperatures.sleep);
        keep_or_replace(&mut self.preset_temperatures.custom, &fresh.preset_temperatures.custom);
        keep_or_replace(&mut self.child_lock, &fresh.child_lock);
        keep_or_replace(&mut self.open_window_detection, &fresh.open_window_detection);
        keep_or_replace(&mut self.open_window, &fresh.open_window);
        keep_or_replace(&mut self.calibration_offset, &fresh.calibration_offset);
        keep_or_replace(&mut self.firmware_version, &fresh.firmware_version);
        keep_or_replace(&mut self.rssi, &fresh.rssi);
        keep_or_replace(&mut self.battery_voltage, &fresh.battery_voltage);

        keep_or_replace(&mut self.outdoor.temperature, &fresh.outdoor.temperature);
        keep_or_replace(&mut self.outdoor.humidity, &fresh.outdoor.humidity);
        keep_or_replace(&mut self.outdoor.icon, &fresh.outdoor.icon);

        let s = &mut self.stats;
        let f = &fresh.stats;
        keep_or_replace(&mut s.runtime_hours, &f.runtime_hours);
        if !f.runtime_by_mode.is_empty() {
            s.runtime_by_mode.clone_from(&f.runtime_by_mode);
        }
        keep_or_replace(&mut s.temperature_min, &f.temperature_min);
        keep_or_replace(&mut s.temperature_max, &f.temperature_max);
        keep_or_replace(&mut s.temperature_avg, &f.temperature_avg);
        keep_or_replace(&mut s.humidity_min, &f.humidity_min);
        keep_or_replace(&mut s.humidity_max, &f.humidity_max);
        keep_or_replace(&mut s.humidity_avg, &f.humidity_avg);
        keep_or_replace(&mut s.outdoor_temperature_avg, &f.outdoor_temperature_avg);
        keep_or_replace(&mut s.network_quality, &f.network_quality);
    }

    pub fn value_of(&self, field: Field) -> Option<FieldValue> {
        match field {
            Field::TargetTemperature => self.target_temperature.map(FieldValue::Temperature),
            Field::HvacMode => self.hvac_mode.map(FieldValue::HvacMode),
            Field::Preset => self.preset.map(FieldValue::Preset),
            Field::ChildLock => self.child_lock.map(FieldValue::Switch),
            Field::OpenWindowDetection => self.open_window_detection.map(FieldValue::Switch),
            Field::Calibration => self.calibration_offset.map(FieldValue::Offset),
        }
    }

    /// Set one writable field. `None` marks it unavailable; a value of the wrong shape is ignored.
    pub fn apply(&mut self, field: Field, value: Option<FieldValue>) {
        match (field, value) {
            (Field::TargetTemperature, None) => self.target_temperature = None,
            (Field::TargetTemperature, Some(FieldValue::Temperature(v))) => self.target_temperature = Some(v),
            (Field::HvacMode, None) => self.hvac_mode = None,
            (Field::HvacMode, Some(FieldValue::HvacMode(m))) => self.hvac_mode = Some(m),
            (Field::Preset, None) => self.preset = None,
            (Field::Preset, Some(FieldValue::Preset(p))) => self.preset = Some(p),
            (Field::ChildLock, None) => self.child_lock = None,
            (Field::ChildLock, Some(FieldValue::Switch(b))) => self.child_lock = Some(b),
            (Field::OpenWindowDetection, None) => self.open_window_detection = None,
            (Field::OpenWindowDetection, Some(FieldValue::Switch(b))) => self.open_window_detection = Some(b),
            (Field::Calibration, None) => self.calibration_offset = None,
            (Field::Calibration, Some(FieldValue::Offset(v))) => self.calibration_offset = Some(v),
            (field, Some(other)) => log::debug!("ignoring {} for field {}", other, field),
        }
    }
}
