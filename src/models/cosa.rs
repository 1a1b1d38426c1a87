//! Wire models for the COSA cloud API (`kiwi-api.nuvia.com.tr`).
//!
//! Scope: request bodies and response payloads only.
//!
//! Notes
//! - Every endpoint is a `POST` with a JSON body; responses carry an `ok` flag.
//! - Response structs are deliberately lenient: each field is optional and a value of the
//!   wrong type decodes as `None` instead of failing the whole payload.
//! - Two shapes of per-preset temperatures have been observed in the wild (a nested
//!   `targetTemperatures` object and flat `homeTemperature`-style keys); both are modeled.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Deserialize a field, mapping a value of the wrong type to `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Like [`lenient`], but also accepts numbers encoded as strings (`"21.5"`).
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceId(pub String);

// =====================
// String enums
// =====================

/// Top-level operating program of the thermostat.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manual,
    Auto,
    Schedule,
    #[serde(other)]
    Unknown,
}

/// Sub-option of the `manual` program.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeOption {
    Home,
    Sleep,
    Away,
    Custom,
    /// Frost protection; the device is effectively off.
    Frozen,
    #[serde(other)]
    Unknown,
}

/// Boiler relay state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombiState {
    On,
    Off,
    #[serde(other)]
    Unknown,
}

// =====================
// Requests
// =====================

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct EndpointRequest<'a> {
    pub endpoint: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SetModeRequest<'a> {
    pub endpoint: &'a str,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option: Option<ModeOption>,
}

/// Full set of per-preset setpoints; the API only accepts all four at once.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTemperatures {
    pub home: f64,
    pub away: f64,
    pub sleep: f64,
    pub custom: f64,
}

impl Default for TargetTemperatures {
    fn default() -> Self {
        TargetTemperatures {
            home: 21.0,
            away: 15.0,
            sleep: 19.0,
            custom: 20.0,
        }
    }
}

impl TargetTemperatures {
    pub fn get(&self, option: ModeOption) -> Option<f64> {
        match option {
            ModeOption::Home => Some(self.home),
            ModeOption::Away => Some(self.away),
            ModeOption::Sleep => Some(self.sleep),
            ModeOption::Custom => Some(self.custom),
            ModeOption::Frozen | ModeOption::Unknown => None,
        }
    }

    pub fn slot_mut(&mut self, option: ModeOption) -> &mut f64 {
        match option {
            ModeOption::Away => &mut self.away,
            ModeOption::Sleep => &mut self.sleep,
            ModeOption::Custom => &mut self.custom,
            ModeOption::Home | ModeOption::Frozen | ModeOption::Unknown => &mut self.home,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SetTargetTemperaturesRequest<'a> {
    pub endpoint: &'a str,
    #[serde(rename = "targetTemperatures")]
    pub target_temperatures: TargetTemperatures,
}

#[derive(Debug, Serialize)]
pub struct SetChildLockRequest<'a> {
    pub endpoint: &'a str,
    #[serde(rename = "childLock")]
    pub child_lock: bool,
}

#[derive(Debug, Serialize)]
pub struct SetOpenWindowRequest<'a> {
    pub endpoint: &'a str,
    #[serde(rename = "openWindow")]
    pub open_window: bool,
}

#[derive(Debug, Serialize)]
pub struct SetCalibrationRequest<'a> {
    pub endpoint: &'a str,
    pub calibration: f64,
}

#[derive(Debug, Serialize)]
pub struct ReportsRequest<'a> {
    pub endpoint: &'a str,
    pub range: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ForecastRequest<'a> {
    pub place: &'a str,
}

/// A device control operation, independent of transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode { mode: Mode, option: Option<ModeOption> },
    SetTargetTemperatures(TargetTemperatures),
    SetChildLock(bool),
    SetOpenWindow(bool),
    SetCalibration(f64),
}

// =====================
// Responses
// =====================

/// Per-preset temperatures as reported by the API (any slot may be missing).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PresetTemperatures {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub home: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub away: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sleep: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub custom: Option<f64>,
}

impl PresetTemperatures {
    pub fn get(&self, option: ModeOption) -> Option<f64> {
        match option {
            ModeOption::Home => self.home,
            ModeOption::Away => self.away,
            ModeOption::Sleep => self.sleep,
            ModeOption::Custom => self.custom,
            ModeOption::Frozen | ModeOption::Unknown => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.home.is_none() && self.away.is_none() && self.sleep.is_none() && self.custom.is_none()
    }

    /// Fill missing slots with the defaults the mobile app falls back to.
    pub fn or_defaults(&self) -> TargetTemperatures {
        let d = TargetTemperatures::default();
        TargetTemperatures {
            home: self.home.unwrap_or(d.home),
            away: self.away.unwrap_or(d.away),
            sleep: self.sleep.unwrap_or(d.sleep),
            custom: self.custom.unwrap_or(d.custom),
        }
    }
}

impl From<TargetTemperatures> for PresetTemperatures {
    fn from(t: TargetTemperatures) -> Self {
        PresetTemperatures {
            home: Some(t.home),
            away: Some(t.away),
            sleep: Some(t.sleep),
            custom: Some(t.custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<String>,
}

/// A thermostat ("endpoint") as returned by `getEndpoints` and `getEndpoint`.
///
/// The list variant carries a subset of the detail fields; `device` is a plain id string
/// there and decodes to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(rename = "_id", default, deserialize_with = "lenient")]
    pub object_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humidity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub target_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub mode: Option<Mode>,
    #[serde(default, deserialize_with = "lenient")]
    pub option: Option<ModeOption>,
    #[serde(default, deserialize_with = "lenient")]
    pub operation_mode: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub power_state: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub combi_state: Option<CombiState>,
    #[serde(default, deserialize_with = "lenient")]
    pub is_connected: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub target_temperatures: Option<PresetTemperatures>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub home_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub away_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sleep_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub custom_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub child_lock: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub open_window: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub open_window_state: Option<bool>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub calibration: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub device: Option<DeviceInfo>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub battery_voltage: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub rssi: Option<i64>,
}

impl Endpoint {
    pub fn endpoint_id(&self) -> Option<EndpointId> {
        self.id
            .as_ref()
            .or(self.object_id.as_ref())
            .map(|s| EndpointId(s.clone()))
    }

    /// Per-preset temperatures from whichever shape the response used.
    pub fn preset_temperatures(&self) -> PresetTemperatures {
        let flat = PresetTemperatures {
            home: self.home_temperature,
            away: self.away_temperature,
            sleep: self.sleep_temperature,
            custom: self.custom_temperature,
        };
        match self.target_temperatures {
            Some(nested) => PresetTemperatures {
                home: nested.home.or(flat.home),
                away: nested.away.or(flat.away),
                sleep: nested.sleep.or(flat.sleep),
                custom: nested.custom.or(flat.custom),
            },
            None => flat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MinMaxAvg {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub min: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub max: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avg: Option<f64>,
}

/// Runtime in hours; `total` plus one entry per program/preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Runtime {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total: Option<f64>,
    #[serde(flatten)]
    pub by_mode: BTreeMap<String, Value>,
}

/// Last-24h aggregates returned by `getReports`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Reports {
    #[serde(default, deserialize_with = "lenient")]
    pub runtime: Option<Runtime>,
    #[serde(default, deserialize_with = "lenient")]
    pub temperature: Option<MinMaxAvg>,
    #[serde(default, deserialize_with = "lenient")]
    pub humidity: Option<MinMaxAvg>,
    #[serde(default, deserialize_with = "lenient")]
    pub outdoor_temperature: Option<MinMaxAvg>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub network_quality: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ForecastHour {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humidity: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Forecast {
    #[serde(default, deserialize_with = "lenient")]
    pub hourly: Option<Vec<ForecastHour>>,
}

impl Forecast {
    pub fn current(&self) -> Option<&ForecastHour> {
        self.hourly.as_deref().and_then(|h| h.first())
    }
}

/// Everything one poll gathers for a single endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteState {
    pub endpoint: Endpoint,
    pub reports: Option<Reports>,
    pub forecast: Option<Forecast>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tolerates_wrong_types() {
        let json = r#"{
            "id": "abc",
            "temperature": "21.5",
            "humidity": {"oops": true},
            "mode": "turbo",
            "option": "sleep",
            "device": "65a14f74774cc50932c98980",
            "isConnected": "yes"
        }"#;
        let ep: Endpoint = serde_json::from_str(json).expect("lenient decode");
        assert_eq!(ep.temperature, Some(21.5));
        assert_eq!(ep.humidity, None);
        assert_eq!(ep.mode, Some(Mode::Unknown));
        assert_eq!(ep.option, Some(ModeOption::Sleep));
        assert_eq!(ep.device, None);
        assert_eq!(ep.is_connected, None);
    }

    #[test]
    fn endpoint_id_falls_back_to_object_id() {
        let ep: Endpoint = serde_json::from_str(r#"{"_id": "xyz"}"#).unwrap();
        assert_eq!(ep.endpoint_id(), Some(EndpointId("xyz".into())));

        let ep: Endpoint = serde_json::from_str(r#"{"id": "a", "_id": "b"}"#).unwrap();
        assert_eq!(ep.endpoint_id(), Some(EndpointId("a".into())));
    }

    #[test]
    fn nested_preset_temperatures_take_precedence_over_flat() {
        let ep: Endpoint = serde_json::from_str(
            r#"{"targetTemperatures": {"home": 22, "away": 16}, "homeTemperature": 20, "sleepTemperature": 18.5}"#,
        )
        .unwrap();
        let p = ep.preset_temperatures();
        assert_eq!(p.home, Some(22.0));
        assert_eq!(p.away, Some(16.0));
        assert_eq!(p.sleep, Some(18.5));
        assert_eq!(p.custom, None);
    }

    #[test]
    fn set_mode_request_omits_missing_option() {
        let body = serde_json::to_value(SetModeRequest {
            endpoint: "e1",
            mode: Mode::Schedule,
            option: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"endpoint": "e1", "mode": "schedule"}));

        let body = serde_json::to_value(SetModeRequest {
            endpoint: "e1",
            mode: Mode::Manual,
            option: Some(ModeOption::Frozen),
        })
        .unwrap();
        assert_eq!(body["option"], "frozen");
    }

    #[test]
    fn runtime_collects_per_mode_entries() {
        let r: Runtime = serde_json::from_str(r#"{"total": 5.5, "home": 3.0, "sleep": 2.5}"#).unwrap();
        assert_eq!(r.total, Some(5.5));
        assert_eq!(r.by_mode.len(), 2);
        assert_eq!(r.by_mode.get("home").and_then(|v| v.as_f64()), Some(3.0));
    }
}
