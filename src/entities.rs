//! Projection of a [`DeviceSnapshot`] into the entities a home-automation host exposes.

use crate::models::cosa::PresetTemperatures;
use crate::models::snapshot::{DeviceSnapshot, HvacAction, HvacMode, OutdoorConditions, Preset};
use crate::services::sync::{
    CALIBRATION_STEP_C, MAX_CALIBRATION_C, MAX_TEMP_C, MIN_CALIBRATION_C, MIN_TEMP_C, TEMP_STEP_C,
};
use crate::utils::{fmt_opt, serde_enum_name};
use serde::Serialize;

const CELSIUS: &str = "°C";
const PERCENT: &str = "%";
const HOURS: &str = "h";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateAttributes {
    pub mode: Option<String>,
    pub option: Option<String>,
    pub combi_state: Option<String>,
    pub operation_mode: Option<String>,
    pub power_state: Option<String>,
    pub preset_temperatures: PresetTemperatures,
    pub firmware_version: Option<String>,
    pub battery_voltage: Option<f64>,
    pub rssi: Option<i64>,
    pub child_lock: Option<bool>,
    pub open_window: Option<bool>,
    pub outdoor: OutdoorConditions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateEntity {
    pub name: Option<String>,
    pub available: bool,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub current_humidity: Option<i64>,
    pub hvac_mode: Option<HvacMode>,
    pub hvac_modes: [HvacMode; 2],
    pub hvac_action: Option<HvacAction>,
    pub preset_mode: Option<Preset>,
    pub preset_modes: [Preset; 6],
    pub min_temp: f64,
    pub max_temp: f64,
    pub target_temp_step: f64,
    pub attributes: ClimateAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorEntity {
    pub key: String,
    pub available: bool,
    pub value: Option<f64>,
    pub unit: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchEntity {
    pub key: &'static str,
    pub available: bool,
    pub is_on: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberEntity {
    pub key: &'static str,
    pub available: bool,
    pub value: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStates {
    pub climate: ClimateEntity,
    pub sensors: Vec<SensorEntity>,
    pub switches: Vec<SwitchEntity>,
    pub numbers: Vec<NumberEntity>,
}

impl EntityStates {
    pub fn sensor(&self, key: &str) -> Option<&SensorEntity> {
        self.sensors.iter().find(|s| s.key == key)
    }

    /// One-line rendering for the log.
    pub fn summary(&self) -> String {
        let c = &self.climate;
        format!(
            "{} {}: {}°C -> {}°C, {}% rh, mode={} action={} preset={}",
            c.name.as_deref().unwrap_or("thermostat"),
            if c.available { "online" } else { "unavailable" },
            fmt_opt(c.current_temperature),
            fmt_opt(c.target_temperature),
            fmt_opt(c.current_humidity),
            fmt_opt(c.hvac_mode.as_ref().and_then(serde_enum_name)),
            fmt_opt(c.hvac_action.as_ref().and_then(serde_enum_name)),
            fmt_opt(c.preset_mode.map(Preset::as_str)),
        )
    }
}

fn climate(snapshot: &DeviceSnapshot, available: bool) -> ClimateEntity {
    ClimateEntity {
        name: snapshot.name.clone(),
        available,
        current_temperature: snapshot.current_temperature,
        target_temperature: snapshot.target_temperature,
        current_humidity: snapshot.humidity.map(|h| h.round() as i64),
        hvac_mode: snapshot.hvac_mode,
        hvac_modes: [HvacMode::Heat, HvacMode::Off],
        hvac_action: snapshot.hvac_action,
        preset_mode: snapshot.preset,
        preset_modes: Preset::SELECTABLE,
        min_temp: MIN_TEMP_C,
        max_temp: MAX_TEMP_C,
        target_temp_step: TEMP_STEP_C,
        attributes: ClimateAttributes {
            mode: snapshot.mode.as_ref().and_then(serde_enum_name),
            option: snapshot.option.as_ref().and_then(serde_enum_name),
            combi_state: snapshot.hvac_action.map(|a| {
                match a {
                    HvacAction::Heating => "on",
                    HvacAction::Idle => "off",
                }
                .to_string()
            }),
            operation_mode: snapshot.operation_mode.clone(),
            power_state: snapshot.power_state.clone(),
            preset_temperatures: snapshot.preset_temperatures,
            firmware_version: snapshot.firmware_version.clone(),
            battery_voltage: snapshot.battery_voltage,
            rssi: snapshot.rssi,
            child_lock: snapshot.child_lock,
            open_window: snapshot.open_window,
            outdoor: snapshot.outdoor.clone(),
        },
    }
}

fn sensors(snapshot: &DeviceSnapshot, available: bool) -> Vec<SensorEntity> {
    let stats = &snapshot.stats;
    let mut out = Vec::new();
    let mut push = |key: &str, value: Option<f64>, unit: &'static str| {
        out.push(SensorEntity {
            key: key.to_string(),
            available: available && value.is_some(),
            value,
            unit,
        });
    };

    push("temperature", snapshot.current_temperature, CELSIUS);
    push("humidity", snapshot.humidity, PERCENT);
    push("outdoor_temperature", snapshot.outdoor.temperature, CELSIUS);
    push("outdoor_humidity", snapshot.outdoor.humidity, PERCENT);
    push("runtime_24h", stats.runtime_hours, HOURS);
    for (mode, hours) in &stats.runtime_by_mode {
        push(&format!("runtime_24h_{}", mode), Some(*hours), HOURS);
    }
    push("temperature_min_24h", stats.temperature_min, CELSIUS);
    push("temperature_max_24h", stats.temperature_max, CELSIUS);
    push("temperature_avg_24h", stats.temperature_avg, CELSIUS);
    push("humidity_min_24h", stats.humidity_min, PERCENT);
    push("humidity_max_24h", stats.humidity_max, PERCENT);
    push("humidity_avg_24h", stats.humidity_avg, PERCENT);
    push("outdoor_temperature_avg_24h", stats.outdoor_temperature_avg, CELSIUS);
    push("network_quality", stats.network_quality, PERCENT);
    out
}

pub fn project(snapshot: &DeviceSnapshot, available: bool) -> EntityStates {
    EntityStates {
        climate: climate(snapshot, available),
        sensors: sensors(snapshot, available),
        switches: vec![
            SwitchEntity {
                key: "child_lock",
                available: available && snapshot.child_lock.is_some(),
                is_on: snapshot.child_lock,
            },
            SwitchEntity {
                key: "open_window_detection",
                available: available && snapshot.open_window_detection.is_some(),
                is_on: snapshot.open_window_detection,
            },
        ],
        numbers: vec![NumberEntity {
            key: "calibration",
            available: available && snapshot.calibration_offset.is_some(),
            value: snapshot.calibration_offset,
            min: MIN_CALIBRATION_C,
            max: MAX_CALIBRATION_C,
            step: CALIBRATION_STEP_C,
            unit: CELSIUS,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::snapshot_from_remote;
    use crate::models::cosa::{Endpoint, RemoteState, Reports};

    fn fixture_snapshot() -> DeviceSnapshot {
        let detail = std::fs::read_to_string("tests/data/endpoint-detail.json").expect("fixture present");
        let detail: serde_json::Value = serde_json::from_str(&detail).unwrap();
        let endpoint: Endpoint = serde_json::from_value(detail["endpoint"].clone()).unwrap();
        let reports = std::fs::read_to_string("tests/data/reports.json").expect("fixture present");
        let reports: serde_json::Value = serde_json::from_str(&reports).unwrap();
        let reports: Reports = serde_json::from_value(reports["reports"].clone()).unwrap();
        snapshot_from_remote(&RemoteState {
            endpoint,
            reports: Some(reports),
            forecast: None,
        })
    }

    #[test]
    fn climate_entity_from_fixture() {
        let states = project(&fixture_snapshot(), true);
        let c = &states.climate;
        assert!(c.available);
        assert_eq!(c.current_temperature, Some(26.5));
        assert_eq!(c.target_temperature, Some(26.6));
        assert_eq!(c.current_humidity, Some(53));
        assert_eq!(c.hvac_mode, Some(HvacMode::Heat));
        assert_eq!(c.hvac_action, Some(HvacAction::Heating));
        assert_eq!(c.preset_mode, Some(Preset::Schedule));
        assert!(!c.preset_modes.contains(&Preset::Frozen));
        assert_eq!((c.min_temp, c.max_temp, c.target_temp_step), (5.0, 32.0, 0.5));
        assert_eq!(c.attributes.mode.as_deref(), Some("schedule"));
        assert_eq!(c.attributes.option.as_deref(), Some("sleep"));
        assert_eq!(c.attributes.combi_state.as_deref(), Some("on"));
        assert_eq!(c.attributes.operation_mode.as_deref(), Some("heating"));
        assert_eq!(c.attributes.power_state.as_deref(), Some("mains"));
        assert_eq!(c.attributes.firmware_version.as_deref(), Some("2.4.1"));
    }

    #[test]
    fn sensors_switches_and_numbers() {
        let states = project(&fixture_snapshot(), true);
        assert_eq!(states.sensor("runtime_24h").and_then(|s| s.value), Some(6.25));
        assert_eq!(states.sensor("runtime_24h_sleep").and_then(|s| s.value), Some(2.25));
        assert_eq!(states.sensor("humidity_avg_24h").and_then(|s| s.value), Some(47.9));
        let outdoor = states.sensor("outdoor_humidity").unwrap();
        assert!(!outdoor.available);

        assert_eq!(states.switches[0].key, "child_lock");
        assert_eq!(states.switches[0].is_on, Some(false));
        assert_eq!(states.switches[1].is_on, Some(true));

        let calibration = &states.numbers[0];
        assert_eq!(calibration.value, Some(-0.5));
        assert_eq!((calibration.min, calibration.max, calibration.step), (-5.0, 5.0, 0.1));
    }

    #[test]
    fn everything_unavailable_when_polls_fail() {
        let states = project(&fixture_snapshot(), false);
        assert!(!states.climate.available);
        assert!(states.sensors.iter().all(|s| !s.available));
        assert!(states.switches.iter().all(|s| !s.available));
        assert!(!states.numbers[0].available);
        assert!(states.summary().contains("unavailable"));
    }

    #[test]
    fn summary_and_json_rendering() {
        let states = project(&fixture_snapshot(), true);
        assert_eq!(
            states.summary(),
            "Evim online: 26.5°C -> 26.6°C, 53% rh, mode=heat action=heating preset=schedule"
        );
        let json = serde_json::to_value(&states).unwrap();
        assert_eq!(json["climate"]["preset_mode"], "schedule");
        assert_eq!(json["climate"]["hvac_modes"], serde_json::json!(["heat", "off"]));
        assert_eq!(json["numbers"][0]["key"], "calibration");
    }

    #[test]
    fn empty_snapshot_projects_cleanly() {
        let states = project(&DeviceSnapshot::default(), true);
        assert_eq!(states.climate.current_humidity, None);
        assert!(!states.switches[0].available);
        assert_eq!(
            states.summary(),
            "thermostat online: -°C -> -°C, -% rh, mode=- action=- preset=-"
        );
    }
}
