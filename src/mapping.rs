//! Translation between COSA wire models and the typed snapshot.
//!
//! Inbound: a [`RemoteState`] becomes a partial [`DeviceSnapshot`] where anything the response
//! did not carry (or carried in an unrecognised form) stays `None`.
//! Outbound: a field write becomes the [`Command`] the API understands.

use crate::models::cosa::{
    CombiState, Command, Endpoint, Forecast, Mode, ModeOption, PresetTemperatures, RemoteState, Reports,
};
use crate::models::snapshot::{DailyStats, DeviceSnapshot, Field, FieldValue, HvacAction, HvacMode, Preset};
use log::debug;

pub fn hvac_mode(mode: Option<Mode>, option: Option<ModeOption>) -> Option<HvacMode> {
    match mode? {
        Mode::Manual if option == Some(ModeOption::Frozen) => Some(HvacMode::Off),
        Mode::Manual | Mode::Auto | Mode::Schedule => Some(HvacMode::Heat),
        Mode::Unknown => None,
    }
}

pub fn hvac_action(combi: Option<CombiState>) -> Option<HvacAction> {
    match combi? {
        CombiState::On => Some(HvacAction::Heating),
        CombiState::Off => Some(HvacAction::Idle),
        CombiState::Unknown => None,
    }
}

fn preset_from_option(option: Option<ModeOption>) -> Option<Preset> {
    match option? {
        ModeOption::Home => Some(Preset::Home),
        ModeOption::Away => Some(Preset::Away),
        ModeOption::Sleep => Some(Preset::Sleep),
        ModeOption::Custom => Some(Preset::Custom),
        ModeOption::Frozen => Some(Preset::Frozen),
        ModeOption::Unknown => None,
    }
}

/// Programs win over options: a thermostat on `schedule` reports the preset `schedule`
/// regardless of which slot the schedule currently selects.
pub fn preset(mode: Option<Mode>, option: Option<ModeOption>) -> Option<Preset> {
    match mode {
        Some(Mode::Schedule) => Some(Preset::Schedule),
        Some(Mode::Auto) => Some(Preset::Auto),
        Some(Mode::Manual) | None => preset_from_option(option),
        Some(Mode::Unknown) => None,
    }
}

pub fn option_for_preset(preset: Preset) -> Option<ModeOption> {
    match preset {
        Preset::Home => Some(ModeOption::Home),
        Preset::Away => Some(ModeOption::Away),
        Preset::Sleep => Some(ModeOption::Sleep),
        Preset::Custom => Some(ModeOption::Custom),
        Preset::Frozen => Some(ModeOption::Frozen),
        Preset::Auto | Preset::Schedule => None,
    }
}

pub fn snapshot_from_endpoint(endpoint: &Endpoint) -> DeviceSnapshot {
    let presets = endpoint.preset_temperatures();
    let target_temperature = endpoint
        .target_temperature
        .or_else(|| endpoint.option.and_then(|o| presets.get(o)));

    if endpoint.mode == Some(Mode::Unknown) || endpoint.option == Some(ModeOption::Unknown) {
        debug!(
            "Unrecognised mode/option on endpoint {:?}; keeping last-known preset",
            endpoint.endpoint_id()
        );
    }

    DeviceSnapshot {
        endpoint_id: endpoint.endpoint_id().map(|id| id.0),
        name: endpoint.name.clone(),
        connected: endpoint.is_connected,
        current_temperature: endpoint.temperature,
        target_temperature,
        humidity: endpoint.humidity,
        hvac_mode: hvac_mode(endpoint.mode, endpoint.option),
        hvac_action: hvac_action(endpoint.combi_state),
        preset: preset(endpoint.mode, endpoint.option),
        mode: endpoint.mode.filter(|m| *m != Mode::Unknown),
        option: endpoint.option.filter(|o| *o != ModeOption::Unknown),
        operation_mode: endpoint.operation_mode.clone(),
        power_state: endpoint.power_state.clone(),
        preset_temperatures: presets,
        child_lock: endpoint.child_lock,
        open_window_detection: endpoint.open_window,
        open_window: endpoint.open_window_state,
        calibration_offset: endpoint.calibration,
        firmware_version: endpoint.device.as_ref().and_then(|d| d.version.clone()),
        rssi: endpoint.rssi,
        battery_voltage: endpoint.battery_voltage,
        ..Default::default()
    }
}

pub fn stats_from_reports(reports: &Reports) -> DailyStats {
    let mut stats = DailyStats::default();
    if let Some(runtime) = reports.runtime.as_ref() {
        stats.runtime_hours = runtime.total;
        stats.runtime_by_mode = runtime
            .by_mode
            .iter()
            .filter_map(|(mode, hours)| hours.as_f64().map(|h| (mode.clone(), h)))
            .collect();
    }
    if let Some(t) = reports.temperature {
        stats.temperature_min = t.min;
        stats.temperature_max = t.max;
        stats.temperature_avg = t.avg;
    }
    if let Some(h) = reports.humidity {
        stats.humidity_min = h.min;
        stats.humidity_max = h.max;
        stats.humidity_avg = h.avg;
    }
    stats.outdoor_temperature_avg = reports.outdoor_temperature.and_then(|o| o.avg);
    stats.network_quality = reports.network_quality;
    stats
}

fn apply_forecast(snapshot: &mut DeviceSnapshot, forecast: &Forecast) {
    if let Some(now) = forecast.current() {
        snapshot.outdoor.temperature = now.temperature;
        snapshot.outdoor.humidity = now.humidity;
        snapshot.outdoor.icon = now.icon.clone();
    }
}

pub fn snapshot_from_remote(remote: &RemoteState) -> DeviceSnapshot {
    let mut snapshot = snapshot_from_endpoint(&remote.endpoint);
    if let Some(reports) = remote.reports.as_ref() {
        snapshot.stats = stats_from_reports(reports);
    }
    if let Some(forecast) = remote.forecast.as_ref() {
        apply_forecast(&mut snapshot, forecast);
    }
    snapshot
}

/// Build the API command for a validated write against the current snapshot.
///
/// Setpoints are written as a full set of four preset temperatures: the slot of the active
/// option receives the new value, the others keep what the device last reported. Programs
/// (`schedule`, `auto`) still report the option they selected, so that slot is the one edited.
pub fn command_for(field: Field, value: &FieldValue, snapshot: &DeviceSnapshot) -> Option<Command> {
    match (field, *value) {
        (Field::TargetTemperature, FieldValue::Temperature(t)) => {
            let mut temps = snapshot.preset_temperatures.or_defaults();
            let slot = match snapshot.option {
                Some(ModeOption::Frozen | ModeOption::Unknown) | None => ModeOption::Home,
                Some(option) => option,
            };
            *temps.slot_mut(slot) = t;
            Some(Command::SetTargetTemperatures(temps))
        }
        (Field::HvacMode, FieldValue::HvacMode(HvacMode::Off)) => Some(Command::SetMode {
            mode: Mode::Manual,
            option: Some(ModeOption::Frozen),
        }),
        (Field::HvacMode, FieldValue::HvacMode(HvacMode::Heat)) => Some(Command::SetMode {
            mode: Mode::Manual,
            option: Some(ModeOption::Home),
        }),
        (Field::Preset, FieldValue::Preset(Preset::Schedule)) => Some(Command::SetMode {
            mode: Mode::Schedule,
            option: None,
        }),
        (Field::Preset, FieldValue::Preset(Preset::Auto)) => Some(Command::SetMode {
            mode: Mode::Auto,
            option: None,
        }),
        (Field::Preset, FieldValue::Preset(p)) => Some(Command::SetMode {
            mode: Mode::Manual,
            option: option_for_preset(p),
        }),
        (Field::ChildLock, FieldValue::Switch(on)) => Some(Command::SetChildLock(on)),
        (Field::OpenWindowDetection, FieldValue::Switch(on)) => Some(Command::SetOpenWindow(on)),
        (Field::Calibration, FieldValue::Offset(v)) => Some(Command::SetCalibration(v)),
        _ => None,
    }
}

/// Carry a command's side effects into the fields derived from it, so an optimistic view never
/// pairs e.g. `hvac_mode=heat` with `preset=frozen`.
pub fn apply_implied(snapshot: &mut DeviceSnapshot, command: &Command) {
    match command {
        Command::SetMode { mode, option } => {
            snapshot.mode = Some(*mode);
            if option.is_some() {
                snapshot.option = *option;
            }
            snapshot.hvac_mode = hvac_mode(snapshot.mode, snapshot.option).or(snapshot.hvac_mode);
            snapshot.preset = preset(snapshot.mode, snapshot.option).or(snapshot.preset);
        }
        Command::SetTargetTemperatures(temps) => {
            snapshot.preset_temperatures = PresetTemperatures::from(*temps);
        }
        Command::SetChildLock(_) | Command::SetOpenWindow(_) | Command::SetCalibration(_) => {}
    }
}
