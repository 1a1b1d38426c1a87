//! A simulated COSA thermostat for offline runs and tests.
//!
//! Each fetch advances the room by one poll interval: the indoor temperature drifts toward the
//! active setpoint while the boiler runs and toward the outdoor temperature while it idles.
//! Faults can be injected to exercise the synchronizer's error paths.

use crate::client::{CosaApi, CosaClientError};
use crate::models::cosa::{
    CombiState, Command, DeviceInfo, Endpoint, Forecast, ForecastHour, MinMaxAvg, Mode, ModeOption,
    PresetTemperatures, RemoteState, Reports, Runtime, TargetTemperatures,
};
use crate::utils::round_to_step;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_SEED: u64 = 0x0C05_A5EE_D000_0001;
pub const ENDPOINT_ID: &str = "sim-66e06d3edac55e12";

const FROST_SETPOINT_C: f64 = 5.0;
const HYSTERESIS_C: f64 = 0.2;
const HEAT_RATE_C: f64 = 0.4;
const LOSS_FACTOR: f64 = 0.01;
const FIRMWARE_VERSION: &str = "sim-2.4.1";

#[derive(Debug, Default, Clone, Copy)]
struct Running {
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
    count: u32,
}

impl Running {
    fn push(&mut self, v: f64) {
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
        self.sum += v;
        self.count += 1;
    }

    fn summary(&self) -> Option<MinMaxAvg> {
        if self.count == 0 {
            return None;
        }
        Some(MinMaxAvg {
            min: self.min.map(|v| round_to_step(v, 0.1)),
            max: self.max.map(|v| round_to_step(v, 0.1)),
            avg: Some(round_to_step(self.sum / self.count as f64, 0.1)),
        })
    }
}

#[derive(Debug)]
struct Device {
    rng: SmallRng,
    mode: Mode,
    option: ModeOption,
    temps: TargetTemperatures,
    room_c: f64,
    humidity: f64,
    outdoor_c: f64,
    combi_on: bool,
    connected: bool,
    child_lock: bool,
    open_window_detection: bool,
    open_window: bool,
    calibration: f64,
    rssi: i64,
    runtime_by_mode: BTreeMap<String, f64>,
    temperature_stats: Running,
    humidity_stats: Running,
    outdoor_stats: Running,
}

impl Device {
    /// Programs keep the option they last selected and heat to that slot.
    fn setpoint(&self) -> f64 {
        match (self.mode, self.option) {
            (Mode::Manual, ModeOption::Frozen) => FROST_SETPOINT_C,
            (_, option) => self.temps.get(option).unwrap_or(self.temps.home),
        }
    }

    fn program_key(&self) -> &'static str {
        match (self.mode, self.option) {
            (Mode::Schedule, _) => "schedule",
            (Mode::Auto, _) => "auto",
            (_, ModeOption::Away) => "away",
            (_, ModeOption::Sleep) => "sleep",
            (_, ModeOption::Custom) => "custom",
            (_, ModeOption::Frozen) => "frozen",
            _ => "home",
        }
    }

    /// Advance the room by `hours`.
    fn step(&mut self, hours: f64) {
        let setpoint = self.setpoint();
        if self.room_c < setpoint - HYSTERESIS_C {
            self.combi_on = true;
        } else if self.room_c >= setpoint + HYSTERESIS_C {
            self.combi_on = false;
        }

        let loss = (self.room_c - self.outdoor_c) * LOSS_FACTOR;
        let gain = if self.combi_on { HEAT_RATE_C } else { 0.0 };
        let noise = self.rng.random_range(-0.03..=0.03);
        self.room_c = (self.room_c + gain - loss + noise).clamp(0.0, 35.0);

        self.humidity = (self.humidity + self.rng.random_range(-0.6..=0.6)).clamp(30.0, 75.0);
        self.outdoor_c = (self.outdoor_c + self.rng.random_range(-0.1..=0.1)).clamp(-12.0, 34.0);
        self.rssi = (self.rssi + self.rng.random_range(-2..=2)).clamp(-90, -40);
        self.open_window = self.open_window_detection && self.rng.random_bool(0.01);

        if self.combi_on {
            let key = self.program_key().to_string();
            *self.runtime_by_mode.entry(key).or_insert(0.0) += hours;
        }
        self.temperature_stats.push(self.room_c);
        self.humidity_stats.push(self.humidity);
        self.outdoor_stats.push(self.outdoor_c);
    }

    fn apply(&mut self, command: &Command) {
        match command {
            Command::SetMode { mode, option } => {
                self.mode = *mode;
                if let Some(o) = option {
                    self.option = *o;
                }
            }
            Command::SetTargetTemperatures(t) => self.temps = *t,
            Command::SetChildLock(on) => self.child_lock = *on,
            Command::SetOpenWindow(on) => self.open_window_detection = *on,
            Command::SetCalibration(v) => self.calibration = *v,
        }
    }

    fn endpoint(&self) -> Endpoint {
        let reported = |v: f64| Some(round_to_step(v, 0.1));
        Endpoint {
            id: Some(ENDPOINT_ID.to_string()),
            name: Some("Simulated COSA".to_string()),
            temperature: reported(self.room_c + self.calibration),
            humidity: reported(self.humidity),
            target_temperature: Some(self.setpoint()),
            mode: Some(self.mode),
            option: Some(self.option),
            operation_mode: Some("heating".to_string()),
            power_state: Some("mains".to_string()),
            combi_state: Some(if self.combi_on { CombiState::On } else { CombiState::Off }),
            is_connected: Some(self.connected),
            target_temperatures: Some(PresetTemperatures::from(self.temps)),
            child_lock: Some(self.child_lock),
            open_window: Some(self.open_window_detection),
            open_window_state: Some(self.open_window),
            calibration: Some(self.calibration),
            device: Some(DeviceInfo {
                version: Some(FIRMWARE_VERSION.to_string()),
            }),
            rssi: Some(self.rssi),
            ..Default::default()
        }
    }

    fn reports(&self) -> Reports {
        let total: f64 = self.runtime_by_mode.values().sum();
        let by_mode = self
            .runtime_by_mode
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(round_to_step(*v, 0.01))))
            .collect();
        Reports {
            runtime: Some(Runtime {
                total: Some(round_to_step(total, 0.01)),
                by_mode,
            }),
            temperature: self.temperature_stats.summary(),
            humidity: self.humidity_stats.summary(),
            outdoor_temperature: self.outdoor_stats.summary(),
            // -90 dBm → 0 %, -40 dBm → 100 %
            network_quality: Some(((self.rssi + 90) * 2) as f64),
        }
    }

    fn forecast(&mut self) -> Forecast {
        let hourly = (0..3)
            .map(|h| ForecastHour {
                temperature: Some(round_to_step(self.outdoor_c + h as f64 * 0.4, 0.1)),
                humidity: Some(round_to_step(self.rng.random_range(60.0..=90.0), 1.0)),
                icon: Some(if self.outdoor_c < 0.0 { "snow" } else { "cloudy" }.to_string()),
            })
            .collect();
        Forecast { hourly: Some(hourly) }
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_fetches: u32,
    fail_writes: u32,
    reject_auth: bool,
    lag_polls: u32,
    /// Accepted writes not yet visible, with the number of fetches they stay hidden for.
    lagged: VecDeque<(u32, Command)>,
}

pub struct SimulatedThermostat {
    device: RefCell<Device>,
    faults: RefCell<Faults>,
    step_hours: f64,
    writes: RefCell<Vec<Command>>,
}

impl SimulatedThermostat {
    /// `poll_interval` sets how much simulated time passes per fetch.
    pub fn new(seed: u64, poll_interval: std::time::Duration) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let outdoor_c = rng.random_range(2.0..=12.0);
        let room_c = rng.random_range(17.0..=20.0);
        let humidity = rng.random_range(40.0..=55.0);
        let rssi = rng.random_range(-70..=-55);
        SimulatedThermostat {
            device: RefCell::new(Device {
                rng,
                mode: Mode::Manual,
                option: ModeOption::Home,
                temps: TargetTemperatures::default(),
                room_c,
                humidity,
                outdoor_c,
                combi_on: false,
                connected: true,
                child_lock: false,
                open_window_detection: true,
                open_window: false,
                calibration: 0.0,
                rssi,
                runtime_by_mode: BTreeMap::new(),
                temperature_stats: Running::default(),
                humidity_stats: Running::default(),
                outdoor_stats: Running::default(),
            }),
            faults: RefCell::new(Faults::default()),
            step_hours: poll_interval.as_secs_f64() / 3_600.0,
            writes: RefCell::new(Vec::new()),
        }
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.faults.borrow_mut().fail_fetches = n;
    }

    /// Reject the next `n` writes with an API error.
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.borrow_mut().fail_writes = n;
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.faults.borrow_mut().reject_auth = reject;
    }

    /// Accept writes but keep reporting the old values for the next `polls` fetches.
    pub fn set_lag_polls(&self, polls: u32) {
        self.faults.borrow_mut().lag_polls = polls;
    }

    pub fn set_connected(&self, connected: bool) {
        self.device.borrow_mut().connected = connected;
    }

    /// Commands the device accepted, in order.
    pub fn writes(&self) -> Vec<Command> {
        self.writes.borrow().clone()
    }

    fn release_lagged(&self) {
        let mut faults = self.faults.borrow_mut();
        let mut device = self.device.borrow_mut();
        let mut still_hidden = VecDeque::new();
        while let Some((remaining, command)) = faults.lagged.pop_front() {
            if remaining == 0 {
                debug!("Simulator: lagged write {:?} now visible", command);
                device.apply(&command);
            } else {
                still_hidden.push_back((remaining - 1, command));
            }
        }
        faults.lagged = still_hidden;
    }
}

impl CosaApi for SimulatedThermostat {
    fn fetch_state(&self) -> Result<RemoteState, CosaClientError> {
        {
            let mut faults = self.faults.borrow_mut();
            if faults.reject_auth {
                return Err(CosaClientError::Auth("simulated credentials rejected".into()));
            }
            if faults.fail_fetches > 0 {
                faults.fail_fetches -= 1;
                return Err(CosaClientError::Transport("simulated network failure".into()));
            }
        }
        self.release_lagged();

        let mut device = self.device.borrow_mut();
        device.step(self.step_hours);
        Ok(RemoteState {
            endpoint: device.endpoint(),
            reports: Some(device.reports()),
            forecast: Some(device.forecast()),
        })
    }

    fn send(&self, command: &Command) -> Result<(), CosaClientError> {
        let mut faults = self.faults.borrow_mut();
        if faults.reject_auth {
            return Err(CosaClientError::Auth("simulated credentials rejected".into()));
        }
        if faults.fail_writes > 0 {
            faults.fail_writes -= 1;
            return Err(CosaClientError::Api { code: "sim".into() });
        }
        self.writes.borrow_mut().push(command.clone());
        if faults.lag_polls > 0 {
            let lag = faults.lag_polls;
            faults.lagged.push_back((lag, command.clone()));
        } else {
            self.device.borrow_mut().apply(command);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping;
    use crate::models::snapshot::{Field, FieldValue, HvacAction, HvacMode, Preset};
    use crate::services::sync::{StateSynchronizer, SyncError};
    use chrono::{DateTime, Utc};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    fn sim() -> SimulatedThermostat {
        SimulatedThermostat::new(DEFAULT_SEED, Duration::from_secs(600))
    }

    #[test]
    fn same_seed_gives_same_readings() {
        let a = sim();
        let b = sim();
        for _ in 0..5 {
            assert_eq!(a.fetch_state().unwrap(), b.fetch_state().unwrap());
        }
    }

    #[test]
    fn room_heats_toward_setpoint() {
        let s = sim();
        s.send(&Command::SetTargetTemperatures(TargetTemperatures {
            home: 24.0,
            ..TargetTemperatures::default()
        }))
        .unwrap();

        let first = s.fetch_state().unwrap();
        assert_eq!(first.endpoint.combi_state, Some(CombiState::On));
        let mut last = first.endpoint.temperature.unwrap();
        for _ in 0..200 {
            last = s.fetch_state().unwrap().endpoint.temperature.unwrap();
        }
        assert!((last - 24.0).abs() < 1.0, "room settled at {last}");
        let reports = s.fetch_state().unwrap().reports.unwrap();
        let runtime = reports.runtime.unwrap();
        assert!(runtime.total.unwrap() > 0.0);
        assert!(runtime.by_mode.contains_key("home"));
    }

    #[test]
    fn off_means_manual_frozen() {
        let s = sim();
        s.send(&Command::SetMode {
            mode: Mode::Manual,
            option: Some(ModeOption::Frozen),
        })
        .unwrap();
        let snap = mapping::snapshot_from_remote(&s.fetch_state().unwrap());
        assert_eq!(snap.hvac_mode, Some(HvacMode::Off));
        assert_eq!(snap.preset, Some(Preset::Frozen));
        assert_eq!(snap.target_temperature, Some(FROST_SETPOINT_C));
        assert_eq!(snap.hvac_action, Some(HvacAction::Idle));
    }

    #[test]
    fn injected_faults_are_one_shot() {
        let s = sim();
        s.fail_next_fetches(1);
        assert!(s.fetch_state().unwrap_err().is_transient());
        assert!(s.fetch_state().is_ok());

        s.fail_next_writes(1);
        assert!(s.send(&Command::SetChildLock(true)).is_err());
        assert!(s.send(&Command::SetChildLock(true)).is_ok());
        assert_eq!(s.writes(), vec![Command::SetChildLock(true)]);

        s.set_reject_auth(true);
        assert!(s.fetch_state().unwrap_err().is_auth());
    }

    #[test]
    fn lagged_write_stays_hidden_for_n_polls() {
        let s = sim();
        s.set_lag_polls(2);
        s.send(&Command::SetChildLock(true)).unwrap();
        assert_eq!(s.fetch_state().unwrap().endpoint.child_lock, Some(false));
        assert_eq!(s.fetch_state().unwrap().endpoint.child_lock, Some(false));
        assert_eq!(s.fetch_state().unwrap().endpoint.child_lock, Some(true));
    }

    #[test]
    fn synchronizer_rides_out_cloud_lag() {
        let s = sim();
        s.set_lag_polls(1);
        let now = Rc::new(Cell::new(DateTime::<Utc>::from_timestamp(1_750_000_000, 0).unwrap()));
        let clock = now.clone();
        let mut sync = StateSynchronizer::new(s, chrono::Duration::seconds(30)).with_clock(move || clock.get());
        sync.poll().unwrap();

        sync.set_target(Field::Preset, FieldValue::Preset(Preset::Sleep)).unwrap();
        now.set(now.get() + chrono::Duration::seconds(10));
        sync.poll().unwrap();
        assert_eq!(sync.snapshot().preset, Some(Preset::Sleep));
        assert!(sync.pending_for(Field::Preset).is_some());

        now.set(now.get() + chrono::Duration::seconds(10));
        sync.poll().unwrap();
        assert_eq!(sync.snapshot().preset, Some(Preset::Sleep));
        assert!(sync.pending_for(Field::Preset).is_none());
    }

    #[test]
    fn synchronizer_reverts_rejected_calibration() {
        let s = sim();
        let mut sync = StateSynchronizer::new(s, chrono::Duration::seconds(30));
        sync.poll().unwrap();
        sync.api().fail_next_writes(1);

        let err = sync
            .set_target(Field::Calibration, FieldValue::Offset(1.5))
            .unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected { .. }));
        assert_eq!(sync.snapshot().calibration_offset, Some(0.0));
        assert!(sync.api().writes().is_empty());
    }

    #[test]
    fn listeners_see_availability_drop_on_failed_poll() {
        let s = sim();
        let mut sync = StateSynchronizer::new(s, chrono::Duration::seconds(30));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        sync.on_update(move |_, available| log.borrow_mut().push(available));

        sync.poll().unwrap();
        sync.api().fail_next_fetches(1);
        assert!(matches!(sync.poll().unwrap_err(), SyncError::TransientFetch(_)));
        sync.poll().unwrap();
        assert_eq!(*seen.borrow(), vec![true, false, true]);
    }

    #[test]
    fn schedule_setpoint_lands_in_selected_slot() {
        let s = sim();
        s.send(&Command::SetMode {
            mode: Mode::Manual,
            option: Some(ModeOption::Sleep),
        })
        .unwrap();
        s.send(&Command::SetMode {
            mode: Mode::Schedule,
            option: None,
        })
        .unwrap();
        let mut sync = StateSynchronizer::new(s, chrono::Duration::seconds(30));
        sync.poll().unwrap();
        assert_eq!(sync.snapshot().preset, Some(Preset::Schedule));

        sync.set_target(Field::TargetTemperature, FieldValue::Temperature(23.5)).unwrap();
        sync.poll().unwrap();
        assert!(sync.pending_for(Field::TargetTemperature).is_none());
        assert_eq!(sync.snapshot().target_temperature, Some(23.5));
        assert_eq!(sync.snapshot().preset_temperatures.sleep, Some(23.5));
    }

    #[test]
    fn disconnected_device_reports_unavailable() {
        let s = sim();
        s.set_connected(false);
        let mut sync = StateSynchronizer::new(s, chrono::Duration::seconds(30));
        sync.poll().unwrap();
        assert!(!sync.available());
    }
}
