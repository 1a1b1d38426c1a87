use crate::client::CosaApi;
use crate::models::snapshot::{Field, FieldValue};
use crate::services::sync::{StateSynchronizer, SyncError};
use log::{error, info, warn};
use std::str::FromStr;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// A write requested by the host (`field=value`).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub field: Field,
    pub value: FieldValue,
}

impl FromStr for WriteRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected field=value, got {:?}", s))?;
        let field = field.parse::<Field>()?;
        let value = field.parse_value(value)?;
        Ok(WriteRequest { field, value })
    }
}

pub fn apply_write<A: CosaApi>(sync: &mut StateSynchronizer<A>, request: &WriteRequest) {
    if let Err(e) = sync.set_target(request.field, request.value) {
        warn!("{}", e);
    }
}

/// Poll on a steady cadence until `max_ticks` polls have run or authentication fails.
///
/// Writes received on `commands` are applied between polls; a successful write cuts the
/// current wait short so its confirmation is fetched right away.
pub fn run_loop<A: CosaApi>(
    sync: &mut StateSynchronizer<A>,
    interval: Duration,
    max_ticks: Option<u64>,
    commands: Option<&Receiver<WriteRequest>>,
) -> Result<(), String> {
    let mut commands = commands;
    let mut ticks: u64 = 0;
    loop {
        let tick_start = Instant::now();

        match sync.poll() {
            Ok(()) => {}
            Err(e @ SyncError::Rejected(_)) => {
                error!("Poll refused by the API ({} in a row): {}", sync.consecutive_failures(), e);
            }
            Err(e) if e.is_recoverable() => {
                warn!("Poll failed ({} in a row): {}", sync.consecutive_failures(), e);
            }
            Err(e) => return Err(format!("poll failed: {}", e)),
        }

        ticks += 1;
        if max_ticks.is_some_and(|max| ticks >= max) {
            return Ok(());
        }

        // Maintain steady cadence
        loop {
            if sync.take_refresh_request() {
                break;
            }
            let elapsed = tick_start.elapsed();
            if elapsed >= interval {
                break;
            }
            let remaining = interval - elapsed;
            let Some(rx) = commands else {
                thread::sleep(remaining);
                break;
            };
            match rx.recv_timeout(remaining) {
                Ok(request) => apply_write(sync, &request),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command input closed; continuing to poll");
                    commands = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{HvacMode, Preset};
    use crate::services::simulate::{DEFAULT_SEED, SimulatedThermostat};
    use std::sync::mpsc;

    fn synchronizer() -> StateSynchronizer<SimulatedThermostat> {
        let sim = SimulatedThermostat::new(DEFAULT_SEED, Duration::from_secs(10));
        StateSynchronizer::new(sim, chrono::Duration::seconds(30))
    }

    #[test]
    fn parses_write_requests() {
        assert_eq!(
            "preset=away".parse::<WriteRequest>().unwrap(),
            WriteRequest {
                field: Field::Preset,
                value: FieldValue::Preset(Preset::Away)
            }
        );
        assert_eq!(
            "hvac_mode=off".parse::<WriteRequest>().unwrap().value,
            FieldValue::HvacMode(HvacMode::Off)
        );
        assert!("preset".parse::<WriteRequest>().is_err());
        assert!("target_temperature=warm".parse::<WriteRequest>().is_err());
    }

    #[test]
    fn stops_after_tick_limit() {
        let mut sync = synchronizer();
        run_loop(&mut sync, Duration::ZERO, Some(3), None).unwrap();
        assert!(sync.available());
        assert_eq!(sync.consecutive_failures(), 0);
    }

    #[test]
    fn transient_failures_do_not_end_the_loop() {
        let mut sync = synchronizer();
        sync.api().fail_next_fetches(2);
        run_loop(&mut sync, Duration::ZERO, Some(3), None).unwrap();
        assert!(sync.available());
        assert!(sync.snapshot().current_temperature.is_some());
    }

    #[test]
    fn auth_failure_ends_the_loop() {
        let mut sync = synchronizer();
        sync.api().set_reject_auth(true);
        let err = run_loop(&mut sync, Duration::ZERO, Some(5), None).unwrap_err();
        assert!(err.contains("authentication"), "{err}");
        assert_eq!(sync.consecutive_failures(), 1);
    }

    #[test]
    fn queued_write_triggers_immediate_refresh() {
        let mut sync = synchronizer();
        let (tx, rx) = mpsc::channel();
        tx.send("preset=sleep".parse::<WriteRequest>().unwrap()).unwrap();

        let started = Instant::now();
        run_loop(&mut sync, Duration::from_secs(30), Some(2), Some(&rx)).unwrap();

        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(sync.snapshot().preset, Some(Preset::Sleep));
        assert!(sync.pending_for(Field::Preset).is_none());
    }

    #[test]
    fn closed_command_channel_falls_back_to_sleeping() {
        let mut sync = synchronizer();
        let (tx, rx) = mpsc::channel::<WriteRequest>();
        drop(tx);
        run_loop(&mut sync, Duration::from_millis(5), Some(2), Some(&rx)).unwrap();
        assert!(sync.available());
    }
}
