//! State synchronizer: polls the thermostat, keeps the typed snapshot, and reconciles
//! optimistic writes with what the next polls report.

use crate::client::{CosaApi, CosaClientError};
use crate::mapping;
use crate::models::snapshot::{DeviceSnapshot, Field, FieldValue, PendingWrite, Preset};
use crate::utils::round_to_step;
use chrono::{DateTime, Utc};
use core::fmt;
use log::{debug, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MIN_TEMP_C: f64 = 5.0;
pub const MAX_TEMP_C: f64 = 32.0;
pub const TEMP_STEP_C: f64 = 0.5;
pub const MIN_CALIBRATION_C: f64 = -5.0;
pub const MAX_CALIBRATION_C: f64 = 5.0;
pub const CALIBRATION_STEP_C: f64 = 0.1;

/// Called with the displayed snapshot and whether its entities are available.
pub type SnapshotListener = Box<dyn Fn(&DeviceSnapshot, bool)>;
pub type Clock = Box<dyn Fn() -> DateTime<Utc>>;

#[derive(Debug)]
pub enum SyncError {
    /// Network failure, timeout, throttling, server-side error or an `ok: 0` envelope;
    /// retried on the next poll.
    TransientFetch(CosaClientError),
    /// The server refused the request outright (a 4xx other than auth). Polling continues,
    /// but the condition will not clear on its own.
    Rejected(CosaClientError),
    /// Credentials were rejected even after re-login.
    Auth(CosaClientError),
    /// The response could not be decoded; the snapshot was left untouched.
    MalformedResponse(CosaClientError),
    /// The device refused a write; the optimistic value has been reverted.
    WriteRejected { field: Field, source: CosaClientError },
    InvalidValue { field: Field, reason: String },
}

impl SyncError {
    fn from_fetch(err: CosaClientError) -> Self {
        if err.is_auth() {
            SyncError::Auth(err)
        } else if err.is_malformed() {
            SyncError::MalformedResponse(err)
        } else if err.is_transient() {
            SyncError::TransientFetch(err)
        } else {
            SyncError::Rejected(err)
        }
    }

    /// Whether the polling loop should keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::Auth(_))
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::TransientFetch(e) => write!(f, "fetch failed: {}", e),
            SyncError::Rejected(e) => write!(f, "request rejected: {}", e),
            SyncError::Auth(e) => write!(f, "authentication failed: {}", e),
            SyncError::MalformedResponse(e) => write!(f, "malformed response: {}", e),
            SyncError::WriteRejected { field, source } => write!(f, "write to {} rejected: {}", field, source),
            SyncError::InvalidValue { field, reason } => write!(f, "invalid value for {}: {}", field, reason),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::TransientFetch(e)
            | SyncError::Rejected(e)
            | SyncError::Auth(e)
            | SyncError::MalformedResponse(e) => Some(e),
            SyncError::WriteRejected { source, .. } => Some(source),
            SyncError::InvalidValue { .. } => None,
        }
    }
}

/// Check a write against the device's limits, normalising it to the accepted step.
pub fn validate(field: Field, value: FieldValue) -> Result<FieldValue, SyncError> {
    let invalid = |reason: String| SyncError::InvalidValue { field, reason };
    if !value.fits(field) {
        return Err(invalid(format!("{} is not a {} value", value, field)));
    }
    match value {
        FieldValue::Temperature(t) => {
            if !t.is_finite() || !(MIN_TEMP_C..=MAX_TEMP_C).contains(&t) {
                return Err(invalid(format!("{} outside {}..={}", t, MIN_TEMP_C, MAX_TEMP_C)));
            }
            Ok(FieldValue::Temperature(round_to_step(t, TEMP_STEP_C)))
        }
        FieldValue::Offset(v) => {
            if !v.is_finite() || !(MIN_CALIBRATION_C..=MAX_CALIBRATION_C).contains(&v) {
                return Err(invalid(format!(
                    "{} outside {}..={}",
                    v, MIN_CALIBRATION_C, MAX_CALIBRATION_C
                )));
            }
            Ok(FieldValue::Offset(round_to_step(v, CALIBRATION_STEP_C)))
        }
        FieldValue::Preset(Preset::Frozen) => Err(invalid("frozen is entered by turning the thermostat off".into())),
        other => Ok(other),
    }
}

pub struct StateSynchronizer<A: CosaApi> {
    api: A,
    /// Everything polls have reported, merged field by field.
    polled: DeviceSnapshot,
    /// `polled` with the pending writes laid over it; what listeners see.
    snapshot: DeviceSnapshot,
    /// Unconfirmed writes, oldest first; at most one per field.
    pending: Vec<PendingWrite>,
    pending_timeout: chrono::Duration,
    listeners: Vec<SnapshotListener>,
    clock: Clock,
    last_poll_ok: bool,
    consecutive_failures: u32,
    refresh_requested: bool,
}

impl<A: CosaApi> StateSynchronizer<A> {
    pub fn new(api: A, pending_timeout: chrono::Duration) -> Self {
        StateSynchronizer {
            api,
            polled: DeviceSnapshot::default(),
            snapshot: DeviceSnapshot::default(),
            pending: Vec::new(),
            pending_timeout,
            listeners: Vec::new(),
            clock: Box::new(Utc::now),
            last_poll_ok: false,
            consecutive_failures: 0,
            refresh_requested: false,
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Register a callback invoked after every visible change, including availability changes.
    pub fn on_update(&mut self, listener: impl Fn(&DeviceSnapshot, bool) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn snapshot(&self) -> &DeviceSnapshot {
        &self.snapshot
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingWrite> {
        self.pending.iter()
    }

    pub fn pending_for(&self, field: Field) -> Option<&PendingWrite> {
        self.pending.iter().find(|pw| pw.field == field)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Entities are available while polls succeed and the device is not reported offline.
    pub fn available(&self) -> bool {
        self.last_poll_ok && self.snapshot.connected != Some(false)
    }

    /// Returns true once after a successful write, asking the loop to poll right away.
    pub fn take_refresh_request(&mut self) -> bool {
        std::mem::take(&mut self.refresh_requested)
    }

    fn notify(&self) {
        let available = self.available();
        for listener in &self.listeners {
            listener(&self.snapshot, available);
        }
    }

    /// Recompute the displayed snapshot from the polled state and the pending writes.
    ///
    /// Writes are laid over in issue order together with the fields their command implies, so
    /// a later write wins where two of them touch the same field.
    fn rebuild(&mut self) {
        let mut view = self.polled.clone();
        for pw in &self.pending {
            let command = mapping::command_for(pw.field, &pw.desired, &view);
            view.apply(pw.field, Some(pw.desired));
            if let Some(command) = command {
                mapping::apply_implied(&mut view, &command);
            }
        }
        self.snapshot = view;
    }

    /// Fetch the device state and merge it into the snapshot.
    pub fn poll(&mut self) -> Result<(), SyncError> {
        let now = (self.clock)();
        let remote = match self.api.fetch_state() {
            Ok(r) => r,
            Err(e) => {
                let was_available = self.available();
                self.last_poll_ok = false;
                self.consecutive_failures += 1;
                let expired = self.expire_pending(now);
                if expired || was_available {
                    self.notify();
                }
                return Err(SyncError::from_fetch(e));
            }
        };

        let fresh = mapping::snapshot_from_remote(&remote);
        self.polled.merge(&fresh);
        self.polled.updated_at = Some(now);
        self.reconcile(&fresh, now);
        self.rebuild();
        if self.consecutive_failures > 0 {
            info!("Poll recovered after {} failure(s)", self.consecutive_failures);
        }
        self.consecutive_failures = 0;
        self.last_poll_ok = true;
        self.notify();
        Ok(())
    }

    /// Settle pending writes against a fresh poll.
    fn reconcile(&mut self, fresh: &DeviceSnapshot, now: DateTime<Utc>) {
        let timeout = self.pending_timeout;
        self.pending.retain_mut(|pw| {
            let field = pw.field;
            let polled = fresh.value_of(field);
            if polled.is_some_and(|v| v.matches(&pw.desired)) {
                debug!("Write {}={} confirmed by poll", field, pw.desired);
                return false;
            }
            if pw.is_expired(now, timeout) {
                info!(
                    "Write {}={} not reflected after {}s; using polled value",
                    field,
                    pw.desired,
                    timeout.num_seconds()
                );
                return false;
            }
            debug!(
                "Write {}={} still pending (poll reported {:?})",
                field, pw.desired, polled
            );
            if polled.is_some() {
                pw.previous = polled;
            }
            true
        });
    }

    /// Drop expired writes without a poll; their fields fall back to the polled values.
    fn expire_pending(&mut self, now: DateTime<Utc>) -> bool {
        let timeout = self.pending_timeout;
        let before = self.pending.len();
        self.pending.retain(|pw| {
            let expired = pw.is_expired(now, timeout);
            if expired {
                info!(
                    "Write {}={} expired unconfirmed; restoring last polled value",
                    pw.field, pw.desired
                );
            }
            !expired
        });
        if self.pending.len() == before {
            return false;
        }
        self.rebuild();
        true
    }

    /// Apply `value` optimistically, then send it to the device.
    ///
    /// Listeners see the new value, and the fields it implies, before the remote call is made.
    /// If the device rejects the write, any write it superseded is restored and the snapshot is
    /// rebuilt without it.
    pub fn set_target(&mut self, field: Field, value: FieldValue) -> Result<(), SyncError> {
        let value = validate(field, value)?;
        let command = mapping::command_for(field, &value, &self.snapshot).ok_or_else(|| SyncError::InvalidValue {
            field,
            reason: format!("no command for {}", value),
        })?;

        let position = self.pending.iter().position(|pw| pw.field == field);
        let replaced = position.map(|i| (i, self.pending.remove(i)));
        self.pending.push(PendingWrite {
            field,
            desired: value,
            previous: self.polled.value_of(field),
            issued_at: (self.clock)(),
        });
        self.rebuild();
        self.notify();

        match self.api.send(&command) {
            Ok(()) => {
                info!("Set {} to {} (awaiting confirmation)", field, value);
                self.refresh_requested = true;
                Ok(())
            }
            Err(e) => {
                warn!("Write {}={} rejected: {}; reverting", field, value, e);
                self.pending.pop();
                if let Some((i, pw)) = replaced {
                    self.pending.insert(i, pw);
                }
                self.rebuild();
                self.notify();
                Err(SyncError::WriteRejected { field, source: e })
            }
        }
    }
}
