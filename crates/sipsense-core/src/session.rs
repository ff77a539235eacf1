//! Per-device session: the ordered pipeline from frame to snapshot.
//!
//! A [`DeviceSession`] owns everything that is specific to one bottle (decoder,
//! freshness window, calibration, tracker, alert engine) and republishes a
//! [`DeviceSnapshot`] whenever any of it changes. All methods are synchronous and are
//! driven by the orchestrator's single pipeline task, so frames are processed strictly
//! in arrival order.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertChange, AlertContext, AlertEngine};
use crate::calibration::{CalibrationEngine, CalibrationProfile, WaterLevelSample};
use crate::config::Config;
use crate::connection::RawFrame;
use crate::error::{DecodeError, Result, SipsenseError};
use crate::storage::Storage;
use crate::telemetry::{Decoded, Freshness, SensorReading, StatusReport, TelemetryDecoder};
use crate::tracking::{local_date, DailyLedger, HydrationTracker, IntakeEvent, Rollover};
use crate::types::{Confidence, ConnectionState, Device, DeviceId};

/// Everything a consumer needs to render one bottle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Identity and link summary.
    pub device: Device,
    /// Current link state.
    pub connection_state: ConnectionState,
    /// Last water level.
    pub latest_sample: Option<WaterLevelSample>,
    /// Last raw distance, including readings that could not be normalised.
    pub latest_distance_mm: Option<u32>,
    /// Today's ledger.
    pub daily_ledger: DailyLedger,
    /// Unacknowledged alerts, oldest first.
    pub active_alerts: Vec<Alert>,
    /// Whether telemetry is arriving within the freshness window.
    pub data_fresh: bool,
    /// Last reported battery level.
    pub battery_percent: Option<u8>,
    /// Last status reply.
    pub diagnostics: Option<StatusReport>,
    /// Malformed frames dropped so far.
    pub rejected_frames: u64,
    /// Whether a calibration profile is active.
    pub calibrated: bool,
}

/// State of one bottle while the process knows about it.
pub struct DeviceSession {
    device: Device,
    decoder: TelemetryDecoder,
    freshness: Freshness,
    stale: bool,
    calibration: CalibrationEngine,
    tracker: HydrationTracker,
    alerts: AlertEngine,
    latest_sample: Option<WaterLevelSample>,
    latest_distance_mm: Option<u32>,
    battery_percent: Option<u8>,
    diagnostics: Option<StatusReport>,
    offline_since: Option<DateTime<Utc>>,
    session_active: bool,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device)
            .field("session_active", &self.session_active)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Load (or create) the persisted state of `device_id`.
    ///
    /// A missing ledger for today is created and saved. A stored profile that fails
    /// validation is ignored and the device starts in fallback mode.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::Storage`] if the stored state cannot be read or the new ledger
    /// cannot be saved.
    pub fn open(
        device_id: DeviceId,
        config: &Config,
        storage: &dyn Storage,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let calibration = CalibrationEngine::new(&config.calibration);
        if let Some(profile) = storage.load_calibration_profile(&device_id)? {
            if let Err(e) = calibration.install(profile) {
                warn!(device_id = %device_id, error = %e, "Ignoring stored calibration profile");
            }
        }

        let today = local_date(config.tracking.tz(), now);
        let ledger = if let Some(ledger) = storage.load_daily_ledger(&device_id, today)? {
            ledger
        } else {
            let ledger = DailyLedger::new(device_id.clone(), today, config.tracking.daily_goal_ml);
            storage.save_daily_ledger(&ledger)?;
            ledger
        };
        let tracker = HydrationTracker::new(&config.tracking, ledger);

        let mut alerts = AlertEngine::new(
            device_id.clone(),
            config.alerts.clone(),
            config.tracking.tz(),
        );
        alerts.restore(storage.load_open_alerts(&device_id)?);

        info!(
            device_id = %device_id,
            calibrated = calibration.is_calibrated(),
            ledger_date = %today,
            total_ml = tracker.ledger().total_ml,
            open_alerts = alerts.active_alerts().len(),
            "Device session opened"
        );

        let device = Device::new(device_id);
        let (snapshot, _) = watch::channel(DeviceSnapshot {
            device: device.clone(),
            connection_state: device.connection_state,
            latest_sample: None,
            latest_distance_mm: None,
            daily_ledger: tracker.ledger().clone(),
            active_alerts: alerts.active_alerts().to_vec(),
            data_fresh: false,
            battery_percent: None,
            diagnostics: None,
            rejected_frames: 0,
            calibrated: calibration.is_calibrated(),
        });

        Ok(Self {
            device,
            decoder: TelemetryDecoder::new(),
            freshness: Freshness::new(config.telemetry.freshness_window_ms),
            stale: false,
            calibration,
            tracker,
            alerts,
            latest_sample: None,
            latest_distance_mm: None,
            battery_percent: None,
            diagnostics: None,
            offline_since: None,
            session_active: false,
            snapshot,
        })
    }

    /// Device id.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device.id
    }

    /// Subscribe to snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    /// Last published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Whether this session owns the open alert `id`.
    #[must_use]
    pub fn owns_alert(&self, id: Uuid) -> bool {
        self.alerts.contains(id)
    }

    /// Calibration engine of the device.
    #[must_use]
    pub const fn calibration(&self) -> &CalibrationEngine {
        &self.calibration
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Apply a link state change for this device.
    pub fn on_connection_state(
        &mut self,
        state: ConnectionState,
        now: DateTime<Utc>,
        storage: &dyn Storage,
    ) {
        if state == self.device.connection_state {
            return;
        }
        let previous = std::mem::replace(&mut self.device.connection_state, state);
        debug!(device_id = %self.device.id, from = %previous, to = %state, "Session saw link change");

        match state {
            ConnectionState::Connected => {
                self.session_active = true;
                self.offline_since = None;
                self.stale = false;
                self.freshness.arm(now);
            }
            ConnectionState::Disconnected => {
                // Only an explicit disconnect (or a first connect that never came up)
                // lands here, so nobody expects the bottle to be online.
                self.session_active = false;
                self.offline_since = None;
                self.freshness.disarm();
            }
            _ => {
                self.freshness.disarm();
                if self.session_active && self.offline_since.is_none() {
                    self.offline_since = Some(now);
                }
            }
        }

        self.evaluate_alerts(now, storage);
        self.publish(now);
    }

    /// Process one frame from the link.
    pub fn on_frame(&mut self, frame: &RawFrame, storage: &dyn Storage) {
        let now = frame.received_at;
        match self.decoder.decode(frame) {
            Ok(Decoded::Reading(reading)) => self.on_reading(&reading, storage),
            Ok(Decoded::Status(report)) => {
                if let Some(level) = report.battery_percent {
                    self.battery_percent = Some(level);
                }
                if let Some(name) = &report.peripheral_name {
                    self.device.display_name = Some(name.clone());
                }
                self.diagnostics = Some(report);
            }
            // Counted and logged by the decoder.
            Ok(Decoded::Fault { .. }) | Err(_) => {}
        }
        self.publish(now);
    }

    /// Periodic housekeeping: midnight rollover, freshness and time-based alert rules.
    pub fn on_tick(&mut self, now: DateTime<Utc>, storage: &dyn Storage) {
        if let Some(rollover) = self.tracker.roll_over(now) {
            self.persist_rollover(&rollover, storage);
        }

        if let Err(DecodeError::Stale { silent_ms }) = self.freshness.check(now) {
            if !self.stale {
                warn!(device_id = %self.device.id, silent_ms, "Telemetry stale");
                self.stale = true;
            }
            if self.session_active && self.offline_since.is_none() {
                let silent = Duration::milliseconds(i64::try_from(silent_ms).unwrap_or(0));
                self.offline_since = Some(now - silent);
            }
        }

        self.evaluate_alerts(now, storage);
        self.publish(now);
    }

    /// Save and activate a new calibration.
    ///
    /// The profile is persisted first; if the save fails the active profile is unchanged.
    /// On success the smoothing state is reset because levels before and after are not
    /// comparable.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::Calibration`] for an invalid profile, [`SipsenseError::Storage`]
    /// if it cannot be saved.
    pub fn calibrate(
        &mut self,
        empty_distance_mm: u32,
        full_distance_mm: u32,
        bottle_volume_ml: f64,
        now: DateTime<Utc>,
        storage: &dyn Storage,
    ) -> Result<CalibrationProfile> {
        let profile = CalibrationProfile::new(
            self.device.id.clone(),
            empty_distance_mm,
            full_distance_mm,
            bottle_volume_ml,
            now,
        )?;
        storage.save_calibration_profile(&profile)?;
        self.calibration.install(profile.clone())?;
        self.tracker.reset_smoothing();
        self.publish(now);
        Ok(profile)
    }

    /// Acknowledge an open alert, persisting first.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::AlertNotFound`] if this session has no such open alert,
    /// [`SipsenseError::Storage`] if the acknowledgment cannot be saved.
    pub fn acknowledge_alert(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
        storage: &dyn Storage,
    ) -> Result<Alert> {
        if !self.alerts.contains(id) {
            return Err(SipsenseError::AlertNotFound(id));
        }
        storage.acknowledge_alert(id, now)?;
        let alert = self
            .alerts
            .acknowledge(id, now)
            .ok_or(SipsenseError::AlertNotFound(id))?;
        self.publish(now);
        Ok(alert)
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    fn on_reading(&mut self, reading: &SensorReading, storage: &dyn Storage) {
        let now = reading.received_at;
        let was_stale = self.stale || self.freshness.check(now).is_err();
        self.freshness.record(now);
        if self.stale {
            info!(device_id = %self.device.id, "Telemetry resumed");
        }
        self.stale = false;
        if self.device.connection_state == ConnectionState::Connected {
            self.offline_since = None;
        }

        self.device.last_seen = Some(now);
        if let Some(name) = &reading.peripheral_name {
            self.device.display_name = Some(name.clone());
        }
        if let Some(level) = reading.battery_percent {
            self.battery_percent = Some(level);
        }
        self.latest_distance_mm = Some(reading.distance_mm);

        let mut sample = match self.calibration.normalize(reading) {
            Ok(sample) => sample,
            Err(e) => {
                debug!(device_id = %self.device.id, error = %e, "Reading not normalised");
                return;
            }
        };
        if was_stale {
            sample.confidence = Confidence::Raw;
        }

        if let Some(rollover) = self.tracker.roll_over(now) {
            self.persist_rollover(&rollover, storage);
        }
        match self.tracker.observe(&sample) {
            Ok(update) => {
                if let Some(rollover) = &update.rollover {
                    self.persist_rollover(rollover, storage);
                }
                if let Some(event) = &update.intake {
                    Self::persist_intake(event, storage);
                }
            }
            Err(e) => error!(device_id = %self.device.id, error = %e, "Drink could not be recorded"),
        }
        self.latest_sample = Some(sample);

        // The sample that ends a stale gap is not used for alerting.
        if !was_stale {
            self.evaluate_alerts(now, storage);
        }
    }

    fn persist_intake(event: &IntakeEvent, storage: &dyn Storage) {
        if let Err(e) = storage.append_intake_event(event) {
            error!(
                device_id = %event.device_id,
                event_id = %event.id,
                amount_ml = event.amount_ml,
                error = %e,
                "Failed to persist intake event"
            );
        }
    }

    fn persist_rollover(&self, rollover: &Rollover, storage: &dyn Storage) {
        for ledger in [&rollover.sealed, &rollover.opened] {
            if let Err(e) = storage.save_daily_ledger(ledger) {
                error!(
                    device_id = %self.device.id,
                    date = %ledger.date,
                    error = %e,
                    "Failed to persist ledger"
                );
            }
        }
    }

    fn evaluate_alerts(&mut self, now: DateTime<Utc>, storage: &dyn Storage) {
        let confidence = self
            .latest_sample
            .as_ref()
            .map_or(Confidence::Raw, |s| s.confidence);
        let changes = self.alerts.evaluate(&AlertContext {
            now,
            connection_state: self.device.connection_state,
            offline_since: self.offline_since,
            session_active: self.session_active,
            data_fresh: self.freshness.is_fresh(now),
            ledger: self.tracker.ledger(),
            last_intake_at: self.tracker.last_intake_at(),
            battery_percent: self.battery_percent,
            confidence,
        });
        for change in &changes {
            let alert = change.alert();
            if let Err(e) = storage.create_alert(alert) {
                error!(
                    device_id = %self.device.id,
                    alert_id = %alert.id,
                    escalated = matches!(change, AlertChange::Escalated(_)),
                    error = %e,
                    "Failed to persist alert"
                );
            }
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        let next = DeviceSnapshot {
            device: self.device.clone(),
            connection_state: self.device.connection_state,
            latest_sample: self.latest_sample.clone(),
            latest_distance_mm: self.latest_distance_mm,
            daily_ledger: self.tracker.ledger().clone(),
            active_alerts: self.alerts.active_alerts().to_vec(),
            data_fresh: self.freshness.is_fresh(now),
            battery_percent: self.battery_percent,
            diagnostics: self.diagnostics.clone(),
            rejected_frames: self.decoder.stats().rejected,
            calibrated: self.calibration.is_calibrated(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
