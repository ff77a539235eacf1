//! The single entry point for external code.
//!
//! [`Orchestrator`] owns the connection manager and one [`DeviceSession`] per device it
//! has seen. A single pipeline task consumes, in one ordered loop:
//!
//! - raw frames from the link, routed to the session of their device
//! - connection status changes, fanned out to every session
//! - a periodic tick for freshness, midnight rollover and time-based alert rules
//!
//! Consumers read state through per-device snapshot subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::alerts::Alert;
use crate::calibration::CalibrationProfile;
use crate::config::Config;
use crate::connection::{
    ConnectionManager, ConnectionSettings, ConnectionStatus, DiscoveredDevice, RawFrame,
    ScanHandle,
};
use crate::error::{Result, SipsenseError};
use crate::radio::Radio;
use crate::session::{DeviceSession, DeviceSnapshot};
use crate::storage::Storage;
use crate::telemetry::PeripheralCommand;
use crate::types::{ConnectionState, DeviceId};

struct Inner {
    config: Config,
    storage: Arc<dyn Storage>,
    connection: ConnectionManager,
    sessions: Mutex<HashMap<DeviceId, DeviceSession>>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wires link, decoding, calibration, tracking and alerting together.
pub struct Orchestrator {
    inner: Arc<Inner>,
    pipeline: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("connection", &self.inner.connection.status())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the engine and spawn its pipeline task. Must be called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn start(radio: Arc<dyn Radio>, storage: Arc<dyn Storage>, config: &Config) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(config.telemetry.frame_buffer.max(1));
        let connection = ConnectionManager::new(
            radio,
            ConnectionSettings::from(&config.connection),
            frames_tx,
        );
        let status = connection.subscribe();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            config: config.clone(),
            storage,
            connection,
            sessions: Mutex::new(HashMap::new()),
            shutdown: shutdown.clone(),
        });
        let pipeline = tokio::spawn(run_pipeline(
            Arc::downgrade(&inner),
            frames_rx,
            status,
            config.telemetry.tick_interval(),
            shutdown,
        ));
        info!("Orchestrator started");

        Self {
            inner,
            pipeline: std::sync::Mutex::new(Some(pipeline)),
        }
    }

    // -------------------------------------------------------------------------
    // Link
    // -------------------------------------------------------------------------

    /// Start discovery. `None` uses the configured scan window.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::scan`].
    pub async fn scan(&self, timeout: Option<Duration>) -> Result<ScanHandle> {
        Ok(self.inner.connection.scan(timeout).await?)
    }

    /// Stop discovery, keeping the candidates found so far.
    pub async fn stop_scan(&self) {
        self.inner.connection.stop_scan().await;
    }

    /// Candidates from the current or last scan.
    #[must_use]
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.connection.discovered()
    }

    /// Current link status.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Subscribe to link status changes.
    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }

    /// Open the device session (loading its profile, ledger and alerts) and connect.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::Storage`] if the session cannot be opened, otherwise see
    /// [`ConnectionManager::connect`].
    pub async fn connect(&self, device_id: &DeviceId) -> Result<()> {
        self.inner.ensure_session(device_id).await?;
        let result = self.inner.connection.connect(device_id).await;
        self.inner.sync_status().await;
        Ok(result?)
    }

    /// Close the link and stop reconnection.
    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
        self.inner.sync_status().await;
    }

    /// Ask the peripheral for a status reply. The reply shows up as snapshot diagnostics.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::Connection`] without an established link.
    pub async fn request_status(&self) -> Result<()> {
        self.inner
            .connection
            .send_command(PeripheralCommand::GetStatus.as_str())
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Calibrate the device named by the connection status.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::NoActiveDevice`] if no device is selected, otherwise see
    /// [`DeviceSession::calibrate`].
    pub async fn calibrate(
        &self,
        empty_distance_mm: u32,
        full_distance_mm: u32,
        bottle_volume_ml: f64,
    ) -> Result<CalibrationProfile> {
        let device_id = self.active_device()?;
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .get_mut(&device_id)
            .ok_or_else(|| SipsenseError::UnknownDevice(device_id.clone()))?;
        session.calibrate(
            empty_distance_mm,
            full_distance_mm,
            bottle_volume_ml,
            Utc::now(),
            self.inner.storage.as_ref(),
        )
    }

    /// Snapshot stream of a device. Opens its session if needed, so consumers can
    /// subscribe before connecting.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::Storage`] if the session cannot be opened.
    pub async fn subscribe(&self, device_id: &DeviceId) -> Result<watch::Receiver<DeviceSnapshot>> {
        self.inner.ensure_session(device_id).await?;
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(device_id)
            .map(DeviceSession::subscribe)
            .ok_or_else(|| SipsenseError::UnknownDevice(device_id.clone()))
    }

    /// Current snapshot of a known device.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::UnknownDevice`] if no session exists for it.
    pub async fn snapshot(&self, device_id: &DeviceId) -> Result<DeviceSnapshot> {
        self.inner
            .sessions
            .lock()
            .await
            .get(device_id)
            .map(DeviceSession::snapshot)
            .ok_or_else(|| SipsenseError::UnknownDevice(device_id.clone()))
    }

    /// Acknowledge an open alert of any device.
    ///
    /// # Errors
    ///
    /// [`SipsenseError::AlertNotFound`] if no session has it open,
    /// [`SipsenseError::Storage`] if the acknowledgment cannot be saved.
    pub async fn acknowledge_alert(&self, alert_id: Uuid) -> Result<Alert> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .values_mut()
            .find(|s| s.owns_alert(alert_id))
            .ok_or(SipsenseError::AlertNotFound(alert_id))?;
        session.acknowledge_alert(alert_id, Utc::now(), self.inner.storage.as_ref())
    }

    /// Disconnect and stop the pipeline. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.connection.disconnect().await;
        self.inner.shutdown.cancel();
        let pipeline = self
            .pipeline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pipeline) = pipeline {
            let _ = pipeline.await;
            info!("Orchestrator stopped");
        }
    }

    fn active_device(&self) -> Result<DeviceId> {
        self.inner
            .connection
            .status()
            .device_id
            .ok_or(SipsenseError::NoActiveDevice)
    }
}

impl Inner {
    async fn ensure_session(&self, device_id: &DeviceId) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(device_id) {
            let session = DeviceSession::open(
                device_id.clone(),
                &self.config,
                self.storage.as_ref(),
                Utc::now(),
            )?;
            sessions.insert(device_id.clone(), session);
        }
        Ok(())
    }

    /// Apply the current link status to every session.
    async fn sync_status(&self) {
        let status = self.connection.status();
        self.apply_status(&status).await;
    }

    async fn apply_status(&self, status: &ConnectionStatus) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        for (id, session) in sessions.iter_mut() {
            // A session whose device is no longer selected is simply not linked.
            let state = if status.device_id.as_ref() == Some(id) {
                status.state
            } else {
                ConnectionState::Disconnected
            };
            session.on_connection_state(state, now, self.storage.as_ref());
        }
    }

    async fn handle_frame(&self, frame: RawFrame) {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&frame.device_id) {
            Some(session) => session.on_frame(&frame, self.storage.as_ref()),
            None => debug!(device_id = %frame.device_id, "Frame for a device without session"),
        }
    }

    async fn handle_tick(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            session.on_tick(now, self.storage.as_ref());
        }
    }
}

async fn run_pipeline(
    inner: Weak<Inner>,
    mut frames: mpsc::Receiver<RawFrame>,
    mut status: watch::Receiver<ConnectionStatus>,
    tick_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(tick_interval.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            frame = frames.recv() => {
                let (Some(frame), Some(inner)) = (frame, inner.upgrade()) else {
                    break;
                };
                inner.handle_frame(frame).await;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.apply_status(&current).await;
            }
            _ = tick.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_tick().await;
            }
        }
    }
    debug!("Pipeline stopped");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ConnectionError;
    use crate::radio::MockRadio;
    use crate::storage::MemoryStore;

    const BOTTLE: &str = "AA:BB:CC:DD:EE:01";

    fn config() -> Config {
        let mut config = Config::default();
        config.tracking.timezone = "UTC".into();
        config.tracking.smoothing_window = 4;
        // Frames carry wall-clock receipt time, which paused test time does not advance.
        config.tracking.settle_window_ms = 0;
        config
    }

    fn bottle() -> DeviceId {
        DeviceId::new(BOTTLE)
    }

    async fn connected() -> (Orchestrator, Arc<MockRadio>, Arc<MemoryStore>) {
        let radio = Arc::new(MockRadio::new());
        radio.add_advertisement(BOTTLE, Some("SipSense"), Some(-50));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::start(radio.clone(), store.clone(), &config());

        let scan = orchestrator.scan(Some(Duration::from_millis(200))).await.unwrap();
        let found = scan.finished().await.unwrap();
        assert_eq!(found[0].id, bottle());
        orchestrator.connect(&bottle()).await.unwrap();
        (orchestrator, radio, store)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<DeviceSnapshot>,
        mut done: impl FnMut(&DeviceSnapshot) -> bool,
    ) -> DeviceSnapshot {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if done(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_session_and_publishes_state() {
        let (orchestrator, _radio, _store) = connected().await;
        let mut rx = orchestrator.subscribe(&bottle()).await.unwrap();
        let snapshot = wait_for(&mut rx, |s| s.connection_state == ConnectionState::Connected).await;
        assert!(!snapshot.calibrated);
        assert_eq!(snapshot.device.id, bottle());
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn frames_flow_through_to_the_ledger() {
        let (orchestrator, radio, store) = connected().await;
        orchestrator.calibrate(200, 20, 750.0).await.unwrap();
        let mut rx = orchestrator.subscribe(&bottle()).await.unwrap();
        let peripheral = radio.take_peripheral(&bottle()).unwrap();

        // Three agreeing samples settle each level.
        for distance in [110; 4].into_iter().chain([146; 4]) {
            assert!(
                peripheral
                    .notify_json(&json!({ "distance": distance, "status": "ok" }))
                    .await
            );
        }

        let snapshot = wait_for(&mut rx, |s| !s.daily_ledger.events.is_empty()).await;
        assert_eq!(snapshot.daily_ledger.events.len(), 1);
        assert!((snapshot.daily_ledger.total_ml - 150.0).abs() < 1e-6);
        assert_eq!(store.intake_appends(), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_counted() {
        let (orchestrator, radio, _store) = connected().await;
        let mut rx = orchestrator.subscribe(&bottle()).await.unwrap();
        let peripheral = radio.take_peripheral(&bottle()).unwrap();

        peripheral.notify("not json").await;
        peripheral.notify_json(&json!({ "distance": -4, "status": "ok" })).await;
        peripheral.notify_json(&json!({ "distance": 120, "status": "ok" })).await;

        let snapshot = wait_for(&mut rx, |s| s.latest_distance_mm.is_some()).await;
        assert_eq!(snapshot.rejected_frames, 2);
        assert_eq!(snapshot.latest_distance_mm, Some(120));
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_needs_a_selected_device() {
        let radio = Arc::new(MockRadio::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::start(radio, store, &config());
        assert!(matches!(
            orchestrator.calibrate(200, 20, 750.0).await,
            Err(SipsenseError::NoActiveDevice)
        ));
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_is_persisted_and_reloaded() {
        let (orchestrator, _radio, store) = connected().await;
        let profile = orchestrator.calibrate(200, 20, 750.0).await.unwrap();
        orchestrator.shutdown().await;

        assert_eq!(
            store.load_calibration_profile(&bottle()).unwrap(),
            Some(profile)
        );

        let radio = Arc::new(MockRadio::new());
        let restarted = Orchestrator::start(radio, store, &config());
        let rx = restarted.subscribe(&bottle()).await.unwrap();
        assert!(rx.borrow().calibrated);
        restarted.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_request_reaches_the_peripheral() {
        let (orchestrator, radio, _store) = connected().await;
        let mut peripheral = radio.take_peripheral(&bottle()).unwrap();
        orchestrator.request_status().await.unwrap();
        assert_eq!(peripheral.next_command().await.as_deref(), Some("get_status"));
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_request_without_link_fails() {
        let orchestrator =
            Orchestrator::start(Arc::new(MockRadio::new()), Arc::new(MemoryStore::new()), &config());
        assert!(matches!(
            orchestrator.request_status().await,
            Err(SipsenseError::Connection(ConnectionError::InvalidState(_)))
        ));
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_alert_cannot_be_acknowledged() {
        let (orchestrator, _radio, _store) = connected().await;
        let id = Uuid::new_v4();
        assert!(matches!(
            orchestrator.acknowledge_alert(id).await,
            Err(SipsenseError::AlertNotFound(found)) if found == id
        ));
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_reflected_in_the_snapshot() {
        let (orchestrator, radio, _store) = connected().await;
        orchestrator.disconnect().await;
        let snapshot = orchestrator.snapshot(&bottle()).await.unwrap();
        assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
        assert_eq!(radio.disconnects(), vec![bottle()]);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_of_unknown_device_is_an_error() {
        let orchestrator =
            Orchestrator::start(Arc::new(MockRadio::new()), Arc::new(MemoryStore::new()), &config());
        assert!(matches!(
            orchestrator.snapshot(&bottle()).await,
            Err(SipsenseError::UnknownDevice(_))
        ));
        orchestrator.shutdown().await;
    }
}
