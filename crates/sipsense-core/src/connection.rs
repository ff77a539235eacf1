//! Physical link lifecycle: scan, connect, disconnect and automatic reconnection.
//!
//! Every state change goes through the pure [`transition`] table and is published on a
//! `watch` channel as a [`ConnectionStatus`]. Nothing else in the crate mutates the
//! connection state.
//!
//! Background work is tied to cancellation tokens:
//! - the scan token is cancelled by `stop_scan`, a new `scan`, `connect` or `disconnect`
//! - the session token covers the connect attempt, the link supervisor and the
//!   reconnection loop, and is cancelled by `disconnect` or a new `connect`
//!
//! The manager never looks inside payloads. Notifications are stamped with their receipt
//! time and forwarded in arrival order as [`RawFrame`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::radio::{Advertisement, Radio, RadioLink};
use crate::types::{ConnectionState, DeviceId};

/// One notification payload as received from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Device the frame came from.
    pub device_id: DeviceId,
    /// Payload bytes, untouched.
    pub bytes: Vec<u8>,
    /// Client clock at receipt.
    pub received_at: DateTime<Utc>,
}

/// Published connection state plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Device targeted by the current or last connection.
    pub device_id: Option<DeviceId>,
    /// Reconnection attempt number, 0 outside reconnection.
    pub attempt: u32,
    /// Most recent failure, cleared by a new `connect`.
    pub last_error: Option<ConnectionError>,
    /// When `state` last changed.
    pub changed_at: DateTime<Utc>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            device_id: None,
            attempt: 0,
            last_error: None,
            changed_at: Utc::now(),
        }
    }
}

/// A candidate seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Radio address.
    pub id: DeviceId,
    /// Advertised name.
    pub name: Option<String>,
    /// Most recent signal strength.
    pub rssi: Option<i16>,
    /// First advertisement in this scan.
    pub first_seen: DateTime<Utc>,
    /// Latest advertisement in this scan.
    pub last_seen: DateTime<Utc>,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// `scan()` called.
    ScanStarted,
    /// First candidate of a scan appeared.
    CandidateFound,
    /// Scan window closed or `stop_scan()` called.
    ScanEnded {
        /// Whether any candidate was seen.
        found: bool,
    },
    /// `connect()` called.
    ConnectRequested,
    /// Link up and subscribed.
    LinkEstablished,
    /// A connect attempt failed.
    ConnectFailed {
        /// Whether another attempt follows.
        retrying: bool,
    },
    /// Link dropped without being asked to.
    LinkLost,
    /// A backoff delay started.
    RetryScheduled,
    /// A backoff delay elapsed.
    RetryStarted,
    /// Reconnection budget spent.
    RetriesExhausted,
    /// `disconnect()` called.
    DisconnectRequested,
}

/// The connection state machine. Returns `None` when `event` is not valid in `state`.
#[must_use]
pub const fn transition(state: ConnectionState, event: LinkEvent) -> Option<ConnectionState> {
    use ConnectionState as S;
    use LinkEvent as E;

    match (state, event) {
        (S::Idle | S::Scanning | S::DeviceFound | S::Disconnected, E::ScanStarted) => {
            Some(S::Scanning)
        }
        (S::Scanning, E::CandidateFound) => Some(S::DeviceFound),
        (S::Scanning | S::DeviceFound, E::ScanEnded { found }) => {
            Some(if found { S::DeviceFound } else { S::Idle })
        }
        (S::DeviceFound | S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
        (S::Connecting, E::LinkEstablished) => Some(S::Connected),
        (S::Connecting, E::ConnectFailed { retrying }) => Some(if retrying {
            S::Reconnecting
        } else {
            S::Disconnected
        }),
        (S::Connected, E::LinkLost) => Some(S::Error),
        (S::Error | S::Reconnecting, E::RetryScheduled) => Some(S::Reconnecting),
        (S::Reconnecting, E::RetryStarted) => Some(S::Connecting),
        (S::Reconnecting, E::RetriesExhausted) => Some(S::Idle),
        (_, E::DisconnectRequested) => Some(S::Disconnected),
        _ => None,
    }
}

const fn rejection(state: ConnectionState, event: LinkEvent) -> ConnectionError {
    if state.is_attempting() && matches!(event, LinkEvent::ConnectRequested) {
        ConnectionError::Busy
    } else {
        ConnectionError::InvalidState(state)
    }
}

/// Bounded exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// First delay.
    pub base: Duration,
    /// Largest delay before jitter.
    pub cap: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    ///
    /// `sample` is a uniform draw in `[0, 1]`; the result is
    /// `min(cap, base * 2^(attempt-1)) * (1 - jitter + 2 * jitter * sample)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let capped = self.base.saturating_mul(1 << exponent).min(self.cap);
        let factor = 2.0f64.mul_add(self.jitter * sample.clamp(0.0, 1.0), 1.0 - self.jitter);
        capped.mul_f64(factor.max(0.0))
    }
}

/// Timeouts and backoff used by [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Scan window when the caller does not pass one.
    pub scan_timeout: Duration,
    /// Upper bound for one connect attempt.
    pub connect_timeout: Duration,
    /// Reconnection policy.
    pub backoff: BackoffPolicy,
}

impl From<&ConnectionConfig> for ConnectionSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            scan_timeout: config.scan_timeout(),
            connect_timeout: config.connect_timeout(),
            backoff: BackoffPolicy {
                base: Duration::from_millis(config.backoff_base_ms),
                cap: Duration::from_millis(config.backoff_cap_ms),
                max_attempts: config.backoff_max_attempts,
                jitter: config.backoff_jitter,
            },
        }
    }
}

type ScanOutcome = Result<Vec<DiscoveredDevice>, ConnectionError>;

#[derive(Default)]
struct Tasks {
    scan: Option<(u64, CancellationToken)>,
    scan_generation: u64,
    session: Option<CancellationToken>,
    commands: Option<mpsc::Sender<String>>,
}

struct Shared {
    radio: Arc<dyn Radio>,
    settings: ConnectionSettings,
    frames: mpsc::Sender<RawFrame>,
    status: watch::Sender<ConnectionStatus>,
    devices: watch::Sender<Vec<DiscoveredDevice>>,
    tasks: Mutex<Tasks>,
}

/// Owner of the physical link. Cheap to clone; clones share one link.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Handle on a running scan.
pub struct ScanHandle {
    generation: u64,
    manager: ConnectionManager,
    devices: watch::Receiver<Vec<DiscoveredDevice>>,
    outcome: oneshot::Receiver<ScanOutcome>,
}

impl ScanHandle {
    /// Current candidate list.
    #[must_use]
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.borrow().clone()
    }

    /// Live view of the candidate list.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices.clone()
    }

    /// Stop this scan. No-op if it already finished or was superseded.
    pub async fn cancel(&self) {
        self.manager.stop_scan_generation(Some(self.generation)).await;
    }

    /// Wait for the scan window to close.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Timeout`] if nothing was found, [`ConnectionError::Cancelled`]
    /// if the scan was stopped or superseded.
    pub async fn finished(self) -> ScanOutcome {
        self.outcome.await.unwrap_or(Err(ConnectionError::Cancelled))
    }
}

/// Order candidates by first discovery, stronger signal first on a tie.
pub(crate) fn order_candidates(devices: &mut [DiscoveredDevice]) {
    devices.sort_by(|a, b| {
        a.first_seen
            .cmp(&b.first_seen)
            .then_with(|| b.rssi.cmp(&a.rssi))
    });
}

impl ConnectionManager {
    /// Create a manager forwarding frames into `frames`.
    #[must_use]
    pub fn new(
        radio: Arc<dyn Radio>,
        settings: ConnectionSettings,
        frames: mpsc::Sender<RawFrame>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (devices, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                radio,
                settings,
                frames,
                status,
                devices,
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Candidates from the current or last scan.
    #[must_use]
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.shared.devices.borrow().clone()
    }

    fn apply(&self, event: LinkEvent) -> Result<ConnectionState, ConnectionError> {
        self.apply_with(event, |_| {})
    }

    fn apply_with(
        &self,
        event: LinkEvent,
        update: impl FnOnce(&mut ConnectionStatus),
    ) -> Result<ConnectionState, ConnectionError> {
        let mut outcome = Err(ConnectionError::Cancelled);
        self.shared.status.send_if_modified(|status| {
            let from = status.state;
            if let Some(next) = transition(from, event) {
                status.state = next;
                status.changed_at = Utc::now();
                update(status);
                debug!(from = %from, to = %next, event = ?event, "Connection state changed");
                outcome = Ok(next);
                true
            } else {
                outcome = Err(rejection(from, event));
                false
            }
        });
        outcome
    }

    // -------------------------------------------------------------------------
    // Scan
    // -------------------------------------------------------------------------

    /// Start discovery for `timeout` (the configured window when `None`).
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotReady`] if the radio is off, [`ConnectionError::InvalidState`]
    /// while a connection is active or being attempted.
    pub async fn scan(&self, timeout: Option<Duration>) -> Result<ScanHandle, ConnectionError> {
        self.shared.radio.ensure_ready().await?;
        let window = timeout.unwrap_or(self.shared.settings.scan_timeout);

        let (generation, token) = {
            let mut tasks = self.shared.tasks.lock().await;
            self.apply(LinkEvent::ScanStarted)?;
            let generation = tasks.scan_generation + 1;
            tasks.scan_generation = generation;
            let token = CancellationToken::new();
            if let Some((_, previous)) = tasks.scan.replace((generation, token.clone())) {
                previous.cancel();
            }
            (generation, token)
        };
        self.shared.devices.send_replace(Vec::new());

        let advertisements = match self.shared.radio.discover().await {
            Ok(rx) => rx,
            Err(e) => {
                self.release_scan(generation).await;
                let _ = self.apply(LinkEvent::ScanEnded { found: false });
                return Err(e);
            }
        };

        info!(window = ?window, "Scan started");
        let (done, outcome) = oneshot::channel();
        tokio::spawn(
            self.clone()
                .run_scan(advertisements, window, generation, token, done),
        );

        Ok(ScanHandle {
            generation,
            manager: self.clone(),
            devices: self.shared.devices.subscribe(),
            outcome,
        })
    }

    /// Stop the running scan, keeping the candidates found so far.
    pub async fn stop_scan(&self) {
        self.stop_scan_generation(None).await;
    }

    async fn stop_scan_generation(&self, generation: Option<u64>) {
        let stopped = {
            let mut tasks = self.shared.tasks.lock().await;
            match &tasks.scan {
                Some((current, _)) if generation.map_or(true, |g| g == *current) => {
                    tasks.scan.take()
                }
                _ => None,
            }
        };
        if let Some((_, token)) = stopped {
            token.cancel();
            let found = !self.shared.devices.borrow().is_empty();
            let _ = self.apply(LinkEvent::ScanEnded { found });
            info!(found, "Scan stopped");
        }
    }

    async fn release_scan(&self, generation: u64) {
        let mut tasks = self.shared.tasks.lock().await;
        if matches!(&tasks.scan, Some((current, _)) if *current == generation) {
            tasks.scan = None;
        }
    }

    async fn run_scan(
        self,
        mut advertisements: mpsc::Receiver<Advertisement>,
        window: Duration,
        generation: u64,
        token: CancellationToken,
        done: oneshot::Sender<ScanOutcome>,
    ) {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        let cancelled = loop {
            tokio::select! {
                () = token.cancelled() => break true,
                () = &mut deadline => break false,
                advertisement = advertisements.recv() => match advertisement {
                    Some(advertisement) => self.record(advertisement),
                    None => {
                        // Discovery ended early; wait out the window for a stop request.
                        tokio::select! {
                            () = token.cancelled() => break true,
                            () = &mut deadline => break false,
                        }
                    }
                },
            }
        };
        drop(advertisements);

        let outcome = if cancelled {
            Err(ConnectionError::Cancelled)
        } else {
            self.release_scan(generation).await;
            let devices = self.discovered();
            let found = !devices.is_empty();
            let _ = self.apply(LinkEvent::ScanEnded { found });
            if found {
                info!(count = devices.len(), "Scan finished");
                Ok(devices)
            } else {
                warn!("Scan finished without finding a device");
                Err(ConnectionError::Timeout)
            }
        };
        let _ = done.send(outcome);
    }

    fn record(&self, advertisement: Advertisement) {
        let now = Utc::now();
        let mut is_new = false;
        self.shared.devices.send_modify(|devices| {
            if let Some(known) = devices.iter_mut().find(|d| d.id == advertisement.device_id) {
                known.last_seen = now;
                if advertisement.rssi.is_some() {
                    known.rssi = advertisement.rssi;
                }
                if advertisement.name.is_some() {
                    known.name.clone_from(&advertisement.name);
                }
            } else {
                is_new = true;
                devices.push(DiscoveredDevice {
                    id: advertisement.device_id.clone(),
                    name: advertisement.name.clone(),
                    rssi: advertisement.rssi,
                    first_seen: now,
                    last_seen: now,
                });
            }
            order_candidates(devices);
        });

        if is_new {
            debug!(device_id = %advertisement.device_id, rssi = ?advertisement.rssi, "Candidate discovered");
            if self.state() == ConnectionState::Scanning {
                let _ = self.apply(LinkEvent::CandidateFound);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connect / disconnect
    // -------------------------------------------------------------------------

    /// Connect to `device_id`, aborting any running scan.
    ///
    /// Only valid from `DeviceFound` or `Disconnected`. Failures of this first attempt
    /// surface directly; later link loss is handled by automatic reconnection.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Busy`] while another attempt is in flight,
    /// [`ConnectionError::InvalidState`] from other states, and `NotReady`, `Rejected`,
    /// `Timeout` or `Cancelled` from the attempt itself.
    pub async fn connect(&self, device_id: &DeviceId) -> Result<(), ConnectionError> {
        self.shared.radio.ensure_ready().await?;

        let token = CancellationToken::new();
        {
            let mut tasks = self.shared.tasks.lock().await;
            self.apply_with(LinkEvent::ConnectRequested, |status| {
                status.device_id = Some(device_id.clone());
                status.attempt = 0;
                status.last_error = None;
            })?;
            if let Some((_, scan)) = tasks.scan.take() {
                scan.cancel();
            }
            if let Some(previous) = tasks.session.replace(token.clone()) {
                previous.cancel();
            }
            tasks.commands = None;
        }
        info!(device_id = %device_id, "Connecting");

        match self.attempt(device_id, &token).await {
            Ok(link) => {
                if token.is_cancelled() {
                    self.shared.radio.disconnect(device_id).await;
                    return Err(ConnectionError::Cancelled);
                }
                if let Err(e) = self.apply(LinkEvent::LinkEstablished) {
                    self.shared.radio.disconnect(device_id).await;
                    return Err(e);
                }
                info!(device_id = %device_id, "Connected");
                // Commands are usable as soon as connect returns.
                self.set_commands(&token, Some(link.commands.clone())).await;
                tokio::spawn(self.clone().supervise(device_id.clone(), link, token));
                Ok(())
            }
            Err(ConnectionError::Cancelled) => Err(ConnectionError::Cancelled),
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Connect failed");
                let failure = e.clone();
                let _ = self.apply_with(LinkEvent::ConnectFailed { retrying: false }, |status| {
                    status.last_error = Some(failure);
                });
                Err(e)
            }
        }
    }

    /// Close the link. Always succeeds; cancels scans, attempts and reconnection.
    pub async fn disconnect(&self) {
        {
            let mut tasks = self.shared.tasks.lock().await;
            if let Some((_, scan)) = tasks.scan.take() {
                scan.cancel();
            }
            if let Some(session) = tasks.session.take() {
                session.cancel();
            }
            tasks.commands = None;
        }
        let device_id = self.shared.status.borrow().device_id.clone();
        let _ = self.apply_with(LinkEvent::DisconnectRequested, |status| status.attempt = 0);
        if let Some(device_id) = device_id {
            self.shared.radio.disconnect(&device_id).await;
            info!(device_id = %device_id, "Disconnected");
        }
    }

    /// Write a text command to the connected peripheral.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::InvalidState`] without an established link,
    /// [`ConnectionError::Rejected`] if the link closed meanwhile.
    pub async fn send_command(&self, command: &str) -> Result<(), ConnectionError> {
        let sender = self.shared.tasks.lock().await.commands.clone();
        let Some(sender) = sender else {
            return Err(ConnectionError::InvalidState(self.state()));
        };
        sender
            .send(command.to_string())
            .await
            .map_err(|_| ConnectionError::Rejected("link closed".into()))?;
        debug!(command, "Command sent");
        Ok(())
    }

    async fn attempt(
        &self,
        device_id: &DeviceId,
        token: &CancellationToken,
    ) -> Result<RadioLink, ConnectionError> {
        let timeout = self.shared.settings.connect_timeout;
        tokio::select! {
            () = token.cancelled() => Err(ConnectionError::Cancelled),
            result = tokio::time::timeout(timeout, self.shared.radio.connect(device_id)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        self.shared.radio.disconnect(device_id).await;
                        Err(ConnectionError::Timeout)
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Link supervision
    // -------------------------------------------------------------------------

    async fn supervise(self, device_id: DeviceId, mut link: RadioLink, token: CancellationToken) {
        loop {
            self.set_commands(&token, Some(link.commands.clone())).await;
            if !self.pump(&device_id, &mut link.notifications, &token).await {
                return;
            }
            self.set_commands(&token, None).await;

            warn!(device_id = %device_id, "Link lost");
            if self.apply(LinkEvent::LinkLost).is_err() {
                return;
            }
            match self.reconnect(&device_id, &token).await {
                Some(next) => link = next,
                None => return,
            }
        }
    }

    async fn set_commands(&self, token: &CancellationToken, commands: Option<mpsc::Sender<String>>) {
        let mut tasks = self.shared.tasks.lock().await;
        if !token.is_cancelled() {
            tasks.commands = commands;
        }
    }

    /// Forward notifications until the link closes (`true`) or the session ends (`false`).
    async fn pump(
        &self,
        device_id: &DeviceId,
        notifications: &mut mpsc::Receiver<Vec<u8>>,
        token: &CancellationToken,
    ) -> bool {
        loop {
            let bytes = tokio::select! {
                () = token.cancelled() => return false,
                bytes = notifications.recv() => bytes,
            };
            let Some(bytes) = bytes else {
                return true;
            };
            let frame = RawFrame {
                device_id: device_id.clone(),
                bytes,
                received_at: Utc::now(),
            };
            if self.shared.frames.send(frame).await.is_err() {
                debug!("Frame consumer gone, stopping link pump");
                return false;
            }
        }
    }

    async fn reconnect(&self, device_id: &DeviceId, token: &CancellationToken) -> Option<RadioLink> {
        let policy = self.shared.settings.backoff.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt, rand::random::<f64>());
            self.apply_with(LinkEvent::RetryScheduled, |status| status.attempt = attempt)
                .ok()?;
            info!(
                device_id = %device_id,
                attempt,
                delay = ?delay,
                "Reconnecting"
            );

            tokio::select! {
                () = token.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            self.apply(LinkEvent::RetryStarted).ok()?;

            match self.attempt(device_id, token).await {
                Ok(link) => {
                    if token.is_cancelled() {
                        self.shared.radio.disconnect(device_id).await;
                        return None;
                    }
                    self.apply(LinkEvent::LinkEstablished).ok()?;
                    info!(device_id = %device_id, attempt, "Reconnected");
                    return Some(link);
                }
                Err(ConnectionError::Cancelled) => return None,
                Err(e) => {
                    warn!(device_id = %device_id, attempt, error = %e, "Reconnection attempt failed");
                    self.apply_with(LinkEvent::ConnectFailed { retrying: true }, |status| {
                        status.last_error = Some(e);
                    })
                    .ok()?;
                }
            }
        }

        let lost = ConnectionError::Lost {
            attempts: policy.max_attempts,
        };
        error!(device_id = %device_id, error = %lost, "Giving up on reconnection");
        let _ = self.apply_with(LinkEvent::RetriesExhausted, |status| {
            status.last_error = Some(lost);
        });
        {
            let mut tasks = self.shared.tasks.lock().await;
            if !token.is_cancelled() {
                tasks.session = None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::MockRadio;

    const BOTTLE: &str = "AA:BB:CC:DD:EE:01";

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            scan_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(4),
                max_attempts: 3,
                jitter: 0.0,
            },
        }
    }

    fn manager(radio: &Arc<MockRadio>) -> (ConnectionManager, mpsc::Receiver<RawFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionManager::new(radio.clone(), settings(), tx), rx)
    }

    async fn wait_for(manager: &ConnectionManager, state: ConnectionState) -> ConnectionStatus {
        let mut rx = manager.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| s.state == state))
            .await
            .expect("state reached in time")
            .expect("status channel open")
            .clone();
        status
    }

    async fn found(radio: &Arc<MockRadio>, manager: &ConnectionManager) {
        radio.add_advertisement(BOTTLE, Some("SipSense"), Some(-60));
        let scan = manager.scan(None).await.unwrap();
        scan.finished().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::DeviceFound);
    }

    #[test]
    fn transition_table() {
        use ConnectionState as S;
        use LinkEvent as E;

        assert_eq!(transition(S::Idle, E::ScanStarted), Some(S::Scanning));
        assert_eq!(transition(S::Scanning, E::CandidateFound), Some(S::DeviceFound));
        assert_eq!(transition(S::Scanning, E::ScanEnded { found: false }), Some(S::Idle));
        assert_eq!(transition(S::DeviceFound, E::ConnectRequested), Some(S::Connecting));
        assert_eq!(transition(S::Disconnected, E::ConnectRequested), Some(S::Connecting));
        assert_eq!(transition(S::Connected, E::LinkLost), Some(S::Error));
        assert_eq!(transition(S::Error, E::RetryScheduled), Some(S::Reconnecting));
        assert_eq!(transition(S::Reconnecting, E::RetryStarted), Some(S::Connecting));
        assert_eq!(transition(S::Reconnecting, E::RetriesExhausted), Some(S::Idle));

        assert_eq!(transition(S::Idle, E::ConnectRequested), None);
        assert_eq!(transition(S::Connecting, E::ConnectRequested), None);
        assert_eq!(transition(S::Connected, E::ScanStarted), None);
        assert_eq!(transition(S::Connecting, E::ScanEnded { found: true }), None);

        for state in [S::Idle, S::Connected, S::Reconnecting, S::Disconnected] {
            assert_eq!(transition(state, E::DisconnectRequested), Some(S::Disconnected));
        }
    }

    #[test]
    fn second_connect_while_attempting_is_busy() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ] {
            assert_eq!(rejection(state, LinkEvent::ConnectRequested), ConnectionError::Busy);
        }
        assert_eq!(
            rejection(ConnectionState::Connecting, LinkEvent::ScanStarted),
            ConnectionError::InvalidState(ConnectionState::Connecting)
        );
        assert_eq!(
            rejection(ConnectionState::Connected, LinkEvent::ConnectRequested),
            ConnectionError::InvalidState(ConnectionState::Connected)
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = settings().backoff;
        assert_eq!(policy.delay_for(1, 0.5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, 0.5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, 0.5), Duration::from_secs(4));
        assert_eq!(policy.delay_for(9, 0.5), Duration::from_secs(4));
        assert_eq!(policy.delay_for(u32::MAX, 0.5), Duration::from_secs(4));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let policy = BackoffPolicy {
            jitter: 0.2,
            ..settings().backoff
        };
        let near = |actual: Duration, millis: u64| {
            actual.as_secs_f64().mul_add(1000.0, -(millis as f64)).abs() < 1.0
        };
        assert!(near(policy.delay_for(1, 0.0), 800));
        assert!(near(policy.delay_for(1, 1.0), 1200));
        let sampled = policy.delay_for(2, rand::random());
        assert!(sampled >= Duration::from_millis(1599) && sampled <= Duration::from_millis(2401));
    }

    #[test]
    fn candidates_ordered_by_discovery_then_signal() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let candidate = |id: &str, rssi: Option<i16>, first_seen| DiscoveredDevice {
            id: DeviceId::new(id),
            name: None,
            rssi,
            first_seen,
            last_seen: first_seen,
        };
        let mut devices = vec![
            candidate("C", Some(-40), t1),
            candidate("B", Some(-70), t0),
            candidate("A", Some(-50), t0),
            candidate("D", None, t0),
        ];
        order_candidates(&mut devices);
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["A", "B", "D", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_deduplicates_and_reports_found() {
        let radio = Arc::new(MockRadio::new());
        radio.add_advertisement(BOTTLE, Some("SipSense"), Some(-70));
        radio.add_delayed_advertisement(Duration::from_secs(1), BOTTLE, None, Some(-48));
        radio.add_delayed_advertisement(Duration::from_secs(2), "AA:BB:CC:DD:EE:02", None, None);
        let (manager, _frames) = manager(&radio);

        let scan = manager.scan(None).await.unwrap();
        let devices = scan.finished().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id.as_str(), BOTTLE);
        assert_eq!(devices[0].name.as_deref(), Some("SipSense"));
        assert_eq!(devices[0].rssi, Some(-48));
        assert_eq!(manager.state(), ConnectionState::DeviceFound);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scan_times_out_to_idle() {
        let radio = Arc::new(MockRadio::new());
        let (manager, _frames) = manager(&radio);

        let scan = manager.scan(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Scanning);
        assert_eq!(scan.finished().await, Err(ConnectionError::Timeout));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_scan_keeps_found_candidates() {
        let radio = Arc::new(MockRadio::new());
        radio.add_advertisement(BOTTLE, None, Some(-60));
        let (manager, _frames) = manager(&radio);

        let scan = manager.scan(Some(Duration::from_secs(60))).await.unwrap();
        wait_for(&manager, ConnectionState::DeviceFound).await;
        scan.cancel().await;
        scan.cancel().await;

        assert_eq!(manager.state(), ConnectionState::DeviceFound);
        assert_eq!(scan.devices().len(), 1);
        assert_eq!(scan.finished().await, Err(ConnectionError::Cancelled));
    }

    #[tokio::test]
    async fn scan_requires_ready_radio() {
        let radio = Arc::new(MockRadio::new());
        radio.set_ready(false);
        let (manager, _frames) = manager(&radio);

        assert!(matches!(manager.scan(None).await, Err(ConnectionError::NotReady)));
        assert_eq!(
            manager.connect(&DeviceId::new(BOTTLE)).await,
            Err(ConnectionError::NotReady)
        );
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn connect_from_idle_is_invalid() {
        let radio = Arc::new(MockRadio::new());
        let (manager, _frames) = manager(&radio);

        assert_eq!(
            manager.connect(&DeviceId::new(BOTTLE)).await,
            Err(ConnectionError::InvalidState(ConnectionState::Idle))
        );
        assert_eq!(radio.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_forwards_frames_with_receipt_time() {
        let radio = Arc::new(MockRadio::new());
        let (manager, mut frames) = manager(&radio);
        found(&radio, &manager).await;

        let id = DeviceId::new(BOTTLE);
        manager.connect(&id).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);

        let peripheral = radio.take_peripheral(&id).unwrap();
        let before = Utc::now();
        peripheral.notify(r#"{"distance":100}"#).await;
        peripheral.notify(r#"{"distance":101}"#).await;

        let first = frames.recv().await.unwrap();
        let second = frames.recv().await.unwrap();
        assert_eq!(first.device_id, id);
        assert_eq!(first.bytes, br#"{"distance":100}"#.to_vec());
        assert_eq!(second.bytes, br#"{"distance":101}"#.to_vec());
        assert!(first.received_at >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_during_attempt_is_rejected() {
        let radio = Arc::new(MockRadio::new());
        radio.set_connect_delay(Duration::from_secs(1));
        let (manager, _frames) = manager(&radio);
        found(&radio, &manager).await;

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(&DeviceId::new(BOTTLE)).await })
        };
        wait_for(&manager, ConnectionState::Connecting).await;

        assert_eq!(
            manager.connect(&DeviceId::new(BOTTLE)).await,
            Err(ConnectionError::Busy)
        );
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(radio.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_surfaces_directly() {
        let radio = Arc::new(MockRadio::new());
        radio.set_connect_delay(Duration::from_secs(10));
        let (manager, _frames) = manager(&radio);
        found(&radio, &manager).await;

        assert_eq!(
            manager.connect(&DeviceId::new(BOTTLE)).await,
            Err(ConnectionError::Timeout)
        );
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.last_error, Some(ConnectionError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_aborts_running_scan() {
        let radio = Arc::new(MockRadio::new());
        radio.add_advertisement(BOTTLE, None, Some(-60));
        let (manager, _frames) = manager(&radio);

        let scan = manager.scan(Some(Duration::from_secs(60))).await.unwrap();
        wait_for(&manager, ConnectionState::DeviceFound).await;
        manager.connect(&DeviceId::new(BOTTLE)).await.unwrap();

        assert_eq!(scan.finished().await, Err(ConnectionError::Cancelled));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_reconnects_with_backoff() {
        let radio = Arc::new(MockRadio::new());
        let (manager, mut frames) = manager(&radio);
        found(&radio, &manager).await;
        let id = DeviceId::new(BOTTLE);
        manager.connect(&id).await.unwrap();

        radio.push_connect_result(Err(ConnectionError::Rejected("busy".into())));
        drop(radio.take_peripheral(&id));

        let status = wait_for(&manager, ConnectionState::Reconnecting).await;
        assert_eq!(status.attempt, 1);
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.status().attempt, 2);
        assert_eq!(radio.connect_calls(), 3);

        let peripheral = radio.take_peripheral(&id).unwrap();
        peripheral.notify("after").await;
        assert_eq!(frames.recv().await.unwrap().bytes, b"after".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_lost() {
        let radio = Arc::new(MockRadio::new());
        let (manager, _frames) = manager(&radio);
        found(&radio, &manager).await;
        let id = DeviceId::new(BOTTLE);
        manager.connect(&id).await.unwrap();

        for _ in 0..3 {
            radio.push_connect_result(Err(ConnectionError::Rejected("gone".into())));
        }
        let mut rx = manager.subscribe();
        drop(radio.take_peripheral(&id));

        let status = tokio::time::timeout(
            Duration::from_secs(300),
            rx.wait_for(|s| s.last_error == Some(ConnectionError::Lost { attempts: 3 })),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(radio.connect_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_reconnection() {
        let radio = Arc::new(MockRadio::new());
        let (manager, _frames) = manager(&radio);
        found(&radio, &manager).await;
        let id = DeviceId::new(BOTTLE);
        manager.connect(&id).await.unwrap();

        drop(radio.take_peripheral(&id));
        wait_for(&manager, ConnectionState::Reconnecting).await;
        manager.disconnect().await;
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(radio.connect_calls(), 1);
        assert_eq!(radio.disconnects(), vec![id.clone(), id]);
        assert!(manager.send_command("get_status").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn commands_reach_the_peripheral() {
        let radio = Arc::new(MockRadio::new());
        let (manager, _frames) = manager(&radio);
        found(&radio, &manager).await;
        let id = DeviceId::new(BOTTLE);

        assert!(matches!(
            manager.send_command("get_status").await,
            Err(ConnectionError::InvalidState(ConnectionState::DeviceFound))
        ));

        manager.connect(&id).await.unwrap();
        let mut peripheral = radio.take_peripheral(&id).unwrap();
        // The supervisor registers the command channel right after connecting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.send_command("get_status").await.unwrap();
        assert_eq!(peripheral.next_command().await.as_deref(), Some("get_status"));
    }
}
