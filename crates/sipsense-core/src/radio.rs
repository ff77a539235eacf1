//! Hardware seam between the connection manager and a wireless stack.
//!
//! The [`Radio`] trait is deliberately small: readiness, discovery, connect and
//! disconnect. Everything stateful (deduplication, backoff, the state machine) lives in
//! [`crate::connection`], so the trait is easy to back with BlueZ in production and with
//! [`MockRadio`] in tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::types::DeviceId;

/// One advertisement observed during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Radio address of the advertiser.
    pub device_id: DeviceId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
}

/// An established link to a peripheral.
///
/// When `notifications` closes the link is gone. Dropping `commands` does not close it.
#[derive(Debug)]
pub struct RadioLink {
    /// Raw notification payloads, in arrival order.
    pub notifications: mpsc::Receiver<Vec<u8>>,
    /// Text commands to write to the peripheral.
    pub commands: mpsc::Sender<String>,
}

/// Wireless stack operations used by the connection manager.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Check that the stack is initialised and the adapter powered.
    async fn ensure_ready(&self) -> Result<(), ConnectionError>;

    /// Start discovery. Discovery runs until the returned receiver is dropped.
    async fn discover(&self) -> Result<mpsc::Receiver<Advertisement>, ConnectionError>;

    /// Connect and subscribe to notifications. No timeout is applied here.
    async fn connect(&self, device_id: &DeviceId) -> Result<RadioLink, ConnectionError>;

    /// Tear down the link. Must tolerate devices that are not connected.
    async fn disconnect(&self, device_id: &DeviceId);
}

#[cfg(any(test, feature = "mock-bluetooth"))]
pub use mock::{MockPeripheral, MockRadio};

#[cfg(feature = "bluetooth")]
pub use bluez::BluerRadio;

// =============================================================================
// MOCK
// =============================================================================

#[cfg(any(test, feature = "mock-bluetooth"))]
mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tracing::debug;

    use super::{Advertisement, Radio, RadioLink};
    use crate::error::ConnectionError;
    use crate::types::DeviceId;

    #[derive(Default)]
    struct MockState {
        not_ready: bool,
        advertisements: Vec<(Duration, Advertisement)>,
        connect_results: VecDeque<Result<(), ConnectionError>>,
        connect_delay: Duration,
        connect_calls: u32,
        peripherals: HashMap<DeviceId, MockPeripheral>,
        disconnects: Vec<DeviceId>,
    }

    /// Scripted radio for tests and hardware-free runs.
    ///
    /// Connects succeed by default. Queue failures with [`MockRadio::push_connect_result`].
    #[derive(Default)]
    pub struct MockRadio {
        state: Mutex<MockState>,
    }

    /// The peripheral side of a mock link.
    ///
    /// Dropping it closes the notification channel, which the manager sees as link loss.
    #[derive(Debug)]
    pub struct MockPeripheral {
        device_id: DeviceId,
        frames: mpsc::Sender<Vec<u8>>,
        commands: mpsc::Receiver<String>,
    }

    impl MockPeripheral {
        /// Address of the connected device.
        #[must_use]
        pub const fn device_id(&self) -> &DeviceId {
            &self.device_id
        }

        /// Push a raw notification. Returns `false` once the client side is gone.
        pub async fn notify(&self, bytes: impl Into<Vec<u8>>) -> bool {
            self.frames.send(bytes.into()).await.is_ok()
        }

        /// Push a JSON notification.
        pub async fn notify_json(&self, frame: &serde_json::Value) -> bool {
            self.notify(frame.to_string()).await
        }

        /// Next command written by the client, if any arrives.
        pub async fn next_command(&mut self) -> Option<String> {
            self.commands.recv().await
        }
    }

    impl MockRadio {
        /// A powered radio with nothing in range.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Simulate the adapter being powered on or off.
        pub fn set_ready(&self, ready: bool) {
            self.state().not_ready = !ready;
        }

        /// Make a device advertise immediately on every discovery.
        pub fn add_advertisement(&self, device_id: &str, name: Option<&str>, rssi: Option<i16>) {
            self.add_delayed_advertisement(Duration::ZERO, device_id, name, rssi);
        }

        /// Make a device advertise `delay` after discovery starts.
        pub fn add_delayed_advertisement(
            &self,
            delay: Duration,
            device_id: &str,
            name: Option<&str>,
            rssi: Option<i16>,
        ) {
            self.state().advertisements.push((
                delay,
                Advertisement {
                    device_id: DeviceId::new(device_id),
                    name: name.map(str::to_string),
                    rssi,
                },
            ));
        }

        /// Queue the outcome of the next connect call.
        pub fn push_connect_result(&self, result: Result<(), ConnectionError>) {
            self.state().connect_results.push_back(result);
        }

        /// Delay every connect call by `delay` before resolving.
        pub fn set_connect_delay(&self, delay: Duration) {
            self.state().connect_delay = delay;
        }

        /// Number of connect calls received so far.
        #[must_use]
        pub fn connect_calls(&self) -> u32 {
            self.state().connect_calls
        }

        /// Devices passed to `disconnect`, in call order.
        #[must_use]
        pub fn disconnects(&self) -> Vec<DeviceId> {
            self.state().disconnects.clone()
        }

        /// Take the peripheral end of the most recent link to `device_id`.
        #[must_use]
        pub fn take_peripheral(&self, device_id: &DeviceId) -> Option<MockPeripheral> {
            self.state().peripherals.remove(device_id)
        }
    }

    #[async_trait]
    impl Radio for MockRadio {
        async fn ensure_ready(&self) -> Result<(), ConnectionError> {
            if self.state().not_ready {
                Err(ConnectionError::NotReady)
            } else {
                Ok(())
            }
        }

        async fn discover(&self) -> Result<mpsc::Receiver<Advertisement>, ConnectionError> {
            self.ensure_ready().await?;
            let mut scripted = self.state().advertisements.clone();
            scripted.sort_by_key(|(delay, _)| *delay);

            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                for (delay, advertisement) in scripted {
                    tokio::select! {
                        () = tokio::time::sleep_until(started + delay) => {}
                        () = tx.closed() => return,
                    }
                    if tx.send(advertisement).await.is_err() {
                        return;
                    }
                }
                tx.closed().await;
            });
            Ok(rx)
        }

        async fn connect(&self, device_id: &DeviceId) -> Result<RadioLink, ConnectionError> {
            let (delay, scripted) = {
                let mut state = self.state();
                state.connect_calls += 1;
                (state.connect_delay, state.connect_results.pop_front())
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(Err(e)) = scripted {
                debug!(device_id = %device_id, error = %e, "Mock connect failing as scripted");
                return Err(e);
            }

            let (frames, notifications) = mpsc::channel(64);
            let (commands, command_rx) = mpsc::channel(16);
            self.state().peripherals.insert(
                device_id.clone(),
                MockPeripheral {
                    device_id: device_id.clone(),
                    frames,
                    commands: command_rx,
                },
            );
            Ok(RadioLink {
                notifications,
                commands,
            })
        }

        async fn disconnect(&self, device_id: &DeviceId) {
            let mut state = self.state();
            state.peripherals.remove(device_id);
            state.disconnects.push(device_id.clone());
        }
    }
}

// =============================================================================
// BLUEZ
// =============================================================================

#[cfg(feature = "bluetooth")]
mod bluez {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bluer::gatt::remote::Characteristic;
    use bluer::{Adapter, AdapterEvent, Address, Session};
    use futures::StreamExt;
    use tokio::sync::{mpsc, Mutex};
    use tracing::{debug, info, warn};

    use super::{Advertisement, Radio, RadioLink};
    use crate::config::DeviceConfig;
    use crate::error::ConnectionError;
    use crate::types::DeviceId;

    fn map_err(err: bluer::Error) -> ConnectionError {
        match err.kind {
            bluer::ErrorKind::NotReady | bluer::ErrorKind::NotAvailable => {
                ConnectionError::NotReady
            }
            _ => ConnectionError::Rejected(err.to_string()),
        }
    }

    fn parse_uuid(value: &str) -> Result<bluer::Uuid, ConnectionError> {
        bluer::Uuid::parse_str(value)
            .map_err(|e| ConnectionError::Rejected(format!("invalid UUID '{value}': {e}")))
    }

    /// BlueZ-backed radio (Linux).
    pub struct BluerRadio {
        adapter: Adapter,
        device: DeviceConfig,
        connected: Mutex<HashMap<DeviceId, bluer::Device>>,
        // Keeps the D-Bus connection alive.
        _session: Session,
    }

    impl BluerRadio {
        /// Open a BlueZ session on the default adapter.
        ///
        /// # Errors
        ///
        /// Returns [`ConnectionError::NotReady`] if `bluetoothd` is unreachable.
        pub async fn new(device: DeviceConfig) -> Result<Self, ConnectionError> {
            let session = Session::new().await.map_err(map_err)?;
            let adapter = session.default_adapter().await.map_err(map_err)?;
            info!(adapter = adapter.name(), "Using Bluetooth adapter");
            Ok(Self {
                adapter,
                device,
                connected: Mutex::new(HashMap::new()),
                _session: session,
            })
        }

        fn address(device_id: &DeviceId) -> Result<Address, ConnectionError> {
            device_id
                .as_str()
                .parse()
                .map_err(|_| ConnectionError::Rejected(format!("invalid address '{device_id}'")))
        }

        async fn find_characteristic(
            device: &bluer::Device,
            service_uuid: bluer::Uuid,
            characteristic_uuid: bluer::Uuid,
        ) -> Result<Characteristic, ConnectionError> {
            for service in device.services().await.map_err(map_err)? {
                if service.uuid().await.map_err(map_err)? != service_uuid {
                    continue;
                }
                for characteristic in service.characteristics().await.map_err(map_err)? {
                    if characteristic.uuid().await.map_err(map_err)? == characteristic_uuid {
                        return Ok(characteristic);
                    }
                }
            }
            Err(ConnectionError::Rejected(format!(
                "characteristic {characteristic_uuid} not found"
            )))
        }
    }

    #[async_trait]
    impl Radio for BluerRadio {
        async fn ensure_ready(&self) -> Result<(), ConnectionError> {
            match self.adapter.is_powered().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(ConnectionError::NotReady),
                Err(e) => Err(map_err(e)),
            }
        }

        async fn discover(&self) -> Result<mpsc::Receiver<Advertisement>, ConnectionError> {
            let adapter = self.adapter.clone();
            let prefix = self.device.name_prefix.clone();
            let events = adapter.discover_devices().await.map_err(map_err)?;
            let (tx, rx) = mpsc::channel(32);

            tokio::spawn(async move {
                let mut events = Box::pin(events);
                loop {
                    let event = tokio::select! {
                        event = events.next() => event,
                        () = tx.closed() => break,
                    };
                    let address = match event {
                        Some(AdapterEvent::DeviceAdded(address)) => address,
                        Some(_) => continue,
                        None => break,
                    };
                    let Ok(device) = adapter.device(address) else {
                        continue;
                    };
                    let name = device.name().await.ok().flatten();
                    if !prefix.is_empty()
                        && !name.as_deref().is_some_and(|n| n.starts_with(&prefix))
                    {
                        continue;
                    }
                    let rssi = device.rssi().await.ok().flatten();
                    let advertisement = Advertisement {
                        device_id: DeviceId::new(address.to_string()),
                        name,
                        rssi,
                    };
                    if tx.send(advertisement).await.is_err() {
                        break;
                    }
                }
                debug!("Discovery stream closed");
            });
            Ok(rx)
        }

        async fn connect(&self, device_id: &DeviceId) -> Result<RadioLink, ConnectionError> {
            let device = self.adapter.device(Self::address(device_id)?).map_err(map_err)?;
            if !device.is_connected().await.map_err(map_err)? {
                device.connect().await.map_err(map_err)?;
            }

            let service = parse_uuid(&self.device.service_uuid)?;
            let notify_char = Self::find_characteristic(
                &device,
                service,
                parse_uuid(&self.device.notify_characteristic_uuid)?,
            )
            .await?;
            let command_char = Self::find_characteristic(
                &device,
                service,
                parse_uuid(&self.device.command_characteristic_uuid)?,
            )
            .await?;

            let stream = notify_char.notify().await.map_err(map_err)?;
            let (frame_tx, notifications) = mpsc::channel(64);
            tokio::spawn(async move {
                let mut stream = Box::pin(stream);
                while let Some(bytes) = stream.next().await {
                    if frame_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
            });

            let (commands, mut command_rx) = mpsc::channel::<String>(16);
            let id = device_id.clone();
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    if let Err(e) = command_char.write(command.as_bytes()).await {
                        warn!(device_id = %id, error = %e, "Command write failed");
                    }
                }
            });

            self.connected.lock().await.insert(device_id.clone(), device);
            Ok(RadioLink {
                notifications,
                commands,
            })
        }

        async fn disconnect(&self, device_id: &DeviceId) {
            if let Some(device) = self.connected.lock().await.remove(device_id) {
                if let Err(e) = device.disconnect().await {
                    debug!(device_id = %device_id, error = %e, "Disconnect reported an error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn mock_reports_not_ready() {
        let radio = MockRadio::new();
        radio.set_ready(false);
        assert_eq!(radio.ensure_ready().await, Err(ConnectionError::NotReady));
        assert_eq!(radio.discover().await.err(), Some(ConnectionError::NotReady));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_discovery_replays_advertisements_in_time_order() {
        let radio = MockRadio::new();
        radio.add_delayed_advertisement(Duration::from_secs(2), "AA:00:00:00:00:02", None, None);
        radio.add_advertisement("AA:00:00:00:00:01", Some("Bottle"), Some(-50));

        let mut rx = radio.discover().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.device_id.as_str(), "AA:00:00:00:00:01");
        assert_eq!(first.name.as_deref(), Some("Bottle"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.device_id.as_str(), "AA:00:00:00:00:02");
    }

    #[tokio::test]
    async fn mock_link_carries_frames_and_commands() {
        let radio = MockRadio::new();
        let id = DeviceId::new("AA:BB:CC:DD:EE:FF");
        let mut link = radio.connect(&id).await.unwrap();
        let mut peripheral = radio.take_peripheral(&id).unwrap();

        assert!(peripheral.notify("hello").await);
        assert_eq!(link.notifications.recv().await.unwrap(), b"hello".to_vec());

        link.commands.send("get_status".into()).await.unwrap();
        assert_eq!(peripheral.next_command().await.as_deref(), Some("get_status"));

        drop(peripheral);
        assert!(link.notifications.recv().await.is_none());
    }

    #[tokio::test]
    async fn mock_scripted_connect_failure() {
        let radio = MockRadio::new();
        radio.push_connect_result(Err(ConnectionError::Rejected("pairing".into())));
        let id = DeviceId::new("AA:BB:CC:DD:EE:FF");

        assert!(matches!(
            radio.connect(&id).await,
            Err(ConnectionError::Rejected(_))
        ));
        assert!(radio.connect(&id).await.is_ok());
        assert_eq!(radio.connect_calls(), 2);
    }
}
