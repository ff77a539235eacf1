//! Shared types.
//!
//! Identifiers and small value types used by more than one component.
//! Component-owned entities (profiles, ledgers, alerts) live in their own modules.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of one physical peripheral (the radio address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id, normalising the address to upper case.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_uppercase())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of the physical link.
///
/// `Idle` is the initial state. There is no terminal state; `scan()` re-enters the
/// cycle from anywhere outside an active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Discovery running, no candidate seen yet.
    Scanning,
    /// At least one candidate known (discovery may still be running).
    DeviceFound,
    /// A connection attempt is in flight.
    Connecting,
    /// Link established, notifications flowing.
    Connected,
    /// Link closed on request or after a failed attempt.
    Disconnected,
    /// Link lost unexpectedly; reconnection is about to start.
    Error,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` while a connection attempt (first or retry) is pending.
    #[must_use]
    pub const fn is_attempting(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::DeviceFound => "device_found",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// How much a derived quantity can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Heuristic normalisation, no calibration profile.
    Raw,
    /// Derived from a saved two-point calibration.
    Calibrated,
}

/// One physical peripheral as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Radio address.
    pub id: DeviceId,

    /// Advertised or reported peripheral name.
    pub display_name: Option<String>,

    /// Current link state.
    pub connection_state: ConnectionState,

    /// Receipt time of the last accepted frame.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// A device we know nothing about yet.
    #[must_use]
    pub const fn new(id: DeviceId) -> Self {
        Self {
            id,
            display_name: None,
            connection_state: ConnectionState::Idle,
            last_seen: None,
        }
    }
}
