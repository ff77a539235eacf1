//! Telemetry frame decoding and freshness tracking.
//!
//! Frames are single JSON objects:
//!
//! ```json
//! {"distance": 110, "timestamp": 52000, "device": "SipSense-01", "status": "ok", "battery": 87}
//! {"status": "ok", "uptime": 52000, "free_memory": 180224}
//! {"status": "error", "error": "sensor timeout"}
//! ```
//!
//! Readings are stamped with the client receipt time. The peripheral `timestamp` is its
//! uptime, kept only for restart detection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::RawFrame;
use crate::error::DecodeError;
use crate::types::DeviceId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameStatus {
    Ok,
    Error,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    distance: Option<f64>,
    timestamp: Option<u64>,
    device: Option<String>,
    status: Option<FrameStatus>,
    error: Option<String>,
    battery: Option<f64>,
    uptime: Option<u64>,
    #[serde(alias = "free_heap")]
    free_memory: Option<u64>,
}

/// One accepted distance frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    /// Source device.
    pub device_id: DeviceId,
    /// Sensor-to-surface distance.
    pub distance_mm: u32,
    /// Peripheral uptime when sampled. Not used for ordering.
    pub device_uptime_ms: Option<u64>,
    /// Client receipt time.
    pub received_at: DateTime<Utc>,
    /// Battery level, when the peripheral reports one.
    pub battery_percent: Option<u8>,
    /// Peripheral name as reported in the frame.
    pub peripheral_name: Option<String>,
}

/// Diagnostics reply to `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Peripheral uptime.
    pub uptime: Option<u64>,
    /// Free memory in bytes.
    pub free_memory: Option<u64>,
    /// Battery level.
    pub battery_percent: Option<u8>,
    /// Peripheral name.
    pub peripheral_name: Option<String>,
    /// Client receipt time.
    pub received_at: DateTime<Utc>,
}

/// Outcome of decoding a well-formed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A distance measurement.
    Reading(SensorReading),
    /// A status reply.
    Status(StatusReport),
    /// The peripheral reported an error instead of a measurement.
    Fault {
        /// Reason given by the peripheral.
        reason: String,
    },
}

fn battery_percent(value: Option<f64>) -> Option<u8> {
    value
        .filter(|v| v.is_finite() && (0.0..=100.0).contains(v))
        .map(|v| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let percent = v.round() as u8;
            percent
        })
}

/// Decode one payload without touching any counters.
///
/// # Errors
///
/// [`DecodeError::Malformed`] for anything that is not a JSON object with a status tag,
/// or whose distance is negative or not a number.
pub fn parse_frame(
    device_id: &DeviceId,
    bytes: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Decoded, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DecodeError::Malformed(format!("not UTF-8: {e}")))?;
    let frame: WireFrame = serde_json::from_str(text.trim())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Some(status) = frame.status else {
        return Err(DecodeError::Malformed("missing status".into()));
    };
    if matches!(status, FrameStatus::Error) {
        return Ok(Decoded::Fault {
            reason: frame.error.unwrap_or_else(|| "unspecified".into()),
        });
    }

    let battery = battery_percent(frame.battery);
    match frame.distance {
        Some(distance) => {
            if !distance.is_finite() || distance < 0.0 || distance > f64::from(u32::MAX) {
                return Err(DecodeError::Malformed(format!(
                    "distance {distance} out of range"
                )));
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let distance_mm = distance.round() as u32;
            Ok(Decoded::Reading(SensorReading {
                device_id: device_id.clone(),
                distance_mm,
                device_uptime_ms: frame.timestamp,
                received_at,
                battery_percent: battery,
                peripheral_name: frame.device,
            }))
        }
        None if frame.uptime.is_some() || frame.free_memory.is_some() => {
            Ok(Decoded::Status(StatusReport {
                uptime: frame.uptime,
                free_memory: frame.free_memory,
                battery_percent: battery,
                peripheral_name: frame.device,
                received_at,
            }))
        }
        None => Err(DecodeError::Malformed("missing distance".into())),
    }
}

/// Frame counters for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    /// Distance readings accepted.
    pub accepted: u64,
    /// Malformed frames dropped.
    pub rejected: u64,
    /// Error frames from the peripheral.
    pub faults: u64,
    /// Status replies.
    pub status_reports: u64,
    /// Times the peripheral uptime went backwards.
    pub restarts: u64,
}

/// Stateful decoder: counts outcomes and detects peripheral restarts.
#[derive(Debug, Default)]
pub struct TelemetryDecoder {
    stats: DecoderStats,
    last_uptime_ms: Option<u64>,
}

impl TelemetryDecoder {
    /// A decoder with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a frame. Malformed frames are counted and logged here; callers simply
    /// drop the error.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Malformed`], see [`parse_frame`].
    pub fn decode(&mut self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        let decoded = match parse_frame(&frame.device_id, &frame.bytes, frame.received_at) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.rejected += 1;
                debug!(
                    device_id = %frame.device_id,
                    rejected = self.stats.rejected,
                    error = %e,
                    "Dropping malformed frame"
                );
                return Err(e);
            }
        };

        match &decoded {
            Decoded::Reading(reading) => {
                self.stats.accepted += 1;
                if let Some(uptime) = reading.device_uptime_ms {
                    self.observe_uptime(&reading.device_id, uptime);
                }
            }
            Decoded::Status(report) => {
                self.stats.status_reports += 1;
                debug!(device_id = %frame.device_id, uptime = ?report.uptime, free_memory = ?report.free_memory, "Status report");
            }
            Decoded::Fault { reason } => {
                self.stats.faults += 1;
                warn!(device_id = %frame.device_id, reason = %reason, "Peripheral reported an error");
            }
        }
        Ok(decoded)
    }

    fn observe_uptime(&mut self, device_id: &DeviceId, uptime: u64) {
        if let Some(previous) = self.last_uptime_ms {
            if uptime < previous {
                self.stats.restarts += 1;
                info!(device_id = %device_id, previous, uptime, "Peripheral restarted");
            }
        }
        self.last_uptime_ms = Some(uptime);
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> DecoderStats {
        self.stats
    }
}

/// Tracks whether accepted frames arrive within the freshness window.
///
/// Armed when the link comes up; until the first frame arrives, silence is measured from
/// the arming time.
#[derive(Debug, Clone)]
pub struct Freshness {
    window_ms: u64,
    armed_at: Option<DateTime<Utc>>,
    last_accepted: Option<DateTime<Utc>>,
}

impl Freshness {
    /// A disarmed tracker.
    #[must_use]
    pub const fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            armed_at: None,
            last_accepted: None,
        }
    }

    /// Start measuring from `now`.
    pub fn arm(&mut self, now: DateTime<Utc>) {
        self.armed_at = Some(now);
        self.last_accepted = None;
    }

    /// Stop measuring (link intentionally down).
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    /// Whether the tracker is measuring.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// An accepted frame arrived at `at`.
    pub fn record(&mut self, at: DateTime<Utc>) {
        self.last_accepted = Some(self.last_accepted.map_or(at, |last| last.max(at)));
    }

    /// Last accepted frame time.
    #[must_use]
    pub const fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.last_accepted
    }

    /// # Errors
    ///
    /// [`DecodeError::Stale`] if armed and silent for longer than the window.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), DecodeError> {
        let Some(armed_at) = self.armed_at else {
            return Ok(());
        };
        let reference = self.last_accepted.map_or(armed_at, |last| last.max(armed_at));
        let silent_ms = u64::try_from((now - reference).num_milliseconds()).unwrap_or(0);
        if silent_ms > self.window_ms {
            Err(DecodeError::Stale { silent_ms })
        } else {
            Ok(())
        }
    }

    /// Armed, received at least one frame since arming, and not stale.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (self.armed_at, self.last_accepted) {
            (Some(armed_at), Some(last)) => last >= armed_at && self.check(now).is_ok(),
            _ => false,
        }
    }
}

/// Client-to-peripheral commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralCommand {
    /// Ask for a status reply.
    GetStatus,
}

impl PeripheralCommand {
    /// Wire text of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetStatus => "get_status",
        }
    }
}

impl fmt::Display for PeripheralCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
