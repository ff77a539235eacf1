//! # sipsense-core
//!
//! Core engine of the sipsense smart water bottle client.
//!
//! This crate provides:
//! - Link management for the bottle's ultrasonic sensor peripheral (scan, connect,
//!   reconnect with backoff)
//! - Telemetry decoding with a freshness window
//! - Two-point calibration from distance to water volume
//! - Drink detection and a daily intake ledger
//! - Hydration alerts with cooldown and in-place escalation
//! - Persistent storage for profiles, ledgers and alerts
//!
//! ## Architecture
//!
//! Data flows one way, from the link to the snapshot stream:
//!
//! - [`radio`] - Wireless stack seam (`BlueZ` via bluer, or a scripted mock)
//! - [`connection`] - Connection state machine and automatic reconnection
//! - [`telemetry`] - Frame decoding, diagnostics and freshness tracking
//! - [`calibration`] - Calibration profiles and volume normalisation
//! - [`tracking`] - Level smoothing, drink events and daily ledgers
//! - [`alerts`] - Alert rules and lifecycle
//! - [`session`] - Per-device pipeline and snapshots
//! - [`orchestrator`] - The entry point wiring everything together
//! - [`storage`] - Persistence collaborator and its implementations
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared domain types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alerts;
pub mod calibration;
pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod radio;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod tracking;
pub mod types;

// Re-export primary types for convenience
pub use alerts::{Alert, AlertChange, AlertEngine, AlertType, Severity};
pub use calibration::{CalibrationEngine, CalibrationProfile, WaterLevelSample};
pub use config::{
    is_valid_device_id, is_valid_timezone, AlertConfig, CalibrationConfig, Config,
    ConfigError, ConfigResult, ConnectionConfig, DeviceConfig, ServerConfig, StorageConfig,
    TelemetryConfig, TrackingConfig,
};
pub use connection::{
    BackoffPolicy, ConnectionManager, ConnectionSettings, ConnectionStatus, DiscoveredDevice,
    RawFrame, ScanHandle,
};
pub use error::{
    CalibrationError, ConnectionError, DecodeError, Result, SipsenseError, StorageError,
};
pub use orchestrator::Orchestrator;
#[cfg(feature = "bluetooth")]
pub use radio::BluerRadio;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use radio::{MockPeripheral, MockRadio};
pub use radio::{Advertisement, Radio, RadioLink};
pub use session::{DeviceSession, DeviceSnapshot};
pub use storage::{default_data_dir, FileStore, MemoryStore, Storage, StorageResult};
pub use telemetry::{
    DecoderStats, PeripheralCommand, SensorReading, StatusReport, TelemetryDecoder,
};
pub use tracking::{DailyLedger, HydrationTracker, IntakeEvent, LedgerError};
pub use types::{Confidence, ConnectionState, Device, DeviceId};
