//! Application configuration management.
//!
//! One TOML file drives every component:
//! - `[device]` GATT layout of the bottle peripheral
//! - `[connection]` scan/connect timeouts and reconnection backoff
//! - `[telemetry]` freshness window and pipeline tick
//! - `[calibration]` minimum valid distance and the uncalibrated fallback
//! - `[tracking]` smoothing, drink detection, daily goal and local timezone
//! - `[alerts]` alert thresholds and cooldown
//! - `[storage]` data directory
//! - `[server]` HTTP bind address
//!
//! Every section is `#[serde(default)]`, so a partial file only overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Environment prefix for layered overrides (`SIPSENSE_ALERTS__COOLDOWN_SECS=600`).
pub const ENV_PREFIX: &str = "SIPSENSE";

static DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("device id pattern is valid")
});

/// Configuration-specific errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The TOML could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Merging file and environment sources failed.
    #[error("Failed to assemble configuration: {0}")]
    Layered(String),

    /// A single field is invalid.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// SECTIONS
// =============================================================================

/// GATT layout of the bottle peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Primary service advertised by the bottle.
    pub service_uuid: String,
    /// Characteristic the bottle notifies telemetry frames on.
    pub notify_characteristic_uuid: String,
    /// Characteristic the client writes text commands to.
    pub command_characteristic_uuid: String,
    /// Only advertisements whose name starts with this prefix are listed. Empty lists all.
    pub name_prefix: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        // Nordic UART Service layout
        Self {
            service_uuid: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".into(),
            notify_characteristic_uuid: "6e400003-b5a3-f393-e0a9-e50e24dcca9e".into(),
            command_characteristic_uuid: "6e400002-b5a3-f393-e0a9-e50e24dcca9e".into(),
            name_prefix: String::new(),
        }
    }
}

/// Scan/connect timeouts and reconnection backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default scan window when the caller does not give one.
    pub scan_timeout_ms: u64,
    /// Upper bound for a single connect attempt.
    pub connect_timeout_ms: u64,
    /// First reconnection delay.
    pub backoff_base_ms: u64,
    /// Largest reconnection delay.
    pub backoff_cap_ms: u64,
    /// Reconnection attempts before giving up with `Lost`.
    pub backoff_max_attempts: u32,
    /// Jitter as a fraction of the delay, in `[0, 1)`.
    pub backoff_jitter: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_max_attempts: 8,
            backoff_jitter: 0.2,
        }
    }
}

impl ConnectionConfig {
    /// Default scan window.
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Connect attempt timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Pipeline timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Maximum gap between accepted frames before data counts as stale.
    pub freshness_window_ms: u64,
    /// Period of the pipeline housekeeping tick.
    pub tick_interval_ms: u64,
    /// Capacity of the raw frame channel between link and pipeline.
    pub frame_buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: 5_000,
            tick_interval_ms: 1_000,
            frame_buffer: 256,
        }
    }
}

impl TelemetryConfig {
    /// Freshness window as a duration.
    #[must_use]
    pub const fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    /// Housekeeping tick period.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Distance validity and the uncalibrated fallback mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Readings below this are obstruction/no-bottle and are rejected.
    pub min_valid_distance_mm: u32,
    /// Fallback "empty" distance used without a profile.
    pub fallback_empty_distance_mm: u32,
    /// Fallback "full" distance used without a profile.
    pub fallback_full_distance_mm: u32,
    /// Nominal bottle size used without a profile.
    pub fallback_bottle_volume_ml: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_valid_distance_mm: 10,
            fallback_empty_distance_mm: 200,
            fallback_full_distance_mm: 20,
            fallback_bottle_volume_ml: 750.0,
        }
    }
}

/// Smoothing, drink detection and the daily ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// IANA timezone that defines "local midnight".
    pub timezone: String,
    /// Daily intake goal.
    pub daily_goal_ml: f64,
    /// Maximum samples kept in the smoothing window.
    pub smoothing_window: usize,
    /// How long a level must hold before it counts as settled.
    pub settle_window_ms: u64,
    /// Minimum samples in a settled run.
    pub settle_min_samples: usize,
    /// Spread allowed inside one settled run (slosh/jitter).
    pub settle_band_ml: f64,
    /// Smallest drop ever recorded as a drink.
    pub min_intake_ml: f64,
    /// Drop threshold relative to bottle capacity; the larger of the two applies.
    pub intake_threshold_ratio: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".into(),
            daily_goal_ml: 2_000.0,
            smoothing_window: 16,
            settle_window_ms: 3_000,
            settle_min_samples: 3,
            settle_band_ml: 12.0,
            min_intake_ml: 20.0,
            intake_threshold_ratio: 0.02,
        }
    }
}

impl TrackingConfig {
    /// Parsed timezone, UTC when the name is unknown.
    #[must_use]
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Alert thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum time between raising the same alert type for a device.
    pub cooldown_secs: u64,
    /// Offline/stale duration before a warning.
    pub offline_after_secs: u64,
    /// Offline/stale duration before escalating to critical.
    pub offline_critical_after_secs: u64,
    /// Local hour the drinking day starts.
    pub active_hours_start: u32,
    /// Local hour the drinking day ends.
    pub active_hours_end: u32,
    /// Local hours at which pace is checked.
    pub pace_checkpoint_hours: Vec<u32>,
    /// Fractional shortfall against expected intake that raises a warning.
    pub pace_tolerance: f64,
    /// Fractional shortfall that escalates to critical.
    pub pace_critical_tolerance: f64,
    /// Battery percentage that raises a warning.
    pub low_battery_percent: u8,
    /// Battery percentage that escalates to critical.
    pub critical_battery_percent: u8,
    /// No intake for this long (while behind pace) counts toward dehydration.
    pub dehydration_no_intake_secs: u64,
    /// Missed pace must persist this long before dehydration is raised.
    pub dehydration_sustained_pace_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30 * 60,
            offline_after_secs: 5 * 60,
            offline_critical_after_secs: 30 * 60,
            active_hours_start: 8,
            active_hours_end: 22,
            pace_checkpoint_hours: vec![10, 12, 14, 16, 18, 20],
            pace_tolerance: 0.15,
            pace_critical_tolerance: 0.4,
            low_battery_percent: 20,
            critical_battery_percent: 5,
            dehydration_no_intake_secs: 4 * 3600,
            dehydration_sustained_pace_secs: 2 * 3600,
        }
    }
}

/// Where persistent data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for profiles, ledgers and alerts.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::storage::default_data_dir(),
        }
    }
}

/// HTTP server binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peripheral GATT layout.
    pub device: DeviceConfig,
    /// Link lifecycle.
    pub connection: ConnectionConfig,
    /// Pipeline timing.
    pub telemetry: TelemetryConfig,
    /// Calibration.
    pub calibration: CalibrationConfig,
    /// Hydration tracking.
    pub tracking: TrackingConfig,
    /// Alerts.
    pub alerts: AlertConfig,
    /// Persistence.
    pub storage: StorageConfig,
    /// HTTP server.
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or unparsable.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load the file (optional) with `SIPSENSE_<SECTION>__<KEY>` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Layered`] if a source cannot be read or deserialized.
    pub fn load_layered(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|layered| layered.try_deserialize::<Self>())
            .map_err(|e| ConfigError::Layered(e.to_string()))
    }

    /// Save configuration to disk as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Default configuration file location.
    ///
    /// On Linux: `/etc/sipsense/config.toml`. Elsewhere the platform config dir.
    #[must_use]
    pub fn default_path() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/sipsense/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "sipsense")
                .map(|dirs| dirs.config_dir().join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("config.toml"))
        }
    }

    /// Validate every section, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut fail = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        for (field, value) in [
            ("device.service_uuid", &self.device.service_uuid),
            (
                "device.notify_characteristic_uuid",
                &self.device.notify_characteristic_uuid,
            ),
            (
                "device.command_characteristic_uuid",
                &self.device.command_characteristic_uuid,
            ),
        ] {
            if Uuid::parse_str(value).is_err() {
                fail(field, format!("'{value}' is not a UUID"));
            }
        }

        let conn = &self.connection;
        if conn.scan_timeout_ms == 0 {
            fail("connection.scan_timeout_ms", "must be positive".into());
        }
        if conn.connect_timeout_ms == 0 {
            fail("connection.connect_timeout_ms", "must be positive".into());
        }
        if conn.backoff_base_ms == 0 || conn.backoff_base_ms > conn.backoff_cap_ms {
            fail(
                "connection.backoff_base_ms",
                format!(
                    "must be positive and <= backoff_cap_ms ({})",
                    conn.backoff_cap_ms
                ),
            );
        }
        if conn.backoff_max_attempts == 0 {
            fail("connection.backoff_max_attempts", "must be at least 1".into());
        }
        if !(0.0..1.0).contains(&conn.backoff_jitter) {
            fail("connection.backoff_jitter", "must be in [0, 1)".into());
        }

        if self.telemetry.freshness_window_ms == 0 {
            fail("telemetry.freshness_window_ms", "must be positive".into());
        }
        if self.telemetry.tick_interval_ms == 0 {
            fail("telemetry.tick_interval_ms", "must be positive".into());
        }
        if self.telemetry.frame_buffer == 0 {
            fail("telemetry.frame_buffer", "must be positive".into());
        }

        let cal = &self.calibration;
        if cal.fallback_empty_distance_mm <= cal.fallback_full_distance_mm {
            fail(
                "calibration.fallback_empty_distance_mm",
                "must be greater than fallback_full_distance_mm".into(),
            );
        }
        if cal.fallback_bottle_volume_ml <= 0.0 {
            fail("calibration.fallback_bottle_volume_ml", "must be positive".into());
        }

        let trk = &self.tracking;
        if !is_valid_timezone(&trk.timezone) {
            fail(
                "tracking.timezone",
                format!("unknown timezone '{}'", trk.timezone),
            );
        }
        if trk.daily_goal_ml <= 0.0 {
            fail("tracking.daily_goal_ml", "must be positive".into());
        }
        if trk.smoothing_window == 0 {
            fail("tracking.smoothing_window", "must be positive".into());
        }
        if trk.settle_min_samples == 0 || trk.settle_min_samples > trk.smoothing_window {
            fail(
                "tracking.settle_min_samples",
                "must be between 1 and smoothing_window".into(),
            );
        }
        if trk.settle_band_ml < 0.0 || trk.settle_band_ml >= trk.min_intake_ml {
            fail(
                "tracking.settle_band_ml",
                "must be non-negative and smaller than min_intake_ml".into(),
            );
        }
        if !(0.0..1.0).contains(&trk.intake_threshold_ratio) {
            fail("tracking.intake_threshold_ratio", "must be in [0, 1)".into());
        }

        let alr = &self.alerts;
        if alr.active_hours_start >= alr.active_hours_end || alr.active_hours_end > 24 {
            fail(
                "alerts.active_hours_start",
                "active hours must satisfy start < end <= 24".into(),
            );
        }
        if alr
            .pace_checkpoint_hours
            .iter()
            .any(|h| *h <= alr.active_hours_start || *h > alr.active_hours_end)
        {
            fail(
                "alerts.pace_checkpoint_hours",
                "checkpoints must fall inside the active hours".into(),
            );
        }
        if !(0.0 < alr.pace_tolerance
            && alr.pace_tolerance < alr.pace_critical_tolerance
            && alr.pace_critical_tolerance < 1.0)
        {
            fail(
                "alerts.pace_tolerance",
                "tolerances must satisfy 0 < pace < critical < 1".into(),
            );
        }
        if alr.critical_battery_percent >= alr.low_battery_percent || alr.low_battery_percent > 100
        {
            fail(
                "alerts.critical_battery_percent",
                "must be below low_battery_percent (<= 100)".into(),
            );
        }
        if alr.offline_after_secs >= alr.offline_critical_after_secs {
            fail(
                "alerts.offline_after_secs",
                "must be below offline_critical_after_secs".into(),
            );
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Returns `true` if the string is a radio address of the form `AA:BB:CC:DD:EE:FF`.
#[must_use]
pub fn is_valid_device_id(id: &str) -> bool {
    DEVICE_ID_RE.is_match(id)
}

/// Returns `true` if the string names a known IANA timezone.
#[must_use]
pub fn is_valid_timezone(name: &str) -> bool {
    name.parse::<Tz>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok(), "{:?}", config.validate());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let partial = r#"
[tracking]
daily_goal_ml = 2500.0
timezone = "Europe/Lisbon"

[alerts]
cooldown_secs = 600
"#;
        let config: Config = toml::from_str(partial).unwrap();
        assert!((config.tracking.daily_goal_ml - 2500.0).abs() < f64::EPSILON);
        assert_eq!(config.tracking.tz(), chrono_tz::Europe::Lisbon);
        assert_eq!(config.alerts.cooldown_secs, 600);
        assert_eq!(config.tracking.settle_min_samples, 3);
        assert_eq!(config.connection.backoff_max_attempts, 8);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.alerts.low_battery_percent = 25;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_not_found_unless_layered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(Config::load(&path), Err(ConfigError::NotFound(_))));
        assert_eq!(Config::load_layered(&path).unwrap(), Config::default());
    }

    #[test]
    fn layered_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[telemetry]\nfreshness_window_ms = 8000\n").unwrap();

        let config = Config::load_layered(&path).unwrap();
        assert_eq!(config.telemetry.freshness_window_ms, 8000);
        assert_eq!(config.telemetry.tick_interval_ms, 1000);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = Config::default();
        config.calibration.fallback_empty_distance_mm = 10;
        config.tracking.timezone = "Mars/Olympus".into();
        config.tracking.settle_band_ml = 50.0;
        config.connection.backoff_jitter = 1.5;

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => {
                let fields: Vec<String> = errors.iter().map(ToString::to_string).collect();
                assert_eq!(errors.len(), 4, "{fields:?}");
                assert!(fields.iter().any(|f| f.starts_with("tracking.timezone")));
            }
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn single_validation_error_is_not_wrapped() {
        let mut config = Config::default();
        config.tracking.daily_goal_ml = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "tracking.daily_goal_ml"
        ));
    }

    #[test]
    fn device_id_format() {
        assert!(is_valid_device_id("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_device_id("aa:bb:cc:dd:ee:01"));
        assert!(!is_valid_device_id("AA:BB:CC:DD:EE"));
        assert!(!is_valid_device_id("AA-BB-CC-DD-EE-FF"));
    }

    #[test]
    fn timezone_names() {
        assert!(is_valid_timezone("America/Sao_Paulo"));
        assert!(!is_valid_timezone("Nowhere/Special"));
    }
}
