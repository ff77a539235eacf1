//! Persistence of profiles, ledgers and alerts.
//!
//! [`FileStore`] keeps one JSON document per entity under the data directory:
//!
//! ```text
//! <data_dir>/profiles/<device>.json
//! <data_dir>/ledgers/<device>/<YYYY-MM-DD>.json
//! <data_dir>/alerts/<alert-id>.json
//! ```
//!
//! [`MemoryStore`] holds the same data in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::alerts::Alert;
use crate::calibration::CalibrationProfile;
use crate::error::StorageError;
use crate::tracking::{DailyLedger, IntakeEvent, LedgerError};
use crate::types::DeviceId;

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistence collaborator used by the orchestrator.
pub trait Storage: Send + Sync {
    /// Saved calibration for a device.
    fn load_calibration_profile(&self, device_id: &DeviceId)
        -> StorageResult<Option<CalibrationProfile>>;

    /// Save (replace) a device calibration.
    fn save_calibration_profile(&self, profile: &CalibrationProfile) -> StorageResult<()>;

    /// Append one intake event to its ledger. Appending the same event twice is a no-op.
    fn append_intake_event(&self, event: &IntakeEvent) -> StorageResult<()>;

    /// Ledger for a device and local date.
    fn load_daily_ledger(
        &self,
        device_id: &DeviceId,
        date: NaiveDate,
    ) -> StorageResult<Option<DailyLedger>>;

    /// Save (replace) a whole ledger. Used when a ledger is opened or sealed.
    fn save_daily_ledger(&self, ledger: &DailyLedger) -> StorageResult<()>;

    /// Create an alert, or replace it when escalated.
    fn create_alert(&self, alert: &Alert) -> StorageResult<()>;

    /// Mark an alert acknowledged.
    fn acknowledge_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> StorageResult<()>;

    /// Unacknowledged alerts of a device.
    fn load_open_alerts(&self, device_id: &DeviceId) -> StorageResult<Vec<Alert>>;
}

/// Default data directory.
///
/// On Linux: `/var/lib/sipsense`. Elsewhere the platform data dir.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/sipsense")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "sipsense")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("data"))
    }
}

fn merge_event(ledger: &mut DailyLedger, event: &IntakeEvent) -> StorageResult<()> {
    match ledger.append(event.clone()) {
        Ok(()) | Err(LedgerError::Duplicate(_)) => Ok(()),
        Err(e) => Err(StorageError::with_source("cannot append intake event", e)),
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON documents on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `data_dir`. Directories are created on first write.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn device_dir_name(device_id: &DeviceId) -> String {
        device_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    fn profile_path(&self, device_id: &DeviceId) -> PathBuf {
        self.data_dir
            .join("profiles")
            .join(format!("{}.json", Self::device_dir_name(device_id)))
    }

    fn ledger_path(&self, device_id: &DeviceId, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join("ledgers")
            .join(Self::device_dir_name(device_id))
            .join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    fn alerts_dir(&self) -> PathBuf {
        self.data_dir.join("alerts")
    }

    fn alert_path(&self, id: Uuid) -> PathBuf {
        self.alerts_dir().join(format!("{id}.json"))
    }

    fn read<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::with_source(
                    format!("cannot read {}", path.display()),
                    e,
                ))
            }
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            StorageError::with_source(format!("corrupt document {}", path.display()), e)
        })
    }

    fn write<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::with_source(format!("cannot create {}", parent.display()), e)
            })?;
        }
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StorageError::with_source("cannot serialize document", e))?;
        // Write-then-rename so readers never see a partial document.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .and_then(|()| std::fs::rename(&tmp, path))
            .map_err(|e| StorageError::with_source(format!("cannot write {}", path.display()), e))?;
        debug!(path = %path.display(), "Document written");
        Ok(())
    }
}

impl Storage for FileStore {
    fn load_calibration_profile(
        &self,
        device_id: &DeviceId,
    ) -> StorageResult<Option<CalibrationProfile>> {
        Self::read(&self.profile_path(device_id))
    }

    fn save_calibration_profile(&self, profile: &CalibrationProfile) -> StorageResult<()> {
        Self::write(&self.profile_path(&profile.device_id), profile)
    }

    fn append_intake_event(&self, event: &IntakeEvent) -> StorageResult<()> {
        let path = self.ledger_path(&event.device_id, event.ledger_date);
        let Some(mut ledger) = Self::read::<DailyLedger>(&path)? else {
            return Err(StorageError::new(format!(
                "no ledger for {} on {}",
                event.device_id, event.ledger_date
            )));
        };
        merge_event(&mut ledger, event)?;
        Self::write(&path, &ledger)
    }

    fn load_daily_ledger(
        &self,
        device_id: &DeviceId,
        date: NaiveDate,
    ) -> StorageResult<Option<DailyLedger>> {
        Self::read(&self.ledger_path(device_id, date))
    }

    fn save_daily_ledger(&self, ledger: &DailyLedger) -> StorageResult<()> {
        Self::write(&self.ledger_path(&ledger.device_id, ledger.date), ledger)
    }

    fn create_alert(&self, alert: &Alert) -> StorageResult<()> {
        Self::write(&self.alert_path(alert.id), alert)
    }

    fn acknowledge_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> StorageResult<()> {
        let path = self.alert_path(alert_id);
        let Some(mut alert) = Self::read::<Alert>(&path)? else {
            return Err(StorageError::new(format!("alert {alert_id} not found")));
        };
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_at = Some(at);
            Self::write(&path, &alert)?;
        }
        Ok(())
    }

    fn load_open_alerts(&self, device_id: &DeviceId) -> StorageResult<Vec<Alert>> {
        let dir = self.alerts_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::with_source(
                    format!("cannot list {}", dir.display()),
                    e,
                ))
            }
        };

        let mut alerts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(alert) = Self::read::<Alert>(&path)? {
                if !alert.acknowledged && alert.device_id == *device_id {
                    alerts.push(alert);
                }
            }
        }
        alerts.sort_by_key(|a| a.created_at);
        Ok(alerts)
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    profiles: HashMap<DeviceId, CalibrationProfile>,
    ledgers: HashMap<(DeviceId, NaiveDate), DailyLedger>,
    alerts: HashMap<Uuid, Alert>,
    intake_appends: usize,
    failing: bool,
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.failing {
            Err(StorageError::new("store is failing writes"))
        } else {
            Ok(state)
        }
    }

    /// Make every write fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Number of `append_intake_event` calls received, successful or not.
    #[must_use]
    pub fn intake_appends(&self) -> usize {
        self.state().intake_appends
    }

    /// Every alert ever stored.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.state().alerts.values().cloned().collect()
    }
}

impl Storage for MemoryStore {
    fn load_calibration_profile(
        &self,
        device_id: &DeviceId,
    ) -> StorageResult<Option<CalibrationProfile>> {
        Ok(self.state().profiles.get(device_id).cloned())
    }

    fn save_calibration_profile(&self, profile: &CalibrationProfile) -> StorageResult<()> {
        self.writable()?
            .profiles
            .insert(profile.device_id.clone(), profile.clone());
        Ok(())
    }

    fn append_intake_event(&self, event: &IntakeEvent) -> StorageResult<()> {
        self.state().intake_appends += 1;
        let mut state = self.writable()?;
        let key = (event.device_id.clone(), event.ledger_date);
        let Some(ledger) = state.ledgers.get_mut(&key) else {
            return Err(StorageError::new(format!(
                "no ledger for {} on {}",
                event.device_id, event.ledger_date
            )));
        };
        merge_event(ledger, event)
    }

    fn load_daily_ledger(
        &self,
        device_id: &DeviceId,
        date: NaiveDate,
    ) -> StorageResult<Option<DailyLedger>> {
        Ok(self
            .state()
            .ledgers
            .get(&(device_id.clone(), date))
            .cloned())
    }

    fn save_daily_ledger(&self, ledger: &DailyLedger) -> StorageResult<()> {
        self.writable()?
            .ledgers
            .insert((ledger.device_id.clone(), ledger.date), ledger.clone());
        Ok(())
    }

    fn create_alert(&self, alert: &Alert) -> StorageResult<()> {
        self.writable()?.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    fn acknowledge_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.writable()?;
        let alert = state
            .alerts
            .get_mut(&alert_id)
            .ok_or_else(|| StorageError::new(format!("alert {alert_id} not found")))?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_at = Some(at);
        }
        Ok(())
    }

    fn load_open_alerts(&self, device_id: &DeviceId) -> StorageResult<Vec<Alert>> {
        let mut alerts: Vec<Alert> = self
            .state()
            .alerts
            .values()
            .filter(|a| !a.acknowledged && a.device_id == *device_id)
            .cloned()
            .collect();
        alerts.sort_by_key(|a| a.created_at);
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::alerts::{AlertType, Severity};
    use crate::types::Confidence;

    fn device() -> DeviceId {
        DeviceId::new("AA:BB:CC:DD:EE:FF")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn intake(amount_ml: f64) -> IntakeEvent {
        IntakeEvent {
            id: Uuid::new_v4(),
            device_id: device(),
            amount_ml,
            settled_at: Utc.with_ymd_and_hms(2025, 3, 14, 11, 0, 0).unwrap(),
            ledger_date: date(),
            confidence: Confidence::Calibrated,
        }
    }

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            device_id: device(),
            alert_type: AlertType::LowBattery,
            severity: Severity::Warning,
            message: "Bottle battery at 15%".into(),
            acknowledged: false,
            acknowledged_at: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap(),
            escalated_at: None,
        }
    }

    fn stores() -> (tempfile::TempDir, Vec<Box<dyn Storage>>) {
        let dir = tempfile::tempdir().unwrap();
        let stores: Vec<Box<dyn Storage>> = vec![
            Box::new(FileStore::new(dir.path())),
            Box::new(MemoryStore::new()),
        ];
        (dir, stores)
    }

    #[test]
    fn profile_round_trip_is_exact() {
        let (_dir, stores) = stores();
        let profile = CalibrationProfile {
            device_id: device(),
            empty_distance_mm: 203,
            full_distance_mm: 17,
            bottle_volume_ml: 747.35,
            calibrated_at: Utc.with_ymd_and_hms(2025, 3, 14, 8, 30, 12).unwrap()
                + chrono::Duration::nanoseconds(123_456_789),
        };
        for store in &stores {
            assert_eq!(store.load_calibration_profile(&device()).unwrap(), None);
            store.save_calibration_profile(&profile).unwrap();
            assert_eq!(
                store.load_calibration_profile(&device()).unwrap(),
                Some(profile.clone())
            );
        }
    }

    #[test]
    fn intake_appends_to_saved_ledger_once() {
        let (_dir, stores) = stores();
        for store in &stores {
            let event = intake(150.0);
            assert!(store.append_intake_event(&event).is_err(), "no ledger yet");

            store
                .save_daily_ledger(&DailyLedger::new(device(), date(), 2000.0))
                .unwrap();
            store.append_intake_event(&event).unwrap();
            store.append_intake_event(&event).unwrap();
            store.append_intake_event(&intake(50.0)).unwrap();

            let ledger = store.load_daily_ledger(&device(), date()).unwrap().unwrap();
            assert_eq!(ledger.events.len(), 2);
            assert!((ledger.total_ml - 200.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn alerts_upsert_and_acknowledge() {
        let (_dir, stores) = stores();
        for store in &stores {
            let mut alert = alert();
            store.create_alert(&alert).unwrap();
            alert.severity = Severity::Critical;
            store.create_alert(&alert).unwrap();

            let open = store.load_open_alerts(&device()).unwrap();
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].severity, Severity::Critical);

            let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 5, 0).unwrap();
            store.acknowledge_alert(alert.id, at).unwrap();
            assert!(store.load_open_alerts(&device()).unwrap().is_empty());
            assert!(store.acknowledge_alert(Uuid::new_v4(), at).is_err());
        }
    }

    #[test]
    fn file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .save_daily_ledger(&DailyLedger::new(device(), date(), 2000.0))
            .unwrap();
        assert!(dir
            .path()
            .join("ledgers/AA-BB-CC-DD-EE-FF/2025-03-14.json")
            .exists());
    }

    #[test]
    fn corrupt_documents_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let path = dir.path().join("profiles/AA-BB-CC-DD-EE-FF.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        let err = store.load_calibration_profile(&device()).unwrap_err();
        assert!(err.message().contains("corrupt"));
    }

    #[test]
    fn failing_memory_store_counts_attempts() {
        let store = MemoryStore::new();
        store
            .save_daily_ledger(&DailyLedger::new(device(), date(), 2000.0))
            .unwrap();
        store.set_failing(true);
        assert!(store.append_intake_event(&intake(100.0)).is_err());
        assert_eq!(store.intake_appends(), 1);
    }
}
