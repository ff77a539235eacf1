//! Two-point calibration from sensor distance to water volume.
//!
//! ```text
//! volume_ml = clamp((empty - distance) / (empty - full), 0, 1) * bottle_volume_ml
//! ```
//!
//! The active profile sits behind an `Arc` that is swapped whole, so a normalisation in
//! progress sees either the old profile or the new one, never a mix.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::error::CalibrationError;
use crate::telemetry::SensorReading;
use crate::types::{Confidence, DeviceId};

/// Per-device two-point calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// Device the profile belongs to.
    pub device_id: DeviceId,
    /// Distance reading with the bottle empty.
    pub empty_distance_mm: u32,
    /// Distance reading with the bottle full.
    pub full_distance_mm: u32,
    /// Bottle capacity.
    pub bottle_volume_ml: f64,
    /// When the calibration was taken.
    pub calibrated_at: DateTime<Utc>,
}

impl CalibrationProfile {
    /// Build a validated profile.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidProfile`] unless `empty > full` and the volume is positive.
    pub fn new(
        device_id: DeviceId,
        empty_distance_mm: u32,
        full_distance_mm: u32,
        bottle_volume_ml: f64,
        calibrated_at: DateTime<Utc>,
    ) -> Result<Self, CalibrationError> {
        let profile = Self {
            device_id,
            empty_distance_mm,
            full_distance_mm,
            bottle_volume_ml,
            calibrated_at,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Check the profile invariants (also used on profiles loaded from storage).
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidProfile`] describing the first violation.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.empty_distance_mm <= self.full_distance_mm {
            return Err(CalibrationError::InvalidProfile(format!(
                "empty distance ({} mm) must be greater than full distance ({} mm)",
                self.empty_distance_mm, self.full_distance_mm
            )));
        }
        if !self.bottle_volume_ml.is_finite() || self.bottle_volume_ml <= 0.0 {
            return Err(CalibrationError::InvalidProfile(format!(
                "bottle volume must be positive, got {}",
                self.bottle_volume_ml
            )));
        }
        Ok(())
    }
}

/// Fill fraction for `distance_mm`, clamped to `[0, 1]`.
#[must_use]
pub fn fill_fraction(empty_distance_mm: u32, full_distance_mm: u32, distance_mm: u32) -> f64 {
    let span = f64::from(empty_distance_mm) - f64::from(full_distance_mm);
    if span <= 0.0 {
        return 0.0;
    }
    ((f64::from(empty_distance_mm) - f64::from(distance_mm)) / span).clamp(0.0, 1.0)
}

/// Calibrated (or fallback) water level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterLevelSample {
    /// Water volume.
    pub volume_ml: f64,
    /// Fill fraction in `[0, 1]`.
    pub percent_full: f64,
    /// Whether a calibration profile produced this value.
    pub confidence: Confidence,
    /// Receipt time of the underlying reading.
    pub timestamp: DateTime<Utc>,
    /// Bottle capacity used for the mapping.
    pub capacity_ml: f64,
    /// The raw distance.
    pub distance_mm: u32,
}

/// Maps readings to water levels using the active profile or the fallback mapping.
#[derive(Debug)]
pub struct CalibrationEngine {
    min_valid_distance_mm: u32,
    fallback_empty_mm: u32,
    fallback_full_mm: u32,
    fallback_volume_ml: f64,
    profile: RwLock<Option<Arc<CalibrationProfile>>>,
}

impl CalibrationEngine {
    /// An engine in fallback mode.
    #[must_use]
    pub const fn new(config: &CalibrationConfig) -> Self {
        Self {
            min_valid_distance_mm: config.min_valid_distance_mm,
            fallback_empty_mm: config.fallback_empty_distance_mm,
            fallback_full_mm: config.fallback_full_distance_mm,
            fallback_volume_ml: config.fallback_bottle_volume_ml,
            profile: RwLock::new(None),
        }
    }

    /// Active profile, if any.
    #[must_use]
    pub fn profile(&self) -> Option<Arc<CalibrationProfile>> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a profile is active.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.profile().is_some()
    }

    /// Active profile, or an error in fallback mode.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::NotCalibrated`] without a profile.
    pub fn require_profile(&self) -> Result<Arc<CalibrationProfile>, CalibrationError> {
        self.profile().ok_or(CalibrationError::NotCalibrated)
    }

    /// Replace the active profile. Returns the previous one.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidProfile`] if the profile fails validation; the active
    /// profile is left untouched.
    pub fn install(
        &self,
        profile: CalibrationProfile,
    ) -> Result<Option<Arc<CalibrationProfile>>, CalibrationError> {
        profile.validate()?;
        if profile.full_distance_mm < self.min_valid_distance_mm {
            warn!(
                device_id = %profile.device_id,
                full_distance_mm = profile.full_distance_mm,
                min_valid_distance_mm = self.min_valid_distance_mm,
                "Full calibration point is below the minimum valid distance"
            );
        }
        info!(
            device_id = %profile.device_id,
            empty_distance_mm = profile.empty_distance_mm,
            full_distance_mm = profile.full_distance_mm,
            bottle_volume_ml = profile.bottle_volume_ml,
            "Calibration profile installed"
        );
        let next = Arc::new(profile);
        let mut slot = self.profile.write().unwrap_or_else(PoisonError::into_inner);
        Ok(slot.replace(next))
    }

    /// Bottle capacity of the active mapping.
    #[must_use]
    pub fn capacity_ml(&self) -> f64 {
        self.profile()
            .map_or(self.fallback_volume_ml, |p| p.bottle_volume_ml)
    }

    /// Convert a reading to a water level.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidRange`] for readings below the minimum valid distance.
    pub fn normalize(&self, reading: &SensorReading) -> Result<WaterLevelSample, CalibrationError> {
        self.normalize_distance(reading.distance_mm, reading.received_at)
    }

    /// Convert a bare distance to a water level.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidRange`] for distances below the minimum valid distance.
    pub fn normalize_distance(
        &self,
        distance_mm: u32,
        timestamp: DateTime<Utc>,
    ) -> Result<WaterLevelSample, CalibrationError> {
        if distance_mm < self.min_valid_distance_mm {
            return Err(CalibrationError::InvalidRange {
                distance_mm,
                min_mm: self.min_valid_distance_mm,
            });
        }

        // One snapshot of the profile for the whole computation.
        let profile = self.profile();
        let (empty, full, capacity, confidence) = match profile.as_deref() {
            Some(p) => (
                p.empty_distance_mm,
                p.full_distance_mm,
                p.bottle_volume_ml,
                Confidence::Calibrated,
            ),
            None => (
                self.fallback_empty_mm,
                self.fallback_full_mm,
                self.fallback_volume_ml,
                Confidence::Raw,
            ),
        };

        let percent_full = fill_fraction(empty, full, distance_mm);
        Ok(WaterLevelSample {
            volume_ml: percent_full * capacity,
            percent_full,
            confidence,
            timestamp,
            capacity_ml: capacity,
            distance_mm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CalibrationEngine {
        CalibrationEngine::new(&CalibrationConfig::default())
    }

    fn profile(empty: u32, full: u32, volume: f64) -> CalibrationProfile {
        CalibrationProfile::new(DeviceId::new("AA:BB:CC:DD:EE:FF"), empty, full, volume, Utc::now())
            .unwrap()
    }

    #[test]
    fn midpoint_of_a_750ml_bottle() {
        let engine = engine();
        engine.install(profile(200, 20, 750.0)).unwrap();

        let sample = engine.normalize_distance(110, Utc::now()).unwrap();
        assert!((sample.volume_ml - 375.0).abs() < 1e-9);
        assert!((sample.percent_full - 0.5).abs() < 1e-9);
        assert_eq!(sample.confidence, Confidence::Calibrated);
    }

    #[test]
    fn readings_beyond_the_calibration_points_clamp() {
        let engine = engine();
        engine.install(profile(200, 20, 750.0)).unwrap();

        for distance in [200, 201, 500, u32::MAX] {
            let sample = engine.normalize_distance(distance, Utc::now()).unwrap();
            assert!(sample.percent_full.abs() < f64::EPSILON, "{distance}");
        }
        for distance in [20, 15, 10] {
            let sample = engine.normalize_distance(distance, Utc::now()).unwrap();
            assert!((sample.percent_full - 1.0).abs() < f64::EPSILON, "{distance}");
        }
    }

    #[test]
    fn obstruction_is_no_reading_not_full() {
        let engine = engine();
        engine.install(profile(200, 20, 750.0)).unwrap();
        assert_eq!(
            engine.normalize_distance(4, Utc::now()),
            Err(CalibrationError::InvalidRange {
                distance_mm: 4,
                min_mm: 10
            })
        );
    }

    #[test]
    fn fallback_mode_is_raw_confidence() {
        let engine = engine();
        assert!(!engine.is_calibrated());
        assert_eq!(engine.require_profile(), Err(CalibrationError::NotCalibrated));

        let sample = engine.normalize_distance(110, Utc::now()).unwrap();
        assert_eq!(sample.confidence, Confidence::Raw);
        assert!((sample.capacity_ml - 750.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_profiles_are_refused() {
        let id = DeviceId::new("AA");
        assert!(matches!(
            CalibrationProfile::new(id.clone(), 20, 200, 750.0, Utc::now()),
            Err(CalibrationError::InvalidProfile(_))
        ));
        assert!(matches!(
            CalibrationProfile::new(id.clone(), 200, 200, 750.0, Utc::now()),
            Err(CalibrationError::InvalidProfile(_))
        ));
        assert!(matches!(
            CalibrationProfile::new(id, 200, 20, 0.0, Utc::now()),
            Err(CalibrationError::InvalidProfile(_))
        ));
    }

    #[test]
    fn install_swaps_whole_profile() {
        let engine = engine();
        assert!(engine.install(profile(200, 20, 750.0)).unwrap().is_none());

        let before = engine.profile().unwrap();
        let previous = engine.install(profile(300, 40, 1000.0)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&before, &previous));

        // A reader holding the old Arc still sees it complete.
        assert_eq!(before.empty_distance_mm, 200);
        assert!((before.bottle_volume_ml - 750.0).abs() < f64::EPSILON);
        assert!((engine.capacity_ml() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fill_fraction_degenerate_span() {
        assert!(fill_fraction(20, 200, 100).abs() < f64::EPSILON);
    }
}
