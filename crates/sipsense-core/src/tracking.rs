//! Hydration state: level smoothing, drink detection and the daily ledger.
//!
//! Smoothing is the pure function [`smooth`]: it keeps the longest recent run of samples
//! that agree within a small band and calls the run's median *settled* once the run has
//! held for the whole settle window, however many samples arrived in that time. Drinks are settled-level decreases larger than a noise threshold. Small
//! changes leave the previous settled level in place, so slow sipping accumulates until
//! it crosses the threshold.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calibration::WaterLevelSample;
use crate::config::TrackingConfig;
use crate::types::{Confidence, DeviceId};

// =============================================================================
// SMOOTHING
// =============================================================================

/// Tuning for [`smooth`].
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingParams {
    /// Maximum samples kept for the median. Older agreeing samples still count toward
    /// the settle span.
    pub window: usize,
    /// Minimum time span of a settled run.
    pub settle_window: chrono::Duration,
    /// Minimum samples in a settled run.
    pub min_samples: usize,
    /// Spread allowed inside a run.
    pub band_ml: f64,
    /// Absolute floor of the drink threshold.
    pub min_intake_ml: f64,
    /// Drink threshold relative to capacity.
    pub threshold_ratio: f64,
}

impl From<&TrackingConfig> for SmoothingParams {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            window: config.smoothing_window.max(1),
            settle_window: chrono::Duration::milliseconds(
                i64::try_from(config.settle_window_ms).unwrap_or(i64::MAX / 1_000_000),
            ),
            min_samples: config.settle_min_samples.max(1),
            band_ml: config.settle_band_ml,
            min_intake_ml: config.min_intake_ml,
            threshold_ratio: config.intake_threshold_ratio,
        }
    }
}

impl SmoothingParams {
    /// Smallest settled change that counts, for a bottle of `capacity_ml`.
    #[must_use]
    pub fn noise_threshold(&self, capacity_ml: f64) -> f64 {
        self.min_intake_ml.max(self.threshold_ratio * capacity_ml)
    }
}

/// Filter state carried between samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmoothingState {
    run: VecDeque<(DateTime<Utc>, f64)>,
    run_started: Option<DateTime<Utc>>,
    settled_ml: Option<f64>,
}

impl SmoothingState {
    /// Last settled level.
    #[must_use]
    pub const fn settled_ml(&self) -> Option<f64> {
        self.settled_ml
    }

    /// Samples in the current run.
    #[must_use]
    pub fn run_len(&self) -> usize {
        self.run.len()
    }
}

/// A change of the settled level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LevelChange {
    /// First settled level after start or reset.
    Baseline {
        /// Settled level.
        level_ml: f64,
    },
    /// Level fell by more than the noise threshold: a drink.
    Drop {
        /// Previous settled level.
        from_ml: f64,
        /// New settled level.
        to_ml: f64,
    },
    /// Level rose by more than the noise threshold: a refill.
    Refill {
        /// Previous settled level.
        from_ml: f64,
        /// New settled level.
        to_ml: f64,
    },
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 && mid > 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted.get(mid).copied().unwrap_or_default()
    }
}

fn spread(run: &VecDeque<(DateTime<Utc>, f64)>) -> f64 {
    let (lo, hi) = run
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| {
            (lo.min(*v), hi.max(*v))
        });
    hi - lo
}

/// Feed one volume sample through the filter.
///
/// Returns the next state and, when the settled level moves, what kind of move it was.
#[must_use]
pub fn smooth(
    state: &SmoothingState,
    volume_ml: f64,
    at: DateTime<Utc>,
    capacity_ml: f64,
    params: &SmoothingParams,
) -> (SmoothingState, Option<LevelChange>) {
    let mut next = state.clone();
    next.run.push_back((at, volume_ml));
    while next.run.len() > params.window {
        next.run.pop_front();
    }
    // Keep only the newest samples that agree with each other. A disagreement restarts
    // the run at its oldest surviving sample.
    let mut broken = next.run_started.is_none();
    while next.run.len() > 1 && spread(&next.run) > params.band_ml {
        next.run.pop_front();
        broken = true;
    }
    if broken {
        next.run_started = next.run.front().map(|(first, _)| *first);
    }

    let span = next
        .run_started
        .map_or_else(chrono::Duration::zero, |started| at - started);
    if next.run.len() < params.min_samples || span < params.settle_window {
        return (next, None);
    }

    let level = median(next.run.iter().map(|(_, v)| *v));
    let change = match next.settled_ml {
        None => {
            next.settled_ml = Some(level);
            Some(LevelChange::Baseline { level_ml: level })
        }
        Some(previous) => {
            let threshold = params.noise_threshold(capacity_ml);
            if previous - level > threshold {
                next.settled_ml = Some(level);
                Some(LevelChange::Drop {
                    from_ml: previous,
                    to_ml: level,
                })
            } else if level - previous > threshold {
                next.settled_ml = Some(level);
                Some(LevelChange::Refill {
                    from_ml: previous,
                    to_ml: level,
                })
            } else {
                None
            }
        }
    };
    (next, change)
}

// =============================================================================
// LEDGER
// =============================================================================

/// Ledger invariant violations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// The ledger was sealed at rollover.
    #[error("Ledger for {0} is sealed")]
    Sealed(NaiveDate),

    /// The event belongs to another device.
    #[error("Event for device {actual} appended to ledger of {expected}")]
    WrongDevice {
        /// Ledger owner.
        expected: DeviceId,
        /// Event owner.
        actual: DeviceId,
    },

    /// Intake amounts must be positive.
    #[error("Intake amount must be positive, got {0}")]
    NonPositiveAmount(f64),

    /// The event was already appended.
    #[error("Intake event {0} already recorded")]
    Duplicate(Uuid),
}

/// One detected drink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeEvent {
    /// Unique id.
    pub id: Uuid,
    /// Device.
    pub device_id: DeviceId,
    /// Amount drunk.
    pub amount_ml: f64,
    /// When the lower level settled.
    pub settled_at: DateTime<Utc>,
    /// Local date of the ledger it belongs to.
    pub ledger_date: NaiveDate,
    /// Confidence of the samples the amount came from.
    pub confidence: Confidence,
}

/// All intake for one device on one local date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLedger {
    /// Device.
    pub device_id: DeviceId,
    /// Local date.
    pub date: NaiveDate,
    /// Sum of `events[].amount_ml`.
    pub total_ml: f64,
    /// Daily goal.
    pub goal_ml: f64,
    /// Events ordered by `settled_at`.
    pub events: Vec<IntakeEvent>,
    /// No appends after sealing.
    pub sealed: bool,
}

impl DailyLedger {
    /// An empty, open ledger.
    #[must_use]
    pub const fn new(device_id: DeviceId, date: NaiveDate, goal_ml: f64) -> Self {
        Self {
            device_id,
            date,
            total_ml: 0.0,
            goal_ml,
            events: Vec::new(),
            sealed: false,
        }
    }

    /// Append an event, keeping events ordered and the total equal to their sum.
    ///
    /// # Errors
    ///
    /// See [`LedgerError`]. A failed append leaves the ledger unchanged.
    pub fn append(&mut self, event: IntakeEvent) -> Result<(), LedgerError> {
        if self.sealed {
            return Err(LedgerError::Sealed(self.date));
        }
        if event.device_id != self.device_id {
            return Err(LedgerError::WrongDevice {
                expected: self.device_id.clone(),
                actual: event.device_id,
            });
        }
        if !(event.amount_ml.is_finite() && event.amount_ml > 0.0) {
            return Err(LedgerError::NonPositiveAmount(event.amount_ml));
        }
        if self.events.iter().any(|e| e.id == event.id) {
            return Err(LedgerError::Duplicate(event.id));
        }

        let at = self
            .events
            .partition_point(|e| e.settled_at <= event.settled_at);
        self.events.insert(at, event);
        self.total_ml = self.events.iter().map(|e| e.amount_ml).sum();
        Ok(())
    }

    /// Close the ledger for appends.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Fraction of the goal reached (may exceed 1).
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.goal_ml > 0.0 {
            self.total_ml / self.goal_ml
        } else {
            0.0
        }
    }

    /// Time of the latest event.
    #[must_use]
    pub fn last_intake_at(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.settled_at)
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Result of a midnight rollover.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollover {
    /// The previous ledger, now sealed.
    pub sealed: DailyLedger,
    /// The new, empty ledger.
    pub opened: DailyLedger,
}

/// What one sample changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    /// Settled level movement.
    pub change: Option<LevelChange>,
    /// Drink recorded in the ledger.
    pub intake: Option<IntakeEvent>,
    /// Rollover performed before the sample was applied.
    pub rollover: Option<Rollover>,
}

/// Per-device smoothing state and current ledger. The only writer of intake events.
#[derive(Debug)]
pub struct HydrationTracker {
    device_id: DeviceId,
    params: SmoothingParams,
    timezone: Tz,
    goal_ml: f64,
    state: SmoothingState,
    ledger: DailyLedger,
    last_intake_at: Option<DateTime<Utc>>,
}

impl HydrationTracker {
    /// Start tracking with `ledger` as the current day.
    #[must_use]
    pub fn new(config: &TrackingConfig, ledger: DailyLedger) -> Self {
        Self {
            device_id: ledger.device_id.clone(),
            params: SmoothingParams::from(config),
            timezone: config.tz(),
            goal_ml: config.daily_goal_ml,
            state: SmoothingState::default(),
            last_intake_at: ledger.last_intake_at(),
            ledger,
        }
    }

    /// Local date of `at` in the configured timezone.
    #[must_use]
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        local_date(self.timezone, at)
    }

    /// Current ledger.
    #[must_use]
    pub const fn ledger(&self) -> &DailyLedger {
        &self.ledger
    }

    /// Current smoothing state.
    #[must_use]
    pub const fn smoothing(&self) -> &SmoothingState {
        &self.state
    }

    /// Latest recorded drink, across ledgers.
    #[must_use]
    pub const fn last_intake_at(&self) -> Option<DateTime<Utc>> {
        self.last_intake_at
    }

    /// Forget the smoothed level (after recalibration).
    pub fn reset_smoothing(&mut self) {
        debug!(device_id = %self.device_id, "Smoothing state reset");
        self.state = SmoothingState::default();
    }

    /// Seal the current ledger and open a new one if `now` is past local midnight.
    /// Smoothing state is kept.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> Option<Rollover> {
        let today = self.local_date(now);
        if today <= self.ledger.date {
            return None;
        }
        let opened = DailyLedger::new(self.device_id.clone(), today, self.goal_ml);
        let mut sealed = std::mem::replace(&mut self.ledger, opened.clone());
        sealed.seal();
        info!(
            device_id = %self.device_id,
            sealed_date = %sealed.date,
            total_ml = sealed.total_ml,
            opened_date = %today,
            "Daily ledger rolled over"
        );
        Some(Rollover { sealed, opened })
    }

    /// Apply one water level sample.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] if the detected drink cannot be appended; the smoothing state has
    /// still advanced, so the drop is not reported again.
    pub fn observe(&mut self, sample: &WaterLevelSample) -> Result<TrackerUpdate, LedgerError> {
        let rollover = self.roll_over(sample.timestamp);
        let (state, change) = smooth(
            &self.state,
            sample.volume_ml,
            sample.timestamp,
            sample.capacity_ml,
            &self.params,
        );
        self.state = state;

        let mut update = TrackerUpdate {
            change,
            intake: None,
            rollover,
        };
        match change {
            Some(LevelChange::Drop { from_ml, to_ml }) => {
                let event = IntakeEvent {
                    id: Uuid::new_v4(),
                    device_id: self.device_id.clone(),
                    amount_ml: from_ml - to_ml,
                    settled_at: sample.timestamp,
                    ledger_date: self.ledger.date,
                    confidence: sample.confidence,
                };
                self.ledger.append(event.clone())?;
                self.last_intake_at = Some(event.settled_at);
                info!(
                    device_id = %self.device_id,
                    amount_ml = event.amount_ml,
                    total_ml = self.ledger.total_ml,
                    "Drink detected"
                );
                update.intake = Some(event);
            }
            Some(LevelChange::Refill { from_ml, to_ml }) => {
                debug!(device_id = %self.device_id, from_ml, to_ml, "Refill ignored");
            }
            Some(LevelChange::Baseline { level_ml }) => {
                debug!(device_id = %self.device_id, level_ml, "Baseline level settled");
            }
            None => {}
        }
        Ok(update)
    }
}

/// Local calendar date of `at` in `tz`.
#[must_use]
pub fn local_date(tz: Tz, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}
