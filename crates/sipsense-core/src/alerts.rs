//! Alert rules and deduplication.
//!
//! Four rules run against an [`AlertContext`]:
//! - **offline**: link down or data stale for longer than a threshold while a session
//!   is expected
//! - **missed pace**: intake at the latest checkpoint behind the goal fraction implied by
//!   elapsed active hours
//! - **low battery**: reported level under a threshold
//! - **dehydration**: pace missed for a sustained period and no intake for a long window
//!
//! While data is stale only the offline rule runs. Quantities derived from raw
//! (uncalibrated) levels never produce more than a warning.
//!
//! Deduplication keys on `(device, type)`. A condition that stays active never raises a
//! second alert; when it crosses a stricter threshold the open alert is escalated in
//! place. A new onset inside the cooldown window is folded into the open alert. After
//! acknowledgment the suppression is cleared, but a condition that simply persists
//! only re-alerts when it gets worse than what was acknowledged.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::tracking::DailyLedger;
use crate::types::{Confidence, ConnectionState, DeviceId};

/// Alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// No link or no fresh data.
    DeviceOffline,
    /// Behind the daily goal.
    MissedPace,
    /// Peripheral battery low.
    LowBattery,
    /// Sustained missed pace with no drinking.
    Dehydration,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeviceOffline => "device_offline",
            Self::MissedPace => "missed_pace",
            Self::LowBattery => "low_battery",
            Self::Dehydration => "dehydration",
        })
    }
}

/// Ordered severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs attention now.
    Critical,
}

/// One raised condition.
///
/// Only the acknowledgment fields change after creation, plus `severity`, `message` and
/// `escalated_at` when the alert is escalated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id.
    pub id: Uuid,
    /// Device.
    pub device_id: DeviceId,
    /// Category.
    pub alert_type: AlertType,
    /// Current severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Whether a caregiver acknowledged it.
    pub acknowledged: bool,
    /// When it was acknowledged.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When it was raised.
    pub created_at: DateTime<Utc>,
    /// When it was last escalated.
    pub escalated_at: Option<DateTime<Utc>>,
}

/// What an evaluation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertChange {
    /// A new alert.
    Raised(Alert),
    /// An open alert with raised severity.
    Escalated(Alert),
}

impl AlertChange {
    /// The alert after the change.
    #[must_use]
    pub const fn alert(&self) -> &Alert {
        match self {
            Self::Raised(alert) | Self::Escalated(alert) => alert,
        }
    }
}

/// Inputs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct AlertContext<'a> {
    /// Evaluation time.
    pub now: DateTime<Utc>,
    /// Current link state.
    pub connection_state: ConnectionState,
    /// Start of the current outage (link down or data stale).
    pub offline_since: Option<DateTime<Utc>>,
    /// Whether the device is expected to be connected.
    pub session_active: bool,
    /// Whether telemetry is fresh.
    pub data_fresh: bool,
    /// Today's ledger.
    pub ledger: &'a DailyLedger,
    /// Most recent drink, possibly from an earlier day.
    pub last_intake_at: Option<DateTime<Utc>>,
    /// Reported battery level.
    pub battery_percent: Option<u8>,
    /// Confidence of the levels behind the ledger.
    pub confidence: Confidence,
}

struct Finding {
    alert_type: AlertType,
    severity: Severity,
    message: String,
}

/// Evaluates rules for one device and owns its alerts.
#[derive(Debug)]
pub struct AlertEngine {
    device_id: DeviceId,
    config: AlertConfig,
    timezone: Tz,
    open: Vec<Alert>,
    suppressed_until: HashMap<AlertType, DateTime<Utc>>,
    active: HashSet<AlertType>,
    acknowledged_severity: HashMap<AlertType, Severity>,
    pace_missed_since: Option<DateTime<Utc>>,
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

fn after(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    at.checked_add_signed(seconds(secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl AlertEngine {
    /// An engine with no alerts.
    #[must_use]
    pub fn new(device_id: DeviceId, config: AlertConfig, timezone: Tz) -> Self {
        Self {
            device_id,
            config,
            timezone,
            open: Vec::new(),
            suppressed_until: HashMap::new(),
            active: HashSet::new(),
            acknowledged_severity: HashMap::new(),
            pace_missed_since: None,
        }
    }

    /// Re-adopt unacknowledged alerts loaded from storage.
    pub fn restore(&mut self, alerts: impl IntoIterator<Item = Alert>) {
        for alert in alerts {
            if alert.acknowledged || alert.device_id != self.device_id {
                continue;
            }
            if self.open.iter().any(|a| a.id == alert.id) {
                continue;
            }
            let until = after(alert.created_at, self.config.cooldown_secs);
            self.suppressed_until
                .entry(alert.alert_type)
                .and_modify(|t| *t = (*t).max(until))
                .or_insert(until);
            self.active.insert(alert.alert_type);
            self.open.push(alert);
        }
        self.open.sort_by_key(|a| a.created_at);
    }

    /// Unacknowledged alerts, oldest first.
    #[must_use]
    pub fn active_alerts(&self) -> &[Alert] {
        &self.open
    }

    /// Whether this engine owns an open alert with `id`.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.open.iter().any(|a| a.id == id)
    }

    /// Acknowledge an open alert and clear the suppression for its type.
    ///
    /// Returns the acknowledged alert, or `None` if no open alert has this id.
    pub fn acknowledge(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<Alert> {
        let index = self.open.iter().position(|a| a.id == id)?;
        let mut alert = self.open.remove(index);
        alert.acknowledged = true;
        alert.acknowledged_at = Some(now);

        self.suppressed_until.remove(&alert.alert_type);
        self.acknowledged_severity
            .entry(alert.alert_type)
            .and_modify(|s| *s = (*s).max(alert.severity))
            .or_insert(alert.severity);
        info!(
            device_id = %self.device_id,
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            "Alert acknowledged"
        );
        Some(alert)
    }

    /// Run every rule and apply deduplication.
    pub fn evaluate(&mut self, ctx: &AlertContext<'_>) -> Vec<AlertChange> {
        let mut evaluated = vec![AlertType::DeviceOffline];
        let mut findings: Vec<Finding> = self.offline_finding(ctx).into_iter().collect();

        if ctx.data_fresh {
            evaluated.extend([
                AlertType::LowBattery,
                AlertType::MissedPace,
                AlertType::Dehydration,
            ]);
            findings.extend(self.battery_finding(ctx));
            let pace = self.pace_finding(ctx);
            self.pace_missed_since = match (&pace, self.pace_missed_since) {
                (Some(_), Some(since)) => Some(since),
                (Some(_), None) => Some(ctx.now),
                (None, _) => None,
            };
            findings.extend(pace);
            findings.extend(self.dehydration_finding(ctx));
        } else {
            debug!(device_id = %self.device_id, "Data not fresh, only the offline rule runs");
        }

        let mut changes = Vec::new();
        for alert_type in evaluated {
            match findings.iter().position(|f| f.alert_type == alert_type) {
                Some(index) => {
                    let mut finding = findings.swap_remove(index);
                    if ctx.confidence == Confidence::Raw
                        && matches!(alert_type, AlertType::MissedPace | AlertType::Dehydration)
                    {
                        finding.severity = finding.severity.min(Severity::Warning);
                    }
                    changes.extend(self.apply(finding, ctx.now));
                }
                None => {
                    self.active.remove(&alert_type);
                    self.acknowledged_severity.remove(&alert_type);
                }
            }
        }
        changes
    }

    fn apply(&mut self, finding: Finding, now: DateTime<Utc>) -> Option<AlertChange> {
        let alert_type = finding.alert_type;
        let continuing = !self.active.insert(alert_type);
        let in_cooldown = self
            .suppressed_until
            .get(&alert_type)
            .is_some_and(|until| now < *until);

        if let Some(open) = self
            .open
            .iter_mut()
            .rev()
            .find(|a| a.alert_type == alert_type)
        {
            if continuing || in_cooldown {
                if finding.severity <= open.severity {
                    return None;
                }
                open.severity = finding.severity;
                open.message = finding.message;
                open.escalated_at = Some(now);
                warn!(
                    device_id = %self.device_id,
                    alert_id = %open.id,
                    alert_type = %alert_type,
                    severity = ?open.severity,
                    "Alert escalated"
                );
                return Some(AlertChange::Escalated(open.clone()));
            }
        } else if continuing
            && self
                .acknowledged_severity
                .get(&alert_type)
                .is_some_and(|acked| finding.severity <= *acked)
        {
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            device_id: self.device_id.clone(),
            alert_type,
            severity: finding.severity,
            message: finding.message,
            acknowledged: false,
            acknowledged_at: None,
            created_at: now,
            escalated_at: None,
        };
        self.suppressed_until
            .insert(alert_type, after(now, self.config.cooldown_secs));
        warn!(
            device_id = %self.device_id,
            alert_id = %alert.id,
            alert_type = %alert_type,
            severity = ?alert.severity,
            message = %alert.message,
            "Alert raised"
        );
        self.open.push(alert.clone());
        Some(AlertChange::Raised(alert))
    }

    // -------------------------------------------------------------------------
    // Rules
    // -------------------------------------------------------------------------

    fn offline_finding(&self, ctx: &AlertContext<'_>) -> Option<Finding> {
        if !ctx.session_active {
            return None;
        }
        let since = ctx.offline_since?;
        let elapsed = ctx.now - since;
        let severity = if elapsed >= seconds(self.config.offline_critical_after_secs) {
            Severity::Critical
        } else if elapsed >= seconds(self.config.offline_after_secs) {
            Severity::Warning
        } else {
            return None;
        };
        let reason = if ctx.connection_state == ConnectionState::Connected {
            "no telemetry received"
        } else {
            "not connected"
        };
        Some(Finding {
            alert_type: AlertType::DeviceOffline,
            severity,
            message: format!("Bottle offline for {} min ({reason})", elapsed.num_minutes()),
        })
    }

    fn battery_finding(&self, ctx: &AlertContext<'_>) -> Option<Finding> {
        let level = ctx.battery_percent?;
        let severity = if level <= self.config.critical_battery_percent {
            Severity::Critical
        } else if level <= self.config.low_battery_percent {
            Severity::Warning
        } else {
            return None;
        };
        Some(Finding {
            alert_type: AlertType::LowBattery,
            severity,
            message: format!("Bottle battery at {level}%"),
        })
    }

    fn pace_finding(&self, ctx: &AlertContext<'_>) -> Option<Finding> {
        let local = ctx.now.with_timezone(&self.timezone);
        if ctx.ledger.date != local.date_naive() || ctx.ledger.goal_ml <= 0.0 {
            return None;
        }
        let hour = local.hour();
        let checkpoint = self
            .config
            .pace_checkpoint_hours
            .iter()
            .copied()
            .filter(|h| *h <= hour)
            .max()?;

        let start = self.config.active_hours_start;
        let end = self.config.active_hours_end;
        if checkpoint <= start || end <= start {
            return None;
        }
        let fraction =
            (f64::from(checkpoint - start) / f64::from(end - start)).clamp(0.0, 1.0);
        let expected = ctx.ledger.goal_ml * fraction;
        let shortfall = (expected - ctx.ledger.total_ml) / expected;

        let severity = if shortfall > self.config.pace_critical_tolerance {
            Severity::Critical
        } else if shortfall > self.config.pace_tolerance {
            Severity::Warning
        } else {
            return None;
        };
        Some(Finding {
            alert_type: AlertType::MissedPace,
            severity,
            message: format!(
                "Behind pace: {:.0} ml of {expected:.0} ml expected by {checkpoint:02}:00",
                ctx.ledger.total_ml
            ),
        })
    }

    fn dehydration_finding(&self, ctx: &AlertContext<'_>) -> Option<Finding> {
        let missed_since = self.pace_missed_since?;
        if ctx.now - missed_since < seconds(self.config.dehydration_sustained_pace_secs) {
            return None;
        }
        let reference = match ctx.last_intake_at {
            Some(at) => at,
            None => {
                let day_start = ctx
                    .ledger
                    .date
                    .and_hms_opt(self.config.active_hours_start, 0, 0)?;
                self.timezone
                    .from_local_datetime(&day_start)
                    .earliest()?
                    .with_timezone(&Utc)
            }
        };
        let dry_for = ctx.now - reference;
        if dry_for < seconds(self.config.dehydration_no_intake_secs) {
            return None;
        }
        Some(Finding {
            alert_type: AlertType::Dehydration,
            severity: Severity::Critical,
            message: format!(
                "Possible dehydration: no drinks for {} h and behind pace",
                dry_for.num_hours()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const ID: &str = "AA:BB:CC:DD:EE:FF";

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(DeviceId::new(ID), AlertConfig::default(), chrono_tz::UTC)
    }

    fn ledger(total_ml: f64) -> DailyLedger {
        let mut ledger = DailyLedger::new(
            DeviceId::new(ID),
            NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            2000.0,
        );
        ledger.total_ml = total_ml;
        ledger
    }

    fn ctx(now: DateTime<Utc>, ledger: &DailyLedger) -> AlertContext<'_> {
        AlertContext {
            now,
            connection_state: ConnectionState::Connected,
            offline_since: None,
            session_active: true,
            data_fresh: true,
            ledger,
            last_intake_at: Some(now),
            battery_percent: Some(80),
            confidence: Confidence::Calibrated,
        }
    }

    fn raised(changes: &[AlertChange]) -> Vec<&Alert> {
        changes
            .iter()
            .filter_map(|c| match c {
                AlertChange::Raised(a) => Some(a),
                AlertChange::Escalated(_) => None,
            })
            .collect()
    }

    #[test]
    fn quiet_when_everything_is_fine() {
        let ledger = ledger(1500.0);
        assert!(engine().evaluate(&ctx(at(15, 0), &ledger)).is_empty());
    }

    #[test]
    fn offline_warns_then_escalates_in_place() {
        let mut engine = engine();
        let ledger = ledger(0.0);
        let since = at(9, 0);
        let mut context = ctx(at(9, 3), &ledger);
        context.connection_state = ConnectionState::Reconnecting;
        context.offline_since = Some(since);
        context.data_fresh = false;

        assert!(engine.evaluate(&context).is_empty(), "under threshold");

        context.now = at(9, 6);
        let changes = engine.evaluate(&context);
        let alert = raised(&changes)[0].clone();
        assert_eq!(alert.alert_type, AlertType::DeviceOffline);
        assert_eq!(alert.severity, Severity::Warning);

        context.now = at(9, 45);
        let changes = engine.evaluate(&context);
        assert!(matches!(
            &changes[..],
            [AlertChange::Escalated(a)] if a.id == alert.id && a.severity == Severity::Critical
        ));
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn offline_needs_an_expected_session() {
        let mut engine = engine();
        let ledger = ledger(0.0);
        let mut context = ctx(at(12, 0), &ledger);
        context.session_active = false;
        context.offline_since = Some(at(8, 0));
        context.data_fresh = false;
        assert!(engine.evaluate(&context).is_empty());
    }

    #[test]
    fn no_duplicate_within_cooldown_and_ack_clears_suppression() {
        let mut engine = engine();
        let ledger = ledger(1500.0);
        let mut context = ctx(at(15, 0), &ledger);
        context.battery_percent = Some(15);

        let first = engine.evaluate(&context);
        assert_eq!(raised(&first).len(), 1);

        // Condition clears and recurs inside the cooldown window.
        context.battery_percent = Some(60);
        context.now = at(15, 5);
        assert!(engine.evaluate(&context).is_empty());
        context.battery_percent = Some(14);
        context.now = at(15, 10);
        assert!(engine.evaluate(&context).is_empty());
        assert_eq!(engine.active_alerts().len(), 1);

        // Persisting after acknowledgment does not re-alert at the same severity.
        let id = engine.active_alerts()[0].id;
        let acked = engine.acknowledge(id, at(15, 11)).unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_at, Some(at(15, 11)));
        context.now = at(15, 12);
        assert!(engine.evaluate(&context).is_empty());

        // A fresh recurrence raises a new alert even inside the old cooldown.
        context.battery_percent = Some(70);
        context.now = at(15, 13);
        engine.evaluate(&context);
        context.battery_percent = Some(12);
        context.now = at(15, 14);
        let again = engine.evaluate(&context);
        assert_eq!(raised(&again).len(), 1);
        assert_ne!(raised(&again)[0].id, id);
    }

    #[test]
    fn worsening_after_ack_raises_again() {
        let mut engine = engine();
        let ledger = ledger(1500.0);
        let mut context = ctx(at(15, 0), &ledger);
        context.battery_percent = Some(15);
        let id = raised(&engine.evaluate(&context))[0].id;
        engine.acknowledge(id, at(15, 1)).unwrap();

        context.battery_percent = Some(4);
        context.now = at(15, 2);
        let changes = engine.evaluate(&context);
        assert_eq!(raised(&changes)[0].severity, Severity::Critical);
    }

    #[test]
    fn recurrence_after_cooldown_raises_even_if_unacknowledged() {
        let mut engine = engine();
        let ledger = ledger(1500.0);
        let mut context = ctx(at(13, 0), &ledger);
        context.battery_percent = Some(15);
        engine.evaluate(&context);

        context.battery_percent = Some(50);
        context.now = at(13, 10);
        engine.evaluate(&context);

        context.battery_percent = Some(15);
        context.now = at(13, 40);
        assert_eq!(raised(&engine.evaluate(&context)).len(), 1);
        assert_eq!(engine.active_alerts().len(), 2);
    }

    #[test]
    fn missed_pace_at_checkpoint() {
        let mut engine = engine();
        // Goal 2000 over 08-22: by 12:00, 4/14 of the goal (571 ml) is expected.
        let behind = ledger(400.0);
        let changes = engine.evaluate(&ctx(at(12, 30), &behind));
        let alert = raised(&changes)[0];
        assert_eq!(alert.alert_type, AlertType::MissedPace);
        assert_eq!(alert.severity, Severity::Warning);

        let on_track = ledger(560.0);
        assert!(self::engine().evaluate(&ctx(at(12, 30), &on_track)).is_empty());
        assert!(self::engine().evaluate(&ctx(at(9, 30), &ledger(0.0))).is_empty(), "before first checkpoint");
    }

    #[test]
    fn raw_confidence_caps_severity() {
        let mut engine = engine();
        let empty = ledger(0.0);
        let mut context = ctx(at(16, 0), &empty);
        context.confidence = Confidence::Raw;
        let changes = engine.evaluate(&context);
        assert_eq!(raised(&changes)[0].severity, Severity::Warning);
    }

    #[test]
    fn stale_data_suppresses_everything_but_offline() {
        let mut engine = engine();
        let empty = ledger(0.0);
        let mut context = ctx(at(16, 0), &empty);
        context.data_fresh = false;
        context.battery_percent = Some(2);
        assert!(engine.evaluate(&context).is_empty());
    }

    #[test]
    fn dehydration_after_sustained_missed_pace() {
        let mut engine = engine();
        let empty = ledger(0.0);
        let mut context = ctx(at(10, 0), &empty);
        context.last_intake_at = None;

        let first = engine.evaluate(&context);
        assert!(raised(&first)
            .iter()
            .all(|a| a.alert_type == AlertType::MissedPace));

        context.now = at(12, 0);
        let later = engine.evaluate(&context);
        let dehydration: Vec<_> = later
            .iter()
            .map(AlertChange::alert)
            .filter(|a| a.alert_type == AlertType::Dehydration)
            .collect();
        assert_eq!(dehydration.len(), 1);
        assert_eq!(dehydration[0].severity, Severity::Critical);
    }

    #[test]
    fn restored_alerts_are_not_raised_again() {
        let mut first = engine();
        let ledger = ledger(1500.0);
        let mut context = ctx(at(15, 0), &ledger);
        context.battery_percent = Some(15);
        let stored: Vec<Alert> = first
            .evaluate(&context)
            .iter()
            .map(|c| c.alert().clone())
            .collect();

        let mut second = engine();
        second.restore(stored);
        context.now = at(15, 1);
        assert!(second.evaluate(&context).is_empty());
        assert_eq!(second.active_alerts().len(), 1);
    }

    #[test]
    fn acknowledging_unknown_alert_is_none() {
        assert!(engine().acknowledge(Uuid::new_v4(), at(10, 0)).is_none());
    }
}
