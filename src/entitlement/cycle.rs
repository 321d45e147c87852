//! Cycle-Window calculator (component B): a pure function mapping a
//! reset config, an anchor, and `now` to a half-open `[start, end)`
//! window. No I/O, no side effects — callers memoize if they want to
//! avoid recomputation.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

/// The calendar unit a reset/billing interval steps by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    /// Steps by minutes.
    Minute,
    /// Steps by hours.
    Hour,
    /// Steps by whole days.
    Day,
    /// Steps by whole weeks.
    Week,
    /// Steps by calendar months (anchored to day-of-month, clamped at month end).
    Month,
    /// Steps by calendar years.
    Year,
}

/// Whether a feature bills/resets on a recurring cadence or once, for the
/// life of the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Cycles recur every `interval * interval_count`.
    Recurring,
    /// A single window spanning the whole effective range.
    Onetime,
}

/// Reset cadence for a period-scoped aggregation, or billing cadence for
/// the embedded `billingConfig`. Both share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Human-readable cadence label (e.g. `"monthly"`).
    pub name: String,
    /// Calendar unit stepped through.
    pub reset_interval: IntervalUnit,
    /// Number of units per cycle (e.g. `3` + `Month` = quarterly).
    pub reset_interval_count: u32,
    /// Recurring vs. one-time.
    pub plan_type: PlanType,
    /// Epoch-ms anchor the cycle boundaries are aligned to.
    pub reset_anchor: DateTime<Utc>,
}

/// A half-open `[start, end)` cycle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    /// Inclusive start of the window.
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    /// Whether `instant` falls within `[start, end)`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

fn step_forward(from: DateTime<Utc>, unit: IntervalUnit, count: u32) -> DateTime<Utc> {
    let count = count.max(1);
    match unit {
        IntervalUnit::Minute => from + chrono::Duration::minutes(i64::from(count)),
        IntervalUnit::Hour => from + chrono::Duration::hours(i64::from(count)),
        IntervalUnit::Day => from + chrono::Duration::days(i64::from(count)),
        IntervalUnit::Week => from + chrono::Duration::weeks(i64::from(count)),
        IntervalUnit::Month => from
            .checked_add_months(Months::new(count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
        IntervalUnit::Year => from
            .checked_add_months(Months::new(count * 12))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

/// Compute the `[cycleStart, cycleEnd)` window containing `now`, or
/// `None` if `now` falls outside the entitlement's effective range
/// (or no window exists because the range has already been exhausted).
///
/// `trial_ends_at`, if set and in the future of `effective_start`, opens
/// a single extra window `[effective_start, trial_ends_at)` before
/// regular cycles begin at the trial's end — this keeps trial usage
/// isolated from the first paid cycle's meter.
pub fn cycle_window(
    effective_start: DateTime<Utc>,
    effective_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: Option<&ResetConfig>,
    trial_ends_at: Option<DateTime<Utc>>,
) -> Option<CycleWindow> {
    if now < effective_start {
        return None;
    }
    if let Some(end) = effective_end {
        if now >= end {
            return None;
        }
    }

    let Some(config) = config else {
        // No reset config: the whole effective range is one window.
        return Some(CycleWindow {
            start: effective_start,
            end: effective_end.unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
    };

    if matches!(config.plan_type, PlanType::Onetime) {
        return Some(CycleWindow {
            start: effective_start,
            end: effective_end.unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
    }

    if let Some(trial_end) = trial_ends_at {
        if trial_end > effective_start && now < trial_end {
            return Some(CycleWindow { start: effective_start, end: trial_end });
        }
    }

    // Regular cycles anchor at `reset_anchor` (or the trial end, or
    // effective_start if the anchor precedes the effective range) and
    // step forward monotonically until `now` falls inside a window.
    let mut cursor = trial_ends_at
        .filter(|t| *t > effective_start)
        .unwrap_or(config.reset_anchor.max(effective_start));

    // If the anchor is ahead of `now`, walk backward in single steps
    // until we bracket it — this keeps the function total without an
    // unbounded forward loop for anchors far in the future.
    while cursor > now {
        let back = step_back(cursor, config.reset_interval, config.reset_interval_count);
        if back >= cursor {
            break;
        }
        cursor = back;
    }

    loop {
        let next = step_forward(cursor, config.reset_interval, config.reset_interval_count);
        if next <= cursor {
            // Degenerate step (clamped at DateTime::MAX); bail out total.
            return Some(CycleWindow { start: cursor, end: next });
        }
        if cursor <= now && now < next {
            let end = effective_end.map_or(next, |e| next.min(e));
            return Some(CycleWindow { start: cursor, end });
        }
        cursor = next;
    }
}

fn step_back(from: DateTime<Utc>, unit: IntervalUnit, count: u32) -> DateTime<Utc> {
    let count = count.max(1);
    match unit {
        IntervalUnit::Minute => from - chrono::Duration::minutes(i64::from(count)),
        IntervalUnit::Hour => from - chrono::Duration::hours(i64::from(count)),
        IntervalUnit::Day => from - chrono::Duration::days(i64::from(count)),
        IntervalUnit::Week => from - chrono::Duration::weeks(i64::from(count)),
        IntervalUnit::Month => from
            .checked_sub_months(Months::new(count))
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        IntervalUnit::Year => from
            .checked_sub_months(Months::new(count * 12))
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn onetime_plan_spans_whole_range() {
        let cfg = ResetConfig {
            name: "lifetime".into(),
            reset_interval: IntervalUnit::Month,
            reset_interval_count: 1,
            plan_type: PlanType::Onetime,
            reset_anchor: dt(2026, 1, 1, 0),
        };
        let w = cycle_window(dt(2026, 1, 1, 0), Some(dt(2027, 1, 1, 0)), dt(2026, 6, 1, 0), Some(&cfg), None)
            .unwrap();
        assert_eq!(w.start, dt(2026, 1, 1, 0));
        assert_eq!(w.end, dt(2027, 1, 1, 0));
    }

    #[test]
    fn monthly_cycle_advances_across_boundary() {
        let cfg = ResetConfig {
            name: "monthly".into(),
            reset_interval: IntervalUnit::Month,
            reset_interval_count: 1,
            plan_type: PlanType::Recurring,
            reset_anchor: dt(2026, 1, 1, 0),
        };
        // Jan 31 falls in the January window.
        let w_jan = cycle_window(dt(2026, 1, 1, 0), None, dt(2026, 1, 31, 12), Some(&cfg), None).unwrap();
        assert_eq!(w_jan.start, dt(2026, 1, 1, 0));
        assert_eq!(w_jan.end, dt(2026, 2, 1, 0));

        // One second into February is a fresh window.
        let w_feb = cycle_window(dt(2026, 1, 1, 0), None, dt(2026, 2, 1, 0) + chrono::Duration::seconds(1), Some(&cfg), None).unwrap();
        assert_eq!(w_feb.start, dt(2026, 2, 1, 0));
        assert_eq!(w_feb.end, dt(2026, 3, 1, 0));
    }

    #[test]
    fn trial_window_precedes_first_cycle() {
        let cfg = ResetConfig {
            name: "monthly".into(),
            reset_interval: IntervalUnit::Month,
            reset_interval_count: 1,
            plan_type: PlanType::Recurring,
            reset_anchor: dt(2026, 1, 1, 0),
        };
        let trial_end = dt(2026, 1, 15, 0);
        let w = cycle_window(dt(2026, 1, 1, 0), None, dt(2026, 1, 10, 0), Some(&cfg), Some(trial_end)).unwrap();
        assert_eq!(w.start, dt(2026, 1, 1, 0));
        assert_eq!(w.end, trial_end);

        let w2 = cycle_window(dt(2026, 1, 1, 0), None, dt(2026, 1, 20, 0), Some(&cfg), Some(trial_end)).unwrap();
        assert_eq!(w2.start, trial_end);
    }

    #[test]
    fn now_before_effective_start_yields_none() {
        let w = cycle_window(dt(2026, 1, 1, 0), None, dt(2025, 12, 31, 0), None, None);
        assert!(w.is_none());
    }

    #[test]
    fn now_at_or_after_effective_end_yields_none() {
        let w = cycle_window(dt(2026, 1, 1, 0), Some(dt(2026, 2, 1, 0)), dt(2026, 2, 1, 0), None, None);
        assert!(w.is_none());
    }
}
