use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::period::{DateRange, Granularity};

/// Count and cost for one local calendar day. Derived, never stored as truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub count: u32,
    pub cost: f64,

    /// At least one event on this day predates every known price config
    pub cost_undefined: bool,
}

impl DailyBucket {
    #[must_use]
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            count: 0,
            cost: 0.0,
            cost_undefined: false,
        }
    }
}

/// Aggregated count and cost for one piece of a period breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSlice {
    pub range: DateRange,
    pub count: u64,
    pub cost: f64,
}

/// Statistics over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub range: DateRange,
    pub granularity: Granularity,

    pub total_count: u64,
    pub total_cost: f64,

    /// total_count / days elapsed (days up to and including today when the
    /// range contains today, the full length for past ranges, none for future ones)
    pub average_per_elapsed_day: f64,
    pub elapsed_days: i64,

    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,

    /// Day with the highest count (earliest wins ties); `None` with no events
    pub peak_day: Option<DailyBucket>,

    pub cost_undefined: bool,

    /// Currency of the price history, if any price is known
    pub currency: Option<String>,

    /// Per-day, per-week or per-month subtotals, clipped to `range`
    pub breakdown: Vec<PeriodSlice>,
}

/// Which days count towards a streak. Always chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreakRule {
    /// Logging streak: a day qualifies with one or more events.
    AtLeastOneEvent,
    /// Goal streak: a day qualifies with at most `max_events` events.
    /// `max_events = 0` is an abstinence streak.
    WithinDailyLimit { max_events: u32 },
}

impl StreakRule {
    #[must_use]
    pub fn abstinence() -> Self {
        StreakRule::WithinDailyLimit { max_events: 0 }
    }

    #[must_use]
    pub fn is_satisfied_by(&self, count: u32) -> bool {
        match self {
            StreakRule::AtLeastOneEvent => count >= 1,
            StreakRule::WithinDailyLimit { max_events } => count <= *max_events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streak {
    pub rule: StreakRule,
    pub current_length: u32,
    pub longest_length: u32,
    pub longest_started_on: Option<NaiveDate>,

    /// The day that ended the current streak, if one did
    pub broken_at: Option<NaiveDate>,
}

/// Period-over-period change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub delta_count: i64,
    pub delta_cost: f64,

    /// (current - previous) / previous on counts; `None` when previous is zero
    pub percent_change: Option<f64>,

    /// Same rule applied to cost
    pub percent_change_cost: Option<f64>,
}

/// A period, the period right before it, and how they differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub current: PeriodStats,
    pub previous: PeriodStats,
    pub comparison: Comparison,
}
