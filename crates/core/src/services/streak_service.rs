use std::collections::BTreeMap;

use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::models::event::Event;
use crate::models::period::local_date;
use crate::models::stats::{Streak, StreakRule};

/// Computes current and longest streaks of consecutive qualifying days.
///
/// The rule is always supplied by the caller. Days without events count as
/// zero: they break a logging streak and extend an abstinence streak.
pub struct StreakService;

impl StreakService {
    pub fn new() -> Self {
        Self
    }

    /// Per-day event counts in zone `tz`. One pass over the log.
    pub fn daily_counts(&self, events: &[Event], tz: Tz) -> BTreeMap<NaiveDate, u32> {
        let mut counts = BTreeMap::new();
        for event in events {
            *counts.entry(local_date(event.occurred_at, tz)).or_insert(0) += 1;
        }
        counts
    }

    /// Streaks over the days `history_start..=today`.
    pub fn compute(
        &self,
        daily_counts: &BTreeMap<NaiveDate, u32>,
        history_start: NaiveDate,
        today: NaiveDate,
        rule: StreakRule,
    ) -> Streak {
        let qualifies = |date: NaiveDate| rule.is_satisfied_by(daily_counts.get(&date).copied().unwrap_or(0));

        let mut streak = Streak {
            rule,
            current_length: 0,
            longest_length: 0,
            longest_started_on: None,
            broken_at: None,
        };
        if history_start > today {
            return streak;
        }

        // Longest: one forward pass, earliest maximum kept on ties
        let mut run = 0;
        let mut run_start = history_start;
        for date in history_start.iter_days().take_while(|d| *d <= today) {
            if qualifies(date) {
                if run == 0 {
                    run_start = date;
                }
                run += 1;
                if run > streak.longest_length {
                    streak.longest_length = run;
                    streak.longest_started_on = Some(run_start);
                }
            } else {
                run = 0;
            }
        }

        // Current: walk back from today until the rule fails
        let mut cursor = Some(today);
        while let Some(date) = cursor.filter(|d| *d >= history_start) {
            if !qualifies(date) {
                streak.broken_at = Some(date);
                break;
            }
            streak.current_length += 1;
            cursor = date.pred_opt();
        }

        streak
    }
}

impl Default for StreakService {
    fn default() -> Self {
        Self::new()
    }
}
