use crate::models::stats::{Comparison, PeriodStats};

/// Period-over-period deltas.
pub struct ComparisonService;

impl ComparisonService {
    pub fn new() -> Self {
        Self
    }

    pub fn compare(&self, current: &PeriodStats, previous: &PeriodStats) -> Comparison {
        self.compare_totals(
            current.total_count,
            current.total_cost,
            previous.total_count,
            previous.total_cost,
        )
    }

    /// Percent changes are fractions (`0.25` is +25%) and are `None` when the
    /// previous value is zero, so callers never see infinities or NaN.
    pub fn compare_totals(
        &self,
        current_count: u64,
        current_cost: f64,
        previous_count: u64,
        previous_cost: f64,
    ) -> Comparison {
        let delta_count = current_count as i64 - previous_count as i64;
        let delta_cost = current_cost - previous_cost;

        Comparison {
            delta_count,
            delta_cost,
            percent_change: relative_change(delta_count as f64, previous_count as f64),
            percent_change_cost: relative_change(delta_cost, previous_cost),
        }
    }
}

impl Default for ComparisonService {
    fn default() -> Self {
        Self::new()
    }
}

fn relative_change(delta: f64, previous: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    let change = delta / previous;
    change.is_finite().then_some(change)
}
