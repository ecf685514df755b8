use chrono::{DateTime, NaiveDate, Utc};

use crate::models::event::Event;
use crate::models::period::{local_date, DateRange, Granularity};
use crate::models::price::PriceTimeline;
use crate::models::settings::ResolvedSettings;
use crate::models::stats::{DailyBucket, PeriodSlice, PeriodStats};
use crate::services::event_store::events_between;

/// Computes daily buckets and period statistics.
///
/// Pure business logic over a point-in-time snapshot of the event log and
/// the price timeline. No locking, no I/O. Every function is total: empty
/// or future ranges produce zeroed results, never errors.
pub struct AggregationService;

impl AggregationService {
    pub fn new() -> Self {
        Self
    }

    /// Count and cost of the events on local day `date`.
    ///
    /// Cost per event is the unit cost in effect at its `occurred_at`; events
    /// before any known price add zero and set `cost_undefined`.
    pub fn bucket(
        &self,
        events: &[Event],
        timeline: &PriceTimeline,
        settings: &ResolvedSettings,
        date: NaiveDate,
    ) -> DailyBucket {
        let (start, end) = DateRange::day(date).instants(settings.tz);
        let mut bucket = DailyBucket::empty(date);
        for event in events_between(events, start, end) {
            let price = timeline.resolve_price_at(event.occurred_at);
            bucket.count += 1;
            bucket.cost += price.unit_cost();
            bucket.cost_undefined |= !price.is_defined();
        }
        bucket
    }

    /// One bucket per day of `range`, ascending.
    pub fn buckets(
        &self,
        events: &[Event],
        timeline: &PriceTimeline,
        settings: &ResolvedSettings,
        range: &DateRange,
    ) -> Vec<DailyBucket> {
        range
            .days()
            .map(|date| self.bucket(events, timeline, settings, date))
            .collect()
    }

    /// Statistics for `range` computed straight from the snapshot.
    pub fn compute_period_stats(
        &self,
        events: &[Event],
        timeline: &PriceTimeline,
        settings: &ResolvedSettings,
        range: DateRange,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> PeriodStats {
        let buckets = self.buckets(events, timeline, settings, &range);
        let (start, end) = range.instants(settings.tz);
        self.period_stats(
            range,
            granularity,
            &buckets,
            events_between(events, start, end),
            settings,
            local_date(now, settings.tz),
            timeline.currency(),
        )
    }

    /// Fold precomputed daily `buckets` (one per day of `range`, ascending)
    /// into period statistics. `range_events` are the events inside `range`,
    /// ascending, used for first/last timestamps.
    #[allow(clippy::too_many_arguments)]
    pub fn period_stats(
        &self,
        range: DateRange,
        granularity: Granularity,
        buckets: &[DailyBucket],
        range_events: &[Event],
        settings: &ResolvedSettings,
        today: NaiveDate,
        currency: Option<&str>,
    ) -> PeriodStats {
        let mut total_count: u64 = 0;
        let mut total_cost = 0.0;
        let mut cost_undefined = false;
        let mut peak: Option<&DailyBucket> = None;

        for bucket in buckets {
            total_count += u64::from(bucket.count);
            total_cost += bucket.cost;
            cost_undefined |= bucket.cost_undefined;
            // Strictly greater: the earliest day wins ties
            if bucket.count > 0 && peak.map_or(true, |p| bucket.count > p.count) {
                peak = Some(bucket);
            }
        }

        let elapsed_days = Self::elapsed_days(&range, today);
        let average_per_elapsed_day = if elapsed_days > 0 {
            total_count as f64 / elapsed_days as f64
        } else {
            0.0
        };

        PeriodStats {
            range,
            granularity,
            total_count,
            total_cost,
            average_per_elapsed_day,
            elapsed_days,
            first_event_at: range_events.first().map(|e| e.occurred_at),
            last_event_at: range_events.last().map(|e| e.occurred_at),
            peak_day: peak.cloned(),
            cost_undefined,
            currency: currency.map(str::to_string),
            breakdown: Self::breakdown(&range, granularity, settings, buckets),
        }
    }

    /// Days of `range` that have started by `today`: the partial current day
    /// counts as one, days after today do not count at all.
    #[must_use]
    pub fn elapsed_days(range: &DateRange, today: NaiveDate) -> i64 {
        if range.is_empty() || today < range.start {
            0
        } else if range.contains(today) {
            (today - range.start).num_days() + 1
        } else {
            range.num_days()
        }
    }

    fn breakdown(
        range: &DateRange,
        granularity: Granularity,
        settings: &ResolvedSettings,
        buckets: &[DailyBucket],
    ) -> Vec<PeriodSlice> {
        let mut remaining = buckets;
        range
            .split(granularity, settings.week_start)
            .into_iter()
            .map(|piece| {
                let len = remaining.partition_point(|b| b.date < piece.end);
                let (inside, rest) = remaining.split_at(len);
                remaining = rest;
                PeriodSlice {
                    range: piece,
                    count: inside.iter().map(|b| u64::from(b.count)).sum(),
                    cost: inside.iter().map(|b| b.cost).sum(),
                }
            })
            .collect()
    }
}

impl Default for AggregationService {
    fn default() -> Self {
        Self::new()
    }
}
