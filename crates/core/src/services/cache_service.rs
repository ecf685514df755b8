use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tracing::debug;

use crate::models::period::{local_date, DateRange};
use crate::models::stats::DailyBucket;
use crate::services::event_store::MutationListener;

/// Called with the affected part of a subscribed range.
pub type InvalidationCallback = Arc<dyn Fn(DateRange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Cache version observed before a computation started. A commit carrying
/// an outdated token is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Lets a caller abandon an in-flight aggregation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CacheState {
    buckets: HashMap<NaiveDate, DailyBucket>,
    generation: u64,
    /// Invalidations begun but not finished; commits wait for zero
    in_flight: u32,
}

struct Subscription {
    id: SubscriptionId,
    range: DateRange,
    callback: InvalidationCallback,
}

/// Memo of per-day buckets with surgical invalidation.
///
/// A mutation drops only the days it touched, bumps the generation and tells
/// every subscriber whose range overlaps. Computations read the generation
/// before taking their snapshot and commit with it, so results computed
/// from a superseded snapshot never land in the cache. Invalidation is split
/// around the publish of new data; between the halves nothing is committed.
pub struct ReactiveCache {
    state: RwLock<CacheState>,
    subscribers: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
    tz: RwLock<Tz>,
}

impl std::fmt::Debug for ReactiveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ReactiveCache")
            .field("buckets", &state.buckets.len())
            .field("generation", &state.generation)
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl ReactiveCache {
    pub fn new(tz: Tz) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            tz: RwLock::new(tz),
        }
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.state.read().generation)
    }

    #[must_use]
    pub fn get(&self, date: NaiveDate) -> Option<DailyBucket> {
        self.state.read().buckets.get(&date).cloned()
    }

    /// Cached bucket for each day of `range`, in order.
    #[must_use]
    pub fn get_range(&self, range: &DateRange) -> Vec<Option<DailyBucket>> {
        let state = self.state.read();
        range.days().map(|d| state.buckets.get(&d).cloned()).collect()
    }

    /// Store freshly computed buckets unless something was invalidated since
    /// `token` was taken. Returns whether the buckets were stored.
    pub fn commit(&self, token: Generation, buckets: Vec<DailyBucket>) -> bool {
        let mut state = self.state.write();
        if state.generation != token.0 || state.in_flight > 0 {
            debug!(
                token = token.0,
                current = state.generation,
                dropped = buckets.len(),
                "stale aggregation result dropped"
            );
            return false;
        }
        for bucket in buckets {
            state.buckets.insert(bucket.date, bucket);
        }
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().buckets.is_empty()
    }

    /// First half of an invalidation, taken before the new data is
    /// published: drops the affected days and blocks commits until
    /// `finish_invalidation` runs.
    pub fn begin_invalidation(&self, ranges: &[DateRange]) {
        let mut state = self.state.write();
        Self::drop_ranges(&mut state, ranges);
        state.generation += 1;
        state.in_flight += 1;
    }

    /// Second half, after the new data is visible: drops the affected days
    /// again and notifies overlapping subscribers.
    pub fn finish_invalidation(&self, ranges: &[DateRange]) {
        {
            let mut state = self.state.write();
            Self::drop_ranges(&mut state, ranges);
            state.generation += 1;
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        debug!(ranges = ranges.len(), "cache invalidated");
        for range in ranges {
            self.notify(*range);
        }
    }

    /// Both halves at once, for changes that are already visible.
    pub fn invalidate(&self, ranges: &[DateRange]) {
        self.begin_invalidation(ranges);
        self.finish_invalidation(ranges);
    }

    pub fn invalidate_days(&self, days: &[NaiveDate]) {
        self.invalidate(&merge_days(days));
    }

    pub fn set_timezone(&self, tz: Tz) {
        *self.tz.write() = tz;
    }

    /// Register `callback` for invalidations overlapping `range`.
    pub fn subscribe(&self, range: DateRange, callback: InvalidationCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscription {
            id,
            range,
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    fn drop_ranges(state: &mut CacheState, ranges: &[DateRange]) {
        state
            .buckets
            .retain(|date, _| !ranges.iter().any(|r| r.contains(*date)));
    }

    /// Callbacks run after every lock is released, so they may query the
    /// ledger again.
    fn notify(&self, affected: DateRange) {
        let targets: Vec<(InvalidationCallback, DateRange)> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.range.intersects(&affected))
            .map(|s| {
                let clipped = DateRange {
                    start: s.range.start.max(affected.start),
                    end: s.range.end.min(affected.end),
                };
                (Arc::clone(&s.callback), clipped)
            })
            .collect();

        for (callback, range) in targets {
            callback(range);
        }
    }
}

impl ReactiveCache {
    fn touched_ranges(&self, touched: &[DateTime<Utc>]) -> Vec<DateRange> {
        let tz = *self.tz.read();
        let days: Vec<NaiveDate> = touched.iter().map(|t| local_date(*t, tz)).collect();
        merge_days(&days)
    }
}

impl MutationListener for ReactiveCache {
    fn events_changing(&self, touched: &[DateTime<Utc>]) {
        self.begin_invalidation(&self.touched_ranges(touched));
    }

    fn events_changed(&self, touched: &[DateTime<Utc>]) {
        self.finish_invalidation(&self.touched_ranges(touched));
    }
}

/// Collapse days into the minimal list of contiguous ranges.
fn merge_days(days: &[NaiveDate]) -> Vec<DateRange> {
    let mut sorted = days.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<DateRange> = Vec::new();
    for day in sorted {
        match ranges.last_mut() {
            Some(last) if last.end == day => last.end = DateRange::day(day).end,
            _ => ranges.push(DateRange::day(day)),
        }
    }
    ranges
}
