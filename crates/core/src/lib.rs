pub mod clock;
pub mod errors;
pub mod models;
pub mod services;
pub mod storage;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use clock::{Clock, SystemClock};
use errors::CoreError;
use models::{
    event::{Event, EventPatch},
    export::{ExportDocument, ExportedEvent, ExportedPrice, ImportSummary},
    ledger::Ledger,
    period::{local_date, DateRange, Granularity},
    price::{PriceConfig, PriceTimeline},
    settings::{ResolvedSettings, Settings},
    stats::{Comparison, DailyBucket, PeriodComparison, PeriodStats, Streak, StreakRule},
};
use services::{
    aggregation_service::AggregationService,
    cache_service::{CancelToken, Generation, InvalidationCallback, ReactiveCache, SubscriptionId},
    comparison_service::ComparisonService,
    event_store::{events_between, EventStore},
    streak_service::StreakService,
};
use storage::{backend::EventBackend, manager::SnapshotManager};

/// Maximum stats range in days (one century).
const MAX_RANGE_DAYS: i64 = 36_525;

/// Main entry point for the Habit Ledger core library.
///
/// Owns the event log, the price timeline, the bucket cache and the
/// resolved settings. Every method takes `&self`: writes are serialized
/// internally and reads work on snapshots, so one ledger can be shared
/// across threads behind an `Arc`.
#[must_use]
pub struct HabitLedger {
    store: EventStore,
    timeline: RwLock<Arc<PriceTimeline>>,
    /// Serializes price-history writers; readers only touch `timeline`
    price_writer: Mutex<()>,
    cache: Arc<ReactiveCache>,
    settings: RwLock<SettingsState>,
    clock: Arc<dyn Clock>,
    aggregation_service: AggregationService,
    streak_service: StreakService,
    comparison_service: ComparisonService,
}

#[derive(Debug, Clone)]
struct SettingsState {
    raw: Settings,
    resolved: ResolvedSettings,
}

/// Everything one read needs, captured together.
struct View {
    generation: Generation,
    events: Arc<Vec<Event>>,
    timeline: Arc<PriceTimeline>,
    settings: ResolvedSettings,
    now: DateTime<Utc>,
}

impl std::fmt::Debug for HabitLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HabitLedger")
            .field("events", &self.store.len())
            .field("prices", &self.timeline.read().len())
            .field("settings", &self.settings.read().raw)
            .field("cached_buckets", &self.cache.len())
            .finish()
    }
}

impl HabitLedger {
    /// Create a brand new empty in-memory ledger with default settings.
    pub fn create_new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty in-memory ledger driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let store = EventStore::in_memory(Vec::new(), Arc::clone(&clock));
        Self::build(
            store,
            PriceTimeline::new(),
            Settings::default(),
            ResolvedSettings::default(),
            clock,
        )
    }

    /// Open a ledger over an external persistence backend.
    pub fn open(
        backend: Box<dyn EventBackend>,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let resolved = settings.resolve()?;
        let store = EventStore::open(backend, Arc::clone(&clock))?;
        Ok(Self::build(store, PriceTimeline::new(), settings, resolved, clock))
    }

    /// Restore a ledger from snapshot bytes.
    ///
    /// A snapshot whose content breaks the ledger's invariants is treated
    /// as corrupt, like one that cannot be parsed at all.
    pub fn open_snapshot(bytes: &[u8], clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let ledger = SnapshotManager::load_from_bytes(bytes)?;
        Self::from_ledger(ledger, clock)
    }

    /// Restore a ledger from a snapshot file (native only).
    #[cfg(not(target_arch = "wasm32"))]
    pub fn open_snapshot_file(path: &str, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let ledger = SnapshotManager::load_from_file(path)?;
        Self::from_ledger(ledger, clock)
    }

    /// Serialize events, price history and settings to snapshot bytes.
    pub fn save_snapshot(&self) -> Result<Vec<u8>, CoreError> {
        SnapshotManager::save_to_bytes(&self.to_ledger())
    }

    /// Write a snapshot file (native only).
    #[cfg(not(target_arch = "wasm32"))]
    pub fn save_snapshot_file(&self, path: &str) -> Result<(), CoreError> {
        SnapshotManager::save_to_file(&self.to_ledger(), path)
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Log an event at `occurred_at`. Fails if that is in the future.
    pub fn append_event(&self, occurred_at: DateTime<Utc>, note: Option<String>) -> Result<Event, CoreError> {
        self.store.append(occurred_at, note)
    }

    /// Log an event at the current instant.
    pub fn log_now(&self, note: Option<String>) -> Result<Event, CoreError> {
        self.store.append(self.clock.now(), note)
    }

    pub fn update_event(&self, id: Uuid, patch: EventPatch) -> Result<Event, CoreError> {
        self.store.update(id, patch)
    }

    pub fn delete_event(&self, id: Uuid) -> Result<(), CoreError> {
        self.store.delete(id)
    }

    pub fn get_event(&self, id: Uuid) -> Result<Event, CoreError> {
        self.store.get(id)
    }

    /// Events with `start <= occurred_at < end`, oldest first.
    #[must_use]
    pub fn query_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        self.store.query(start, end)
    }

    /// Events on one local calendar day, oldest first.
    #[must_use]
    pub fn events_on(&self, date: NaiveDate) -> Vec<Event> {
        let tz = self.settings.read().resolved.tz;
        let (start, end) = DateRange::day(date).instants(tz);
        self.store.query(start, end)
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.store.len()
    }

    /// Number of days currently held in the bucket cache.
    #[must_use]
    pub fn cached_days(&self) -> usize {
        self.cache.len()
    }

    // ── Prices ──────────────────────────────────────────────────────

    /// Add an effective-dated price. Only the days it can affect (from its
    /// effective day to the next config's effective day) are invalidated.
    pub fn add_price_config(&self, config: PriceConfig) -> Result<(), CoreError> {
        let tz = self.settings.read().resolved.tz;
        let affected = {
            let _writer = self.price_writer.lock();
            let mut next = (**self.timeline.read()).clone();
            next.add_config(config.clone())?;
            let affected = [Self::price_invalidation_range(&next, &config, tz)];

            self.cache.begin_invalidation(&affected);
            *self.timeline.write() = Arc::new(next);
            affected
        };
        self.cache.finish_invalidation(&affected);

        debug!(effective_from = %config.effective_from, "price config added");
        Ok(())
    }

    /// Build, validate and add a price config in one step.
    pub fn add_price(
        &self,
        amount_per_bundle: f64,
        units_per_bundle: u32,
        currency: &str,
        effective_from: DateTime<Utc>,
    ) -> Result<PriceConfig, CoreError> {
        let config = PriceConfig::new(amount_per_bundle, units_per_bundle, currency, effective_from)?;
        self.add_price_config(config.clone())?;
        Ok(config)
    }

    /// The config in effect at `at`, or `None` before any price is known.
    #[must_use]
    pub fn resolve_price_at(&self, at: DateTime<Utc>) -> Option<PriceConfig> {
        self.timeline.read().resolve_price_at(at).config().cloned()
    }

    pub fn get_price_config(&self, id: Uuid) -> Result<PriceConfig, CoreError> {
        self.timeline.read().config(id).cloned()
    }

    /// Point-in-time view of the price history.
    #[must_use]
    pub fn price_timeline(&self) -> Arc<PriceTimeline> {
        Arc::clone(&self.timeline.read())
    }

    // ── Statistics ──────────────────────────────────────────────────

    /// Count and cost for one local calendar day. Served from the cache when
    /// possible.
    #[must_use]
    pub fn get_bucket(&self, date: NaiveDate) -> DailyBucket {
        if let Some(bucket) = self.cache.get(date) {
            debug!(%date, "bucket cache hit");
            return bucket;
        }
        let view = self.view();
        let bucket = self
            .aggregation_service
            .bucket(&view.events, &view.timeline, &view.settings, date);
        self.cache.commit(view.generation, vec![bucket.clone()]);
        bucket
    }

    /// One bucket per day of `range`.
    pub fn get_buckets(&self, range: DateRange) -> Result<Vec<DailyBucket>, CoreError> {
        Self::check_range(&range)?;
        let view = self.view();
        self.collect_buckets(&view, &range, None)
    }

    /// Statistics over `range`, broken down by `granularity`.
    ///
    /// Empty and future ranges yield zero totals; the only error is a
    /// range longer than a century.
    pub fn get_period_stats(&self, range: DateRange, granularity: Granularity) -> Result<PeriodStats, CoreError> {
        self.period_stats(range, granularity, None)
    }

    /// Same as [`Self::get_period_stats`], abandoned with
    /// `CoreError::Cancelled` once `cancel` fires. An abandoned run never
    /// writes to the shared cache.
    pub fn get_period_stats_cancellable(
        &self,
        range: DateRange,
        granularity: Granularity,
        cancel: &CancelToken,
    ) -> Result<PeriodStats, CoreError> {
        self.period_stats(range, granularity, Some(cancel))
    }

    /// Statistics for the day, week or month containing `date`.
    pub fn get_stats_for(&self, date: NaiveDate, granularity: Granularity) -> Result<PeriodStats, CoreError> {
        let week_start = self.settings.read().resolved.week_start;
        self.get_period_stats(DateRange::containing(date, granularity, week_start), granularity)
    }

    /// Current and longest streak under an explicit `rule`.
    #[must_use]
    pub fn compute_streak(&self, rule: StreakRule) -> Streak {
        let view = self.view();
        let tz = view.settings.tz;
        let today = local_date(view.now, tz);
        let history_start = view
            .settings
            .tracking_since
            .or_else(|| view.events.first().map(|e| local_date(e.occurred_at, tz)))
            .unwrap_or(today);

        let counts = self.streak_service.daily_counts(&view.events, tz);
        self.streak_service.compute(&counts, history_start, today, rule)
    }

    #[must_use]
    pub fn compare(&self, current: &PeriodStats, previous: &PeriodStats) -> Comparison {
        self.comparison_service.compare(current, previous)
    }

    /// Stats for `range` and for the period right before it, compared.
    pub fn compare_with_previous(
        &self,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<PeriodComparison, CoreError> {
        let current = self.get_period_stats(range, granularity)?;
        let previous = self.get_period_stats(range.previous(), granularity)?;
        let comparison = self.comparison_service.compare(&current, &previous);
        Ok(PeriodComparison {
            current,
            previous,
            comparison,
        })
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Call `callback` whenever cached data overlapping `range` is
    /// invalidated. The callback receives the affected part of `range`.
    ///
    /// Callbacks run once the ledger's locks are released, so they may read
    /// from or write to the ledger again.
    pub fn on_invalidated(
        &self,
        range: DateRange,
        callback: impl Fn(DateRange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let callback: InvalidationCallback = Arc::new(callback);
        self.cache.subscribe(range, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    // ── Settings ────────────────────────────────────────────────────

    #[must_use]
    pub fn get_settings(&self) -> Settings {
        self.settings.read().raw.clone()
    }

    /// Replace the settings. Calendar days may move, so the whole cache is
    /// dropped and every subscriber is notified.
    pub fn set_settings(&self, settings: Settings) -> Result<(), CoreError> {
        let resolved = settings.resolve()?;
        let everything = [DateRange::all()];

        self.cache.begin_invalidation(&everything);
        self.cache.set_timezone(resolved.tz);
        *self.settings.write() = SettingsState {
            raw: settings,
            resolved,
        };
        self.cache.finish_invalidation(&everything);
        Ok(())
    }

    // ── Export / Import ─────────────────────────────────────────────

    /// All events and the full price history in the flat interchange format.
    #[must_use]
    pub fn export_document(&self) -> ExportDocument {
        let events = self.store.snapshot();
        let timeline = self.price_timeline();
        ExportDocument {
            events: events
                .iter()
                .map(|e| ExportedEvent {
                    id: e.id.to_string(),
                    occurred_at: e.occurred_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    note: e.note.clone(),
                })
                .collect(),
            price_history: timeline
                .entries()
                .iter()
                .map(|p| ExportedPrice {
                    effective_from: p.effective_from.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    amount_per_bundle: p.amount_per_bundle,
                    units_per_bundle: i64::from(p.units_per_bundle),
                    currency: p.currency.clone(),
                })
                .collect(),
        }
    }

    pub fn export_to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string_pretty(&self.export_document())
            .map_err(|e| CoreError::Serialization(format!("Failed to serialize export: {e}")))
    }

    /// Import a JSON export. Either every record is ingested or none is.
    ///
    /// Input that is not JSON at all is a `Deserialization` error; a record
    /// with a missing or mistyped field is a `Validation` error naming it.
    pub fn import_from_json(&self, json: &str) -> Result<ImportSummary, CoreError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let document =
            ExportDocument::from_json_value(value).inspect_err(|e| warn!("import rejected: {e}"))?;
        self.import_document(document)
    }

    /// Validate every record first, then apply events and prices together.
    pub fn import_document(&self, document: ExportDocument) -> Result<ImportSummary, CoreError> {
        let now = self.clock.now();
        let events = document
            .events
            .iter()
            .enumerate()
            .map(|(i, record)| parse_event(i, record, now))
            .collect::<Result<Vec<_>, _>>()
            .inspect_err(|e| warn!("import rejected: {e}"))?;
        let prices = document
            .price_history
            .iter()
            .enumerate()
            .map(|(i, record)| parse_price(i, record))
            .collect::<Result<Vec<_>, _>>()
            .inspect_err(|e| warn!("import rejected: {e}"))?;

        let tz = self.settings.read().resolved.tz;
        let writer = self.price_writer.lock();

        let mut next = (**self.timeline.read()).clone();
        for (i, config) in prices.iter().enumerate() {
            next.add_config(config.clone())
                .map_err(|e| prefix_field(e, &format!("priceHistory[{i}]")))
                .inspect_err(|e| warn!("import rejected: {e}"))?;
        }

        let summary = ImportSummary {
            events: events.len(),
            prices: prices.len(),
        };
        let affected = prices
            .iter()
            .map(|p| p.effective_from)
            .min()
            .map(|earliest| [DateRange::open_ended(local_date(earliest, tz))]);

        // Runs only once the events are accepted; releases the writer
        // before any subscriber is told.
        let apply_prices = move || {
            if let Some(affected) = &affected {
                self.cache.begin_invalidation(affected);
                *self.timeline.write() = Arc::new(next);
            }
            drop(writer);
        };
        if events.is_empty() {
            apply_prices();
        } else {
            self.store.append_batch_with(events, apply_prices)?;
        }
        if let Some(affected) = &affected {
            self.cache.finish_invalidation(affected);
        }

        info!(events = summary.events, prices = summary.prices, "import applied");
        Ok(summary)
    }

    // ── Internal ────────────────────────────────────────────────────

    fn build(
        store: EventStore,
        timeline: PriceTimeline,
        raw: Settings,
        resolved: ResolvedSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(ReactiveCache::new(resolved.tz));
        store.add_listener(cache.clone());

        Self {
            store,
            timeline: RwLock::new(Arc::new(timeline)),
            price_writer: Mutex::new(()),
            cache,
            settings: RwLock::new(SettingsState { raw, resolved }),
            clock,
            aggregation_service: AggregationService::new(),
            streak_service: StreakService::new(),
            comparison_service: ComparisonService::new(),
        }
    }

    fn from_ledger(ledger: Ledger, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let corrupt = |e: CoreError| CoreError::CorruptStore(format!("snapshot content is invalid: {e}"));

        let resolved = ledger.settings.resolve().map_err(corrupt)?;
        let timeline = PriceTimeline::from_configs(ledger.prices).map_err(corrupt)?;

        let mut ids = std::collections::HashSet::new();
        if let Some(dup) = ledger.events.iter().find(|e| !ids.insert(e.id)) {
            return Err(corrupt(CoreError::validation(
                "events",
                format!("duplicate event id {}", dup.id),
            )));
        }

        info!(events = ledger.events.len(), prices = timeline.len(), "snapshot loaded");
        let store = EventStore::in_memory(ledger.events, Arc::clone(&clock));
        Ok(Self::build(store, timeline, ledger.settings, resolved, clock))
    }

    fn to_ledger(&self) -> Ledger {
        Ledger {
            events: self.store.snapshot().to_vec(),
            prices: self.price_timeline().entries().to_vec(),
            settings: self.get_settings(),
        }
    }

    /// The generation is read before anything else so that any change
    /// published after it makes this view's commits stale.
    fn view(&self) -> View {
        let generation = self.cache.generation();
        let events = self.store.snapshot();
        let timeline = self.price_timeline();
        let settings = self.settings.read().resolved;
        View {
            generation,
            events,
            timeline,
            settings,
            now: self.clock.now(),
        }
    }

    fn check_range(range: &DateRange) -> Result<(), CoreError> {
        let days = range.num_days();
        if days > MAX_RANGE_DAYS {
            return Err(CoreError::validation(
                "range",
                format!("range of {days} days exceeds maximum of {MAX_RANGE_DAYS} days"),
            ));
        }
        Ok(())
    }

    fn period_stats(
        &self,
        range: DateRange,
        granularity: Granularity,
        cancel: Option<&CancelToken>,
    ) -> Result<PeriodStats, CoreError> {
        Self::check_range(&range)?;
        let view = self.view();
        let buckets = self.collect_buckets(&view, &range, cancel)?;

        let tz = view.settings.tz;
        let (start, end) = range.instants(tz);
        Ok(self.aggregation_service.period_stats(
            range,
            granularity,
            &buckets,
            events_between(&view.events, start, end),
            &view.settings,
            local_date(view.now, tz),
            view.timeline.currency(),
        ))
    }

    /// Cached buckets where available, the rest computed from the view.
    /// Freshly computed buckets are committed with the view's generation.
    fn collect_buckets(
        &self,
        view: &View,
        range: &DateRange,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<DailyBucket>, CoreError> {
        let is_cancelled = || cancel.is_some_and(CancelToken::is_cancelled);

        let cached = self.cache.get_range(range);
        let mut hits = 0usize;
        let mut fresh = Vec::new();
        let mut buckets = Vec::with_capacity(cached.len());

        for (date, hit) in range.days().zip(cached) {
            match hit {
                Some(bucket) => {
                    hits += 1;
                    buckets.push(bucket);
                }
                None => {
                    if is_cancelled() {
                        debug!(%range, "aggregation cancelled");
                        return Err(CoreError::Cancelled);
                    }
                    let bucket = self
                        .aggregation_service
                        .bucket(&view.events, &view.timeline, &view.settings, date);
                    fresh.push(bucket.clone());
                    buckets.push(bucket);
                }
            }
        }

        if is_cancelled() {
            debug!(%range, "aggregation cancelled");
            return Err(CoreError::Cancelled);
        }

        // Cache hits may postdate the view if a mutation landed meanwhile
        if hits > 0 && self.cache.generation() != view.generation {
            debug!(%range, "cache moved during read, recomputing from snapshot");
            return Ok(self
                .aggregation_service
                .buckets(&view.events, &view.timeline, &view.settings, range));
        }

        debug!(%range, hits, computed = fresh.len(), "buckets collected");
        if !fresh.is_empty() {
            self.cache.commit(view.generation, fresh);
        }
        Ok(buckets)
    }

    fn price_invalidation_range(timeline: &PriceTimeline, config: &PriceConfig, tz: chrono_tz::Tz) -> DateRange {
        let start = local_date(config.effective_from, tz);
        match timeline.next_after(config.effective_from) {
            Some(next) => DateRange {
                start,
                end: DateRange::day(local_date(next.effective_from, tz)).end,
            },
            None => DateRange::open_ended(start),
        }
    }
}

// ── Import parsing ──────────────────────────────────────────────────

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::validation(field, format!("'{value}' is not an ISO-8601 timestamp: {e}")))
}

fn parse_event(i: usize, record: &ExportedEvent, now: DateTime<Utc>) -> Result<Event, CoreError> {
    let id = Uuid::parse_str(&record.id).map_err(|e| {
        CoreError::validation(format!("events[{i}].id"), format!("'{}' is not a UUID: {e}", record.id))
    })?;
    let field = format!("events[{i}].occurredAt");
    let occurred_at = parse_timestamp(&field, &record.occurred_at)?;
    if occurred_at > now {
        return Err(CoreError::validation(field, format!("{occurred_at} is in the future")));
    }
    Ok(Event {
        id,
        occurred_at,
        note: record.note.clone(),
    })
}

fn parse_price(i: usize, record: &ExportedPrice) -> Result<PriceConfig, CoreError> {
    let prefix = format!("priceHistory[{i}]");
    let effective_from = parse_timestamp(&format!("{prefix}.effectiveFrom"), &record.effective_from)?;
    let units_per_bundle = u32::try_from(record.units_per_bundle).map_err(|_| {
        CoreError::validation(
            format!("{prefix}.unitsPerBundle"),
            format!("must be between 1 and {}, got {}", u32::MAX, record.units_per_bundle),
        )
    })?;
    PriceConfig::new(record.amount_per_bundle, units_per_bundle, &record.currency, effective_from)
        .map_err(|e| prefix_field(e, &prefix))
}

/// Point a config-level validation error at the import record it came from.
fn prefix_field(error: CoreError, prefix: &str) -> CoreError {
    match error {
        CoreError::Validation { field, message } => CoreError::Validation {
            field: format!("{prefix}.{}", camel_case(&field)),
            message,
        },
        other => other,
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
