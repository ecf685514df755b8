use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::CoreError;
use crate::models::event::{Event, EventPatch};
use crate::storage::backend::{EventBackend, MemoryBackend};

/// Attempts made against the backend before a concurrency conflict is surfaced.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Told about every committed mutation, with the `occurred_at` instants it
/// touched (old and new for an edit). `events_changing` runs after the
/// backend accepted the write and before readers can see it;
/// `events_changed` runs once they can.
pub trait MutationListener: Send + Sync {
    fn events_changing(&self, touched: &[DateTime<Utc>]);
    fn events_changed(&self, touched: &[DateTime<Utc>]);
}

/// Ordered, append-only event log.
///
/// Writes go through a single lock around the backend, so rapid concurrent
/// appends are applied one at a time. Readers never take that lock: they
/// clone an `Arc` of the last published snapshot, which a writer replaces
/// only after the backend accepted the change.
pub struct EventStore {
    writer: Mutex<Box<dyn EventBackend>>,
    published: RwLock<Arc<Vec<Event>>>,
    listeners: RwLock<Vec<Arc<dyn MutationListener>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("events", &self.published.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventStore {
    /// Open a store over `backend`, loading everything it holds.
    pub fn open(mut backend: Box<dyn EventBackend>, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let mut events = with_retry("load", || backend.load())?;
        events.sort_by_key(|e| e.occurred_at);
        debug!(events = events.len(), "event store opened");

        Ok(Self {
            writer: Mutex::new(backend),
            published: RwLock::new(Arc::new(events)),
            listeners: RwLock::new(Vec::new()),
            clock,
        })
    }

    /// A store over a fresh `MemoryBackend` seeded with `events`.
    pub fn in_memory(mut events: Vec<Event>, clock: Arc<dyn Clock>) -> Self {
        events.sort_by_key(|e| e.occurred_at);
        let backend: Box<dyn EventBackend> = Box::new(MemoryBackend::with_events(events.clone()));
        Self {
            writer: Mutex::new(backend),
            published: RwLock::new(Arc::new(events)),
            listeners: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MutationListener>) {
        self.listeners.write().push(listener);
    }

    /// Point-in-time view of the whole log, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Event>> {
        Arc::clone(&self.published.read())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.published.read().is_empty()
    }

    /// Log a new event. Fails if `occurred_at` is after "now".
    pub fn append(&self, occurred_at: DateTime<Utc>, note: Option<String>) -> Result<Event, CoreError> {
        self.ensure_not_future("occurred_at", occurred_at)?;
        let event = Event {
            id: Uuid::new_v4(),
            occurred_at,
            note,
        };

        {
            let mut backend = self.writer.lock();
            with_retry("append", || backend.insert(&event))?;
            self.notify_changing(&[occurred_at]);
            self.publish(|events| binary_insert(events, event.clone()));
        }

        self.notify_changed(&[occurred_at]);
        Ok(event)
    }

    /// Events with `start <= occurred_at < end`, ascending.
    #[must_use]
    pub fn query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        let snapshot = self.snapshot();
        events_between(&snapshot, start, end).to_vec()
    }

    pub fn get(&self, id: Uuid) -> Result<Event, CoreError> {
        self.published
            .read()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| CoreError::event_not_found(id))
    }

    /// Apply `patch` to an existing event and return the updated event.
    pub fn update(&self, id: Uuid, patch: EventPatch) -> Result<Event, CoreError> {
        if let Some(occurred_at) = patch.occurred_at {
            self.ensure_not_future("occurred_at", occurred_at)?;
        }

        let (updated, touched) = {
            let mut backend = self.writer.lock();
            let old = self.get(id)?;
            let updated = patch.apply_to(&old);
            let touched = if old.occurred_at == updated.occurred_at {
                vec![old.occurred_at]
            } else {
                vec![old.occurred_at, updated.occurred_at]
            };
            with_retry("update", || backend.replace(&updated))?;
            self.notify_changing(&touched);
            self.publish(|events| {
                remove_by_id(events, id);
                binary_insert(events, updated.clone());
            });
            (updated, touched)
        };

        self.notify_changed(&touched);
        Ok(updated)
    }

    pub fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        let removed = {
            let mut backend = self.writer.lock();
            let removed = self.get(id)?;
            with_retry("delete", || backend.remove(id))?;
            self.notify_changing(&[removed.occurred_at]);
            self.publish(|events| {
                remove_by_id(events, id);
            });
            removed
        };

        self.notify_changed(&[removed.occurred_at]);
        Ok(())
    }

    /// Add pre-built events in one step: all of them or none.
    /// Ids must be new; timestamps must not be in the future.
    pub fn append_batch(&self, batch: Vec<Event>) -> Result<(), CoreError> {
        self.append_batch_with(batch, || {})
    }

    /// Like [`Self::append_batch`], running `on_published` once the batch is
    /// visible and before listeners hear about it. It is dropped unrun if
    /// the batch is rejected.
    pub fn append_batch_with(&self, batch: Vec<Event>, on_published: impl FnOnce()) -> Result<(), CoreError> {
        for (i, event) in batch.iter().enumerate() {
            self.ensure_not_future(&format!("events[{i}].occurred_at"), event.occurred_at)?;
        }

        let touched: Vec<_> = batch.iter().map(|e| e.occurred_at).collect();
        {
            let mut backend = self.writer.lock();
            {
                let current = self.published.read();
                for (i, event) in batch.iter().enumerate() {
                    let clashes = current.iter().any(|e| e.id == event.id)
                        || batch[..i].iter().any(|e| e.id == event.id);
                    if clashes {
                        return Err(CoreError::validation(
                            format!("events[{i}].id"),
                            format!("duplicate event id {}", event.id),
                        ));
                    }
                }
            }
            with_retry("append_batch", || backend.insert_batch(&batch))?;
            self.notify_changing(&touched);
            self.publish(|events| {
                for event in &batch {
                    binary_insert(events, event.clone());
                }
            });
            on_published();
        }

        self.notify_changed(&touched);
        Ok(())
    }

    // ── Internal ────────────────────────────────────────────────────

    fn ensure_not_future(&self, field: &str, occurred_at: DateTime<Utc>) -> Result<(), CoreError> {
        let now = self.clock.now();
        if occurred_at > now {
            return Err(CoreError::validation(
                field,
                format!("{occurred_at} is in the future (now is {now})"),
            ));
        }
        Ok(())
    }

    /// Copy-on-write: readers holding the previous `Arc` keep their view.
    fn publish(&self, change: impl FnOnce(&mut Vec<Event>)) {
        let mut guard = self.published.write();
        change(Arc::make_mut(&mut guard));
    }

    fn notify_changing(&self, touched: &[DateTime<Utc>]) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.events_changing(touched);
        }
    }

    fn notify_changed(&self, touched: &[DateTime<Utc>]) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.events_changed(touched);
        }
    }
}

/// Slice of a sorted log with `start <= occurred_at < end`. O(log n).
#[must_use]
pub fn events_between(events: &[Event], start: DateTime<Utc>, end: DateTime<Utc>) -> &[Event] {
    let lo = events.partition_point(|e| e.occurred_at < start);
    let hi = events.partition_point(|e| e.occurred_at < end).max(lo);
    &events[lo..hi]
}

/// Insert after any events at the same instant, keeping insertion order stable.
fn binary_insert(events: &mut Vec<Event>, event: Event) {
    let pos = events.partition_point(|e| e.occurred_at <= event.occurred_at);
    events.insert(pos, event);
}

fn remove_by_id(events: &mut Vec<Event>, id: Uuid) {
    if let Some(idx) = events.iter().position(|e| e.id == id) {
        events.remove(idx);
    }
}

fn with_retry<T>(op: &str, mut attempt_op: impl FnMut() -> Result<T, CoreError>) -> Result<T, CoreError> {
    let mut attempt = 1;
    loop {
        match attempt_op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => {
                if attempt >= MAX_WRITE_ATTEMPTS {
                    warn!(op, attempt, "giving up after repeated concurrency conflicts");
                    return Err(CoreError::ConcurrencyConflict { attempts: attempt });
                }
                warn!(op, attempt, "concurrency conflict, retrying");
                attempt += 1;
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(op, "backing store is corrupt: {e}");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn same_instant_keeps_insertion_order() {
        let mut events = Vec::new();
        let first = Event::with_note(at(8), "first");
        let second = Event::with_note(at(8), "second");
        binary_insert(&mut events, Event::new(at(9)));
        binary_insert(&mut events, first.clone());
        binary_insert(&mut events, second.clone());

        assert_eq!(events[0].id, first.id);
        assert_eq!(events[1].id, second.id);
    }

    #[test]
    fn events_between_is_half_open() {
        let events: Vec<_> = [7, 8, 9, 10].into_iter().map(|h| Event::new(at(h))).collect();
        let slice = events_between(&events, at(8), at(10));
        assert_eq!(slice.len(), 2);
        assert!(events_between(&events, at(10), at(8)).is_empty());
    }

    #[test]
    fn retry_gives_up_after_bound() {
        let mut calls = 0;
        let result: Result<(), CoreError> = with_retry("test", || {
            calls += 1;
            Err(CoreError::ConcurrencyConflict { attempts: 1 })
        });
        assert!(matches!(
            result,
            Err(CoreError::ConcurrencyConflict { attempts: MAX_WRITE_ATTEMPTS })
        ));
        assert_eq!(calls, MAX_WRITE_ATTEMPTS);
    }

    #[test]
    fn corrupt_store_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), CoreError> = with_retry("test", || {
            calls += 1;
            Err(CoreError::CorruptStore("bad page".into()))
        });
        assert!(matches!(result, Err(CoreError::CorruptStore(_))));
        assert_eq!(calls, 1);
    }
}
