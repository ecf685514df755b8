use std::collections::HashMap;

use uuid::Uuid;

use crate::errors::CoreError;
use crate::models::event::Event;

/// Persistence boundary for the event log.
///
/// The core is agnostic to the storage technology behind it. Implementations
/// may return `CoreError::ConcurrencyConflict` when they enforce optimistic
/// concurrency (the store retries a bounded number of times) and
/// `CoreError::CorruptStore` when their data cannot be read (never retried).
pub trait EventBackend: Send {
    /// Read every stored event, in any order.
    fn load(&mut self) -> Result<Vec<Event>, CoreError>;

    fn insert(&mut self, event: &Event) -> Result<(), CoreError>;

    /// Overwrite the stored event with the same id.
    fn replace(&mut self, event: &Event) -> Result<(), CoreError>;

    fn remove(&mut self, id: Uuid) -> Result<(), CoreError>;

    /// Insert all events or none of them.
    fn insert_batch(&mut self, events: &[Event]) -> Result<(), CoreError>;
}

/// In-process backend. Suitable for tests and for hosts that persist
/// through snapshots instead of a live store.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    events: HashMap<Uuid, Event>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: events.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventBackend for MemoryBackend {
    fn load(&mut self) -> Result<Vec<Event>, CoreError> {
        Ok(self.events.values().cloned().collect())
    }

    fn insert(&mut self, event: &Event) -> Result<(), CoreError> {
        self.events.insert(event.id, event.clone());
        Ok(())
    }

    fn replace(&mut self, event: &Event) -> Result<(), CoreError> {
        match self.events.get_mut(&event.id) {
            Some(stored) => {
                *stored = event.clone();
                Ok(())
            }
            None => Err(CoreError::event_not_found(event.id)),
        }
    }

    fn remove(&mut self, id: Uuid) -> Result<(), CoreError> {
        self.events
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::event_not_found(id))
    }

    fn insert_batch(&mut self, events: &[Event]) -> Result<(), CoreError> {
        if let Some(dup) = events.iter().find(|e| self.events.contains_key(&e.id)) {
            return Err(CoreError::validation(
                "id",
                format!("event {} already exists", dup.id),
            ));
        }
        for event in events {
            self.events.insert(event.id, event.clone());
        }
        Ok(())
    }
}
