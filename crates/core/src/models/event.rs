use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single logged occurrence of the tracked habit.
///
/// Events do NOT store a price. The cost of an event is resolved at read
/// time from the price timeline, using `occurred_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier (immutable)
    pub id: Uuid,

    /// When the occurrence happened (UTC instant)
    pub occurred_at: DateTime<Utc>,

    /// Optional free-text note
    #[serde(default)]
    pub note: Option<String>,
}

impl Event {
    pub fn new(occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at,
            note: None,
        }
    }

    /// Create an event with a note attached.
    pub fn with_note(occurred_at: DateTime<Utc>, note: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at,
            note: Some(note.into()),
        }
    }
}

/// Changes to apply to an existing event. `None` leaves a field untouched;
/// `note: Some(None)` clears the note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub occurred_at: Option<DateTime<Utc>>,
    pub note: Option<Option<String>>,
}

impl EventPatch {
    pub fn occurred_at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            occurred_at: Some(occurred_at),
            note: None,
        }
    }

    pub fn note(note: Option<String>) -> Self {
        Self {
            occurred_at: None,
            note: Some(note),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occurred_at.is_none() && self.note.is_none()
    }

    /// Apply the patch on top of `event`, keeping its identity.
    pub fn apply_to(&self, event: &Event) -> Event {
        Event {
            id: event.id,
            occurred_at: self.occurred_at.unwrap_or(event.occurred_at),
            note: match &self.note {
                Some(note) => note.clone(),
                None => event.note.clone(),
            },
        }
    }
}
