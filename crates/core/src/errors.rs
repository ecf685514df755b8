use thiserror::Error;

/// Unified error type for the entire habit-ledger-core library.
/// Every fallible public function returns `Result<T, CoreError>`.
///
/// Aggregation queries are total over valid ranges and never produce an
/// error for missing data; a missing price is a flag on the result.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Validation / Lookup ─────────────────────────────────────────
    #[error("Validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // ── Write path ──────────────────────────────────────────────────
    #[error("Concurrent modification conflict (gave up after {attempts} attempts)")]
    ConcurrencyConflict { attempts: u32 },

    #[error("Backing store is unreadable or corrupt: {0}; restore from an export")]
    CorruptStore(String),

    #[error("Aggregation was cancelled")]
    Cancelled,

    // ── Storage / Export ────────────────────────────────────────────
    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(u16),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("File I/O error: {0}")]
    FileIO(String),
}

impl CoreError {
    /// Shorthand for a field-level validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn event_not_found(id: impl ToString) -> Self {
        CoreError::NotFound {
            kind: "Event",
            id: id.to_string(),
        }
    }

    pub fn price_config_not_found(id: impl ToString) -> Self {
        CoreError::NotFound {
            kind: "Price config",
            id: id.to_string(),
        }
    }

    /// Only optimistic-concurrency conflicts are worth retrying.
    /// A corrupt store needs user action and is never retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoreError::ConcurrencyConflict { .. })
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::CorruptStore(_))
    }
}

// ── Conversion helpers (From impls) ─────────────────────────────────

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::FileIO(e.to_string())
    }
}

impl From<bincode::Error> for CoreError {
    fn from(e: bincode::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Deserialization(e.to_string())
    }
}
