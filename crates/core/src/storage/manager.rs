use tracing::error;

use crate::errors::CoreError;
use crate::models::ledger::Ledger;

use super::format;

/// High-level snapshot operations: save/load a ledger to/from bytes or files.
pub struct SnapshotManager;

impl SnapshotManager {
    /// Serialize a ledger to snapshot bytes.
    ///
    /// Flow: Ledger → bincode → HBLG framing
    pub fn save_to_bytes(ledger: &Ledger) -> Result<Vec<u8>, CoreError> {
        let payload = bincode::serialize(ledger)
            .map_err(|e| CoreError::Serialization(format!("Failed to serialize ledger: {e}")))?;
        Ok(format::write_file(format::CURRENT_VERSION, &payload))
    }

    /// Parse snapshot bytes back into a ledger.
    ///
    /// Anything unreadable is reported as `CoreError::CorruptStore`, except a
    /// snapshot from a newer format, which keeps `UnsupportedVersion`.
    pub fn load_from_bytes(data: &[u8]) -> Result<Ledger, CoreError> {
        let (_header, payload) = format::read_file(data).map_err(|e| match e {
            CoreError::UnsupportedVersion(v) => CoreError::UnsupportedVersion(v),
            other => {
                error!("snapshot framing is unreadable: {other}");
                CoreError::CorruptStore(other.to_string())
            }
        })?;

        bincode::deserialize(payload).map_err(|e| {
            error!("snapshot payload is unreadable: {e}");
            CoreError::CorruptStore(format!("Failed to deserialize ledger: {e}"))
        })
    }

    /// Save a snapshot to a file on disk (native only).
    #[cfg(not(target_arch = "wasm32"))]
    pub fn save_to_file(ledger: &Ledger, path: &str) -> Result<(), CoreError> {
        let bytes = Self::save_to_bytes(ledger)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a snapshot from a file on disk (native only).
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_from_file(path: &str) -> Result<Ledger, CoreError> {
        let bytes = std::fs::read(path)?;
        Self::load_from_bytes(&bytes)
    }
}
