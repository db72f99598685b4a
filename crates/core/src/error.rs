use serde::{Deserialize, Serialize};

/// Errors surfaced by the sync engine. Cloneable so they can sit in status
/// channels, serializable so they can cross the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    /// Watch connection failed or was closed by the server mid-stream.
    #[error("connection: {0}")]
    Connection(String),
    /// The cursor is too old for the server to resume from (HTTP 410).
    #[error("expired: {0}")]
    Expired(String),
    /// Initial list/get failed; no watch was opened.
    #[error("snapshot: {0}")]
    Snapshot(String),
    /// A received event could not be applied to the cache.
    #[error("apply: {0}")]
    Apply(String),
    #[error("overflow: event queue exceeded {capacity} entries")]
    Overflow { capacity: usize },
    #[error("validation: {0}")]
    Validation(String),
}

impl SyncError {
    /// Errors after which resuming requires a fresh snapshot.
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Expired(_) | SyncError::Overflow { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
