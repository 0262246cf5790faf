//! Error types for the queue store and consumers.

use uuid::Uuid;

/// Errors that can occur while enqueuing, claiming or settling events.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A database operation failed.
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No connection could be taken from the pool.
    #[error("queue pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Event properties could not be encoded or decoded.
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored event id is not a valid UUID.
    #[error("invalid event id: {0}")]
    InvalidId(#[from] uuid::Error),

    /// The event is not (or no longer) claimed by the caller. Either it was
    /// already settled or its lease expired and another worker took it.
    #[error("event {0} is not held by this worker")]
    NotHeld(Uuid),

    /// A blocking database task panicked or was cancelled.
    #[error("queue task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
