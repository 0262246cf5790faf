use crate::responder::ResponderError;
use crate::transport::TransportError;
use beacon_queue::QueueError;
use beacon_types::PayloadError;

/// Errors raised while matching, fanning out or delivering notifications.
///
/// Any of these on a queued event is stored as that event's error text.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid event payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("person {0} has no delivery address")]
    NoAddress(String),

    #[error("unrecognized event name: {0}")]
    UnknownEvent(String),

    #[error("error templating notification: {0}")]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("responder client error: {0}")]
    Responder(#[from] ResponderError),

    #[error("notification task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl NotifyError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}
