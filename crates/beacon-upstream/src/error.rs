use beacon_queue::QueueError;

/// Errors raised by the agent push/pull side and by the hub.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream responded with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("table {0} is not replicated")]
    UnknownTable(String),

    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("invalid primary key for {table}: expected {expected} values, got {got}")]
    InvalidKey {
        table: String,
        expected: usize,
        got: usize,
    },

    #[error("push is missing the agent name")]
    MissingAgentName,

    #[error("agent {0} not found")]
    UnknownAgent(String),

    #[error("upstream task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
