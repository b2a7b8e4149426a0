use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error(
        "event log integrity violation in run {run_id} at seq {seq}: expected digest {expected}, got {actual}"
    )]
    IntegrityViolation {
        run_id: String,
        seq: u64,
        expected: String,
        actual: String,
    },

    #[error("non-monotonic sequence for run {run_id}: expected {expected}, got {actual}")]
    NonMonotoneSequence {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("stack lock held by {owner} until {expires_at}")]
    LockHeld {
        owner: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("background writer task panicked: {0}")]
    WriterPanicked(String),
}
