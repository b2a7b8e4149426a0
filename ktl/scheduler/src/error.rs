use ktl_protocol::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("stack lock held by {owner} until {expires_at}")]
    LockHeld {
        owner: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("run was cancelled")]
    Cancelled,

    #[error("node {node} failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error(transparent)]
    Store(#[from] ktl_store::StoreError),

    #[error(transparent)]
    Config(#[from] ktl_config::ConfigError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Self::LockHeld { .. } => ErrorKind::LockHeld,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NodeFailed { .. } => ErrorKind::NodePermanent,
            Self::Store(ktl_store::StoreError::LockHeld { .. }) => ErrorKind::LockHeld,
            Self::Store(ktl_store::StoreError::IntegrityViolation { .. }) => {
                ErrorKind::IntegrityViolation
            }
            Self::Store(_) => ErrorKind::NodePermanent,
            Self::Config(_) => ErrorKind::InvalidPlan,
        }
    }
}
