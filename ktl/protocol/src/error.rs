//! Error taxonomy shared across `ktl` crates (`spec.md` §7).
//!
//! `ErrorKind` is the coarse bucket used for retry/propagation decisions.
//! Each crate wraps it in its own `thiserror` type rather than returning
//! `ErrorKind` directly, the way the teacher layers `AgentError` over
//! narrower leaf errors.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancelled,
    InvalidPlan,
    LockHeld,
    NodeTransient,
    NodePermanent,
    BudgetExhausted,
    IntegrityViolation,
    MirrorBackpressure,
}

impl ErrorKind {
    /// Only transient and timeout classes are retryable (`spec.md` §4.1
    /// "Retry policy"). `NodeTransient` is the only retryable leaf kind;
    /// callers that need "is this a timeout vs a 5xx" distinction further
    /// subdivide within `ErrorClassifier`.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NodeTransient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::InvalidPlan => "invalid_plan",
            Self::LockHeld => "lock_held",
            Self::NodeTransient => "node_transient",
            Self::NodePermanent => "node_permanent",
            Self::BudgetExhausted => "budget_exhausted",
            Self::IntegrityViolation => "integrity_violation",
            Self::MirrorBackpressure => "mirror_backpressure",
        }
    }
}

/// A node's error, classified and digested for deduplication
/// (`spec.md` §7 "Digest is a stable short hash of `class||message`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub class: String,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            class: class.into(),
            message: message.into(),
        }
    }

    /// Stable short hash of `class||message`, hex-encoded, truncated to 16
    /// characters — enough to dedupe failure rows without bloating the
    /// event log.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.class.as_bytes());
        hasher.update(b"||");
        hasher.update(self.message.as_bytes());
        let out = hasher.finalize();
        hex_prefix(&out, 16)
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for byte in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{byte:02x}"));
    }
    s.truncate(chars);
    s
}

/// Top-level error type returned by `StackRunner::run` and friends.
#[derive(Debug, Error)]
pub enum KtlError {
    #[error("run was cancelled")]
    Cancelled,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("stack lock held by {owner} until {expires_at}")]
    LockHeld {
        owner: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("node {node} failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("event log integrity violation in run {run_id} at seq {seq}: {detail}")]
    IntegrityViolation {
        run_id: String,
        seq: u64,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_distinguishes_messages() {
        let a = NodeError::new(ErrorKind::NodeTransient, "timeout", "dial tcp: i/o timeout");
        let b = NodeError::new(ErrorKind::NodeTransient, "timeout", "dial tcp: i/o timeout");
        let c = NodeError::new(ErrorKind::NodeTransient, "timeout", "connection refused");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 16);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::NodeTransient.is_retryable());
        assert!(!ErrorKind::NodePermanent.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::LockHeld.is_retryable());
    }
}
