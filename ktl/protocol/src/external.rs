//! External-collaborator trait boundaries (`spec.md` §6).
//!
//! Implementations of these traits (Helm/kube-apply executors, mirror
//! publishers backed by a real transport) are out of scope for this
//! workspace; only the contracts live here.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{NodeId, RunCommand};
use crate::event::RunEvent;
use crate::frame::MirrorFrame;

/// Sink for persisted events. Implementations **must not block**: they
/// should copy the event into their own queue and return immediately
/// (`spec.md` §9 "Interface values hiding concurrency contracts"). The core
/// does not schedule or retry observer work.
pub trait RunEventObserver: Send + Sync {
    fn observe(&self, event: &RunEvent);
}

/// Runs the actual deploy/delete for one node. Implementations are external
/// collaborators (Helm, kube-apply, a custom script runner); they must be
/// cancellation-aware and return an error classifiable by
/// [`crate::error::ErrorKind`].
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: CancellationToken,
        node: &NodeId,
        command: RunCommand,
    ) -> Result<(), NodeExecutorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NodeExecutorError {
    #[error("node execution cancelled")]
    Cancelled,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl NodeExecutorError {
    pub fn kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Transient(_) | Self::Timeout(_) | Self::Conflict(_) => ErrorKind::NodeTransient,
            Self::Permanent(_) => ErrorKind::NodePermanent,
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::Conflict(_) => "conflict",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Pluggable classifier for executors that surface raw errors instead of
/// [`NodeExecutorError`]'s pre-classified variants. Externalizing this was
/// an explicit open question in `spec.md` §9; the default implementation
/// below is conservative (unknown errors are permanent, never silently
/// retried).
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &NodeExecutorError) -> crate::error::ErrorKind;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, error: &NodeExecutorError) -> crate::error::ErrorKind {
        error.kind()
    }
}

/// Producer-side handle returned by `OpenSession` (`spec.md` §6). Producers
/// publish frames and accept that the server may reassign their sequence.
#[async_trait]
pub trait MirrorPublisher: Send + Sync {
    async fn publish(&self, frame: MirrorFrame) -> Result<u64, MirrorPublishError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorPublishError {
    #[error("mirror session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classifier_matches_precomputed_kind() {
        let classifier = DefaultErrorClassifier;
        let err = NodeExecutorError::Timeout("deadline exceeded".into());
        assert_eq!(classifier.classify(&err), err.kind());
    }
}
