//! The durable event envelope and kind taxonomy (`spec.md` §3, §4.2).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{NodeErrorDigest, NodeId, RunId};

/// Extensible kind set, in the order they are first introduced by
/// `spec.md` §4.2. Kept as a flat enum (not a trait object) so the event
/// store can store a stable integer discriminant alongside the JSON
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    NodeMeta,
    RunStarted,
    RunCompleted,
    RunConcurrency,
    NodeQueued,
    NodeRunning,
    NodeSucceeded,
    NodeFailed,
    NodeBlocked,
    PhaseStarted,
    PhaseCompleted,
    HookStarted,
    HookSucceeded,
    HookFailed,
    RetryScheduled,
    BudgetWait,
    NodeLog,
    HelmLog,
}

/// Opaque per-event field bag. Kept as a JSON map rather than a typed enum
/// payload: different `EventKind`s carry different shapes, and forcing them
/// all through one Rust enum would make `Fields` impossible to extend
/// without a protocol version bump on every addition.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// The durable, hash-chained record (`spec.md` §3 `RunEvent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonically increasing per-run sequence number, 1-based.
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub run_id: RunId,
    pub node_id: Option<NodeId>,
    pub kind: EventKind,
    pub attempt: u32,
    pub message: String,
    #[serde(default)]
    pub fields: Fields,
    pub error: Option<NodeErrorDigest>,
    /// Digest of the immediately preceding event, or all-zero for `seq ==
    /// 1`. Set by [`crate::event::RunEvent::chained`]; callers should not
    /// hand-construct this field.
    pub prev_digest: String,
    pub digest: String,
    pub crc32: u32,
}

impl RunEvent {
    /// Canonical byte representation hashed into the chain. Must be stable
    /// across process versions for a given logical event, so it is built
    /// from the fields directly rather than `serde_json::to_vec` (whose
    /// map key ordering is not guaranteed to be canonical across serde_json
    /// versions without the `preserve_order` feature).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.seq.to_be_bytes().as_slice());
        buf.extend_from_slice(self.timestamp.to_rfc3339().as_bytes());
        buf.extend_from_slice(self.run_id.as_bytes());
        if let Some(node) = &self.node_id {
            buf.extend_from_slice(node.0.as_bytes());
        }
        buf.extend_from_slice(format!("{:?}", self.kind).as_bytes());
        buf.extend_from_slice(self.attempt.to_be_bytes().as_slice());
        buf.extend_from_slice(self.message.as_bytes());
        for (k, v) in &self.fields {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(v.to_string().as_bytes());
        }
        if let Some(err) = &self.error {
            buf.extend_from_slice(err.class.as_bytes());
            buf.extend_from_slice(err.message.as_bytes());
            buf.extend_from_slice(err.digest.as_bytes());
        }
        buf
    }
}

/// An event before the store assigns `seq` and chains its digest. Built by
/// the Runner Orchestrator (C6), consumed by the Event Store (C1).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub run_id: RunId,
    pub node_id: Option<NodeId>,
    pub kind: EventKind,
    pub attempt: u32,
    pub message: String,
    pub fields: Fields,
    pub error: Option<NodeErrorDigest>,
}

impl NewEvent {
    pub fn new(run_id: RunId, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            node_id: None,
            kind,
            attempt: 0,
            message: message.into(),
            fields: Fields::new(),
            error: None,
        }
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: NodeErrorDigest) -> Self {
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_differ_on_message_change() {
        let base = RunEvent {
            seq: 1,
            timestamp: chrono::Utc::now(),
            run_id: RunId("r1".into()),
            node_id: None,
            kind: EventKind::RunStarted,
            attempt: 0,
            message: "starting".into(),
            fields: Fields::new(),
            error: None,
            prev_digest: String::new(),
            digest: String::new(),
            crc32: 0,
        };
        let mut other = base.clone();
        other.message = "starting!".into();
        assert_ne!(base.canonical_bytes(), other.canonical_bytes());
    }
}
