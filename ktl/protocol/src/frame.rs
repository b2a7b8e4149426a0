//! Mirror bus frame types (`spec.md` §3 `MirrorFrame`, §4.2 "deploy-shaped"
//! payloads referenced by the replay cache).

use std::{fmt, ops::Deref};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Session identifier. Producer-chosen; the hub does not validate shape
/// beyond non-empty.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct SessionId(pub String);

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of streamed progress. The server always assigns `sequence`;
/// producers sending a frame with a pre-set sequence must accept it being
/// overwritten on the ack (`spec.md` §3 `MirrorFrame` invariant).
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct MirrorFrame {
    pub session_id: SessionId,
    pub producer: String,
    pub sequence: u64,
    pub payload: FramePayload,
}

/// Tagged variant over the four payload shapes the mirror bus carries.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FramePayload {
    LogRecord(LogRecord),
    DeployEvent(DeployEvent),
    BuildProgress(BuildProgress),
    Heartbeat(Heartbeat),
}

impl FramePayload {
    /// Label used for `tracing` fields and dropped-frame diagnostics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::LogRecord(_) => "log_record",
            Self::DeployEvent(_) => "deploy_event",
            Self::BuildProgress(_) => "build_progress",
            Self::Heartbeat(_) => "heartbeat",
        }
    }

    /// Whether this payload is "deploy-shaped" and should be intercepted by
    /// the replay state cache (`spec.md` §4.4 C10/C11).
    pub fn is_deploy_shaped(&self) -> bool {
        matches!(self, Self::DeployEvent(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct LogRecord {
    pub line: String,
    pub stream: LogStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A deploy phase/summary/resource/health/log event, normalized from the
/// scheduler's `RunEvent` stream by the Deploy Event Adapter (C11).
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum DeployEvent {
    Summary(SummaryShape),
    Diff(DiffShape),
    Resources(ResourcesShape),
    Health(HealthShape),
    Phase(PhaseShape),
    Log(DeployLogShape),
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct SummaryShape {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct DiffShape {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct ResourcesShape {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct HealthShape {
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct PhaseShape {
    pub name: String,
    pub completed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct DeployLogShape {
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct BuildProgress {
    pub step: String,
    pub percent: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Heartbeat {
    pub sent_at_epoch_ms: i64,
}

/// Canonical phase ordering used when replaying `phases[name]` entries
/// (`spec.md` §4.4).
pub const CANONICAL_PHASE_ORDER: &[&str] =
    &["render", "diff", "upgrade", "install", "wait", "post-hooks"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_payload_is_deploy_shaped() {
        let payload = FramePayload::DeployEvent(DeployEvent::Summary(SummaryShape {
            text: "ok".into(),
        }));
        assert!(payload.is_deploy_shaped());
        assert_eq!(payload.kind_label(), "deploy_event");
    }

    #[test]
    fn log_payload_is_not_deploy_shaped() {
        let payload = FramePayload::LogRecord(LogRecord {
            line: "hi".into(),
            stream: LogStream::Stdout,
        });
        assert!(!payload.is_deploy_shaped());
    }
}
