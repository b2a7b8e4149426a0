//! Shared domain and wire types for the `ktl` stack runner and mirror bus.
//!
//! Types that cross a process boundary (persisted to the event store, sent
//! over the RPC transport, or rendered to SSE JSON) live here so there is a
//! single definition instead of one per consumer.

pub mod domain;
pub mod error;
pub mod event;
pub mod external;
pub mod frame;
pub mod session;

pub use domain::{
    FailMode, LockLease, NodeId, NodeStatus, ParallelismGroup, Run, RunCommand, RunId, RunNode,
    RunNodeSummary, RunSummary, RunTotals, WorkloadKind,
};
pub use error::{ErrorKind, KtlError, NodeError};
pub use event::{EventKind, Fields, NewEvent, RunEvent};
pub use external::{
    DefaultErrorClassifier, ErrorClassifier, MirrorPublishError, MirrorPublisher, NodeExecutor,
    NodeExecutorError, RunEventObserver,
};
pub use frame::{FramePayload, MirrorFrame, SessionId};
pub use session::{MirrorSession, ReplayState, SessionFilter, SessionMeta, SessionState};
