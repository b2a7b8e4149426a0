//! Core entities: [`Run`], [`RunNode`], and the lock lease.
//!
//! See `spec.md` §3 for the canonical field list and invariants.

use std::{collections::BTreeMap, fmt, ops::Deref, time::Duration};

use serde::{Deserialize, Serialize};

/// Timestamp-derived run identifier, e.g. `20260415-142233-918421`.
///
/// Sub-second precision so two reruns started in quick succession never
/// collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Builds a run id from a UTC timestamp with microsecond precision.
    pub fn from_timestamp(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self(now.format("%Y%m%d-%H%M%S-%6f").to_string())
    }
}

impl Deref for RunId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a release within a run: `cluster/namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(cluster: &str, namespace: &str, name: &str) -> Self {
        Self(format!("{cluster}/{namespace}/{name}"))
    }

    /// Splits back into `(cluster, namespace, name)`. Panics if the id was
    /// not constructed with [`NodeId::new`] — callers that accept raw plan
    /// input should validate with [`NodeId::parts`] returning `Option`
    /// instead (see `ktl_scheduler::plan`).
    pub fn parts(&self) -> Option<(&str, &str, &str)> {
        let mut split = self.0.splitn(3, '/');
        let cluster = split.next()?;
        let namespace = split.next()?;
        let name = split.next()?;
        Some((cluster, namespace, name))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCommand {
    Apply,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailMode {
    FailFast,
    Continue,
}

/// Label used to cap co-running nodes that share it (`spec.md` glossary).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParallelismGroup(pub String);

/// Coarse workload kind inferred from the release's primary resource, used
/// to key `maxConcurrencyByKind`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKind(pub String);

/// Node FSM states (`spec.md` §4.1). `Retrying` is a pseudo-state: it is
/// recorded in the event log but the scheduler treats it as `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Planned,
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Blocked,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked)
    }
}

/// A single release within a [`Run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNode {
    pub id: NodeId,
    /// Other node ids this node depends on. For `apply` these are
    /// predecessors; for `delete` the scheduler reverses the edges.
    pub needs: Vec<NodeId>,
    pub parallelism_group: Option<ParallelismGroup>,
    pub primary_kind: Option<WorkloadKind>,
    pub critical: bool,
    pub attempt: u32,
    /// Hash of the rendered manifest/values used for this attempt, used by
    /// the resume path to detect drift (not re-validated by the core; the
    /// `NodeExecutor` collaborator decides what to do with a changed hash).
    pub input_hash: String,
    pub status: NodeStatus,
    /// `(executionGroup, parallelismGroup, id)` tie-break key, computed once
    /// at plan time from the critical-path length (§4.1 "Graph semantics").
    pub execution_group: u32,
}

impl RunNode {
    pub fn tie_break_key(&self) -> (u32, Option<&str>, &str) {
        (
            self.execution_group,
            self.parallelism_group.as_ref().map(|g| g.0.as_str()),
            self.id.0.as_str(),
        )
    }
}

/// The atomic unit scheduled by the Runner Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub command: RunCommand,
    pub stack_root: String,
    pub profile: Option<String>,
    pub concurrency: usize,
    pub fail_mode: FailMode,
    /// Free-form selector the caller used to build the plan (e.g. a glob
    /// over release names); opaque to the scheduler, carried for display.
    pub selector: Option<String>,
}

/// Totals carried in a [`crate::event::RunEvent::RunCompleted`]-adjacent
/// summary snapshot (`spec.md` §4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub running: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNodeSummary {
    pub status: NodeStatus,
    pub attempt: u32,
    pub error: Option<NodeErrorDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorDigest {
    pub class: String,
    pub message: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub totals: RunTotals,
    pub nodes: BTreeMap<NodeId, RunNodeSummary>,
}

/// Stack-scoped exclusive lease (`spec.md` §3, §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub owner: String,
    pub run_id: RunId,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub ttl: Duration,
}

impl LockLease {
    pub fn expires_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.acquired_at
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }

    pub fn is_live(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.expires_at() > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_parts() {
        let id = NodeId::new("prod", "payments", "api");
        assert_eq!(id.parts(), Some(("prod", "payments", "api")));
        assert_eq!(id.to_string(), "prod/payments/api");
    }

    #[test]
    fn lease_liveness_respects_ttl() {
        let now = chrono::Utc::now();
        let lease = LockLease {
            owner: "alice".into(),
            run_id: RunId("r1".into()),
            acquired_at: now - chrono::Duration::seconds(30),
            ttl: Duration::from_secs(60),
        };
        assert!(lease.is_live(now));
        assert!(!lease.is_live(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn node_status_terminal_set() {
        assert!(NodeStatus::Succeeded.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Blocked.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(!NodeStatus::Retrying.is_terminal());
    }
}
