//! Mirror session metadata and the replay-state cache shape
//! (`spec.md` §3 `MirrorSession`/`ReplayState`, §4.4).

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::frame::{DeployEvent, DiffShape, HealthShape, LogRecord, ResourcesShape, SummaryShape};
use crate::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Done,
    Error,
}

/// Immutable descriptive metadata set at session creation
/// (`spec.md` §3 `MirrorSession.Meta`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub command: Option<String>,
    pub requester: Option<String>,
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub release: Option<String>,
    pub chart: Option<String>,
    pub kube_context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSession {
    pub id: SessionId,
    pub meta: SessionMeta,
    pub tags: Vec<String>,
    pub state: SessionState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub frame_count: u64,
    /// Sequence to assign to the *next* published frame; starts at 1.
    pub next_sequence: u64,
}

impl MirrorSession {
    pub fn new(id: SessionId, meta: SessionMeta, tags: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            meta,
            tags,
            state: SessionState::Running,
            created_at: now,
            last_seen_at: now,
            frame_count: 0,
            next_sequence: 1,
        }
    }

    /// Assigns the next sequence and bumps bookkeeping. Must only be called
    /// while the caller holds the session-scoped lock (`spec.md` §5
    /// "assigned by the hub under a session-scoped lock").
    pub fn assign_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        self.frame_count += 1;
        self.last_seen_at = chrono::Utc::now();
        seq
    }
}

/// Filter accepted by `ListSessions` (`spec.md` §4.4).
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub command: Option<String>,
    pub requester: Option<String>,
    pub cluster: Option<String>,
    pub kube_context: Option<String>,
    pub namespace: Option<String>,
    pub release: Option<String>,
    pub chart: Option<String>,
    pub state: Option<SessionState>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn matches(&self, session: &MirrorSession) -> bool {
        let meta = &session.meta;
        self.command
            .as_ref()
            .is_none_or(|v| meta.command.as_deref() == Some(v.as_str()))
            && self
                .requester
                .as_ref()
                .is_none_or(|v| meta.requester.as_deref() == Some(v.as_str()))
            && self
                .cluster
                .as_ref()
                .is_none_or(|v| meta.cluster.as_deref() == Some(v.as_str()))
            && self
                .kube_context
                .as_ref()
                .is_none_or(|v| meta.kube_context.as_deref() == Some(v.as_str()))
            && self
                .namespace
                .as_ref()
                .is_none_or(|v| meta.namespace.as_deref() == Some(v.as_str()))
            && self
                .release
                .as_ref()
                .is_none_or(|v| meta.release.as_deref() == Some(v.as_str()))
            && self
                .chart
                .as_ref()
                .is_none_or(|v| meta.chart.as_deref() == Some(v.as_str()))
            && self.state.is_none_or(|s| s == session.state)
            && self.since.is_none_or(|t| session.last_seen_at >= t)
            && self.until.is_none_or(|t| session.last_seen_at <= t)
            && self.tags.iter().all(|t| session.tags.contains(t))
    }
}

const DEFAULT_LOG_RING_CAPACITY: usize = 300;

/// Per-session "latest of kind" snapshot enabling immediate UI hydration
/// for late subscribers (`spec.md` §3 `ReplayState`, §4.4 C10).
#[derive(Debug, Clone)]
pub struct ReplayState {
    pub summary: Option<SummaryShape>,
    pub diff: Option<DiffShape>,
    pub resources: Option<ResourcesShape>,
    pub health: Option<HealthShape>,
    /// Keyed by case-insensitive phase name.
    pub phases: BTreeMap<String, PhaseEntry>,
    pub logs: VecDeque<LogRecord>,
    log_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct PhaseEntry {
    pub completed: bool,
    pub detail: String,
}

impl ReplayState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            summary: None,
            diff: None,
            resources: None,
            health: None,
            phases: BTreeMap::new(),
            logs: VecDeque::with_capacity(log_capacity.min(4096)),
            log_capacity: log_capacity.max(1),
        }
    }

    /// Applies a deploy-shaped event; last-writer-wins for single slots,
    /// FIFO-bounded for logs.
    pub fn apply(&mut self, event: &DeployEvent) {
        match event {
            DeployEvent::Summary(s) => self.summary = Some(s.clone()),
            DeployEvent::Diff(d) => self.diff = Some(d.clone()),
            DeployEvent::Resources(r) => self.resources = Some(r.clone()),
            DeployEvent::Health(h) => self.health = Some(h.clone()),
            DeployEvent::Phase(p) => {
                self.phases.insert(
                    p.name.to_ascii_lowercase(),
                    PhaseEntry {
                        completed: p.completed,
                        detail: p.detail.clone(),
                    },
                );
            }
            DeployEvent::Log(l) => {
                if self.logs.len() >= self.log_capacity {
                    self.logs.pop_front();
                }
                self.logs.push_back(LogRecord {
                    line: l.line.clone(),
                    stream: crate::frame::LogStream::Stdout,
                });
            }
        }
    }

    /// Phases in canonical order, then any remaining phases sorted
    /// alphabetically (`spec.md` §4.4).
    pub fn ordered_phases(&self) -> Vec<(&str, &PhaseEntry)> {
        let mut ordered = Vec::with_capacity(self.phases.len());
        let mut remaining: Vec<&str> = self.phases.keys().map(String::as_str).collect();

        for canonical in crate::frame::CANONICAL_PHASE_ORDER {
            if let Some(entry) = self.phases.get(*canonical) {
                ordered.push((*canonical, entry));
                remaining.retain(|name| name != canonical);
            }
        }
        remaining.sort_unstable();
        for name in remaining {
            ordered.push((name, &self.phases[name]));
        }
        ordered
    }
}

impl Default for ReplayState {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PhaseShape;

    #[test]
    fn phases_replay_in_canonical_then_alphabetical_order() {
        let mut state = ReplayState::new(10);
        for name in ["wait", "custom-b", "render", "custom-a", "upgrade"] {
            state.apply(&DeployEvent::Phase(PhaseShape {
                name: name.to_string(),
                completed: true,
                detail: String::new(),
            }));
        }
        let order: Vec<&str> = state.ordered_phases().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["render", "upgrade", "wait", "custom-a", "custom-b"]);
    }

    #[test]
    fn log_ring_evicts_oldest_first() {
        let mut state = ReplayState::new(2);
        for i in 0..3 {
            state.apply(&DeployEvent::Log(crate::frame::DeployLogShape {
                line: format!("line-{i}"),
            }));
        }
        let lines: Vec<&str> = state.logs.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["line-1", "line-2"]);
    }

    #[test]
    fn session_filter_matches_on_all_set_fields() {
        let session = MirrorSession::new(
            SessionId("s1".into()),
            SessionMeta {
                namespace: Some("payments".into()),
                ..Default::default()
            },
            vec!["ci".into()],
        );
        let mut filter = SessionFilter {
            namespace: Some("payments".into()),
            ..Default::default()
        };
        assert!(filter.matches(&session));
        filter.namespace = Some("other".into());
        assert!(!filter.matches(&session));
    }
}
