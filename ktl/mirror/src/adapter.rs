//! Deploy Event Adapter (C11): normalizes the Stack Runner's `RunEvent`
//! stream into Mirror Bus frames for one session, without the orchestrator
//! ever blocking on a slow or absent subscriber (`spec.md` §4.4 C11).
//!
//! [`ktl_protocol::RunEventObserver::observe`] must not block, so this
//! adapter only pushes onto an internal channel; a background task drains
//! it and does the actual (async) `hub.publish` call.

use std::sync::Arc;

use ktl_protocol::{
    event::{EventKind, RunEvent},
    frame::{DeployEvent, DeployLogShape, HealthShape, PhaseShape, SummaryShape},
    FramePayload, RunEventObserver, SessionId,
};
use tokio::sync::mpsc;

use crate::hub::MirrorHub;

const ADAPTER_QUEUE_CAPACITY: usize = 1024;
const ADAPTER_PRODUCER: &str = "runner";

/// Bridges one run's event stream into one mirror session.
pub struct DeployEventAdapter {
    tx: mpsc::Sender<RunEvent>,
}

impl DeployEventAdapter {
    /// Spawns the drain task and returns the adapter. `hub`/`session_id`
    /// identify where normalized frames land; the caller is responsible for
    /// opening the session beforehand and registering this adapter with the
    /// [`ktl_scheduler::StackRunner`] that will drive the run.
    pub fn new(hub: Arc<MirrorHub>, session_id: SessionId) -> Self {
        let (tx, mut rx) = mpsc::channel::<RunEvent>(ADAPTER_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(payload) = normalize(&event) {
                    if let Err(err) = hub
                        .publish(&session_id, ADAPTER_PRODUCER, FramePayload::DeployEvent(payload))
                        .await
                    {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %err,
                            "failed to mirror run event"
                        );
                    }
                }
            }
        });

        Self { tx }
    }
}

impl RunEventObserver for DeployEventAdapter {
    fn observe(&self, event: &RunEvent) {
        if let Err(err) = self.tx.try_send(event.clone()) {
            tracing::warn!(
                seq = event.seq,
                kind = ?event.kind,
                error = %err,
                "dropping run event: mirror adapter queue full or closed"
            );
        }
    }
}

/// Maps one [`RunEvent`] to the deploy-shaped payload it should be mirrored
/// as, or `None` for events with no UI-facing replay shape (`NodeMeta`,
/// `NodeQueued`).
fn normalize(event: &RunEvent) -> Option<DeployEvent> {
    let node_label = event
        .node_id
        .as_ref()
        .map(|id| id.0.as_str())
        .unwrap_or("run");

    match event.kind {
        EventKind::NodeMeta | EventKind::NodeQueued => None,

        EventKind::RunStarted => Some(DeployEvent::Summary(SummaryShape {
            text: event.message.clone(),
        })),

        EventKind::RunCompleted => Some(DeployEvent::Summary(SummaryShape {
            text: event.message.clone(),
        })),

        EventKind::PhaseStarted => Some(DeployEvent::Phase(PhaseShape {
            name: event.message.clone(),
            completed: false,
            detail: format!("{node_label}: started"),
        })),
        EventKind::PhaseCompleted => Some(DeployEvent::Phase(PhaseShape {
            name: event.message.clone(),
            completed: true,
            detail: format!("{node_label}: completed"),
        })),

        EventKind::NodeSucceeded => Some(DeployEvent::Health(HealthShape {
            healthy: true,
            detail: format!("{node_label}: {}", event.message),
        })),
        EventKind::NodeFailed => Some(DeployEvent::Health(HealthShape {
            healthy: false,
            detail: format!("{node_label}: {}", event.message),
        })),
        EventKind::NodeBlocked => Some(DeployEvent::Log(DeployLogShape {
            line: format!("{node_label}: blocked — {}", event.message),
        })),

        EventKind::NodeRunning => Some(DeployEvent::Log(DeployLogShape {
            line: format!("{node_label}: running (attempt {})", event.attempt),
        })),
        EventKind::RetryScheduled => Some(DeployEvent::Log(DeployLogShape {
            line: format!("{node_label}: retry scheduled — {}", event.message),
        })),
        EventKind::BudgetWait => Some(DeployEvent::Log(DeployLogShape {
            line: format!("{node_label}: waiting on budget"),
        })),
        EventKind::RunConcurrency => Some(DeployEvent::Log(DeployLogShape {
            line: format!("concurrency changed — {}", event.message),
        })),
        EventKind::HookStarted | EventKind::HookSucceeded | EventKind::HookFailed => {
            Some(DeployEvent::Log(DeployLogShape {
                line: format!("{node_label}: {}", event.message),
            }))
        }
        EventKind::NodeLog | EventKind::HelmLog => Some(DeployEvent::Log(DeployLogShape {
            line: event.message.clone(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::domain::RunId;
    use ktl_protocol::event::Fields;

    fn sample(kind: EventKind, message: &str) -> RunEvent {
        RunEvent {
            seq: 1,
            timestamp: chrono::Utc::now(),
            run_id: RunId("r1".into()),
            node_id: None,
            kind,
            attempt: 1,
            message: message.to_string(),
            fields: Fields::new(),
            error: None,
            prev_digest: String::new(),
            digest: String::new(),
            crc32: 0,
        }
    }

    #[test]
    fn node_meta_has_no_replay_shape() {
        assert!(normalize(&sample(EventKind::NodeMeta, "")).is_none());
    }

    #[test]
    fn run_completed_maps_to_summary() {
        let payload = normalize(&sample(EventKind::RunCompleted, "3/3 succeeded")).unwrap();
        assert!(matches!(payload, DeployEvent::Summary(s) if s.text == "3/3 succeeded"));
    }

    #[test]
    fn node_failed_maps_to_unhealthy() {
        let payload = normalize(&sample(EventKind::NodeFailed, "timeout")).unwrap();
        assert!(matches!(payload, DeployEvent::Health(h) if !h.healthy));
    }
}
