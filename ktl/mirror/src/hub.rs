//! Mirror Hub (C8): session-scoped publish/subscribe fabric
//! (`spec.md` §4.4, §5 "Mirror bus").
//!
//! Sequence assignment happens under a per-session `tokio::sync::Mutex` so
//! two concurrent publishers for the same session never race; fan-out to
//! subscribers is bounded and non-blocking — a subscriber that falls behind
//! is dropped rather than slowing the publisher down.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use ktl_config::MirrorConfig;
use ktl_protocol::{
    DeployEvent, FramePayload, MirrorFrame, MirrorSession, SessionFilter, SessionId, SessionMeta,
    SessionState,
};
use ktl_store::SessionStore;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::MirrorError;

/// Per-subscriber channel depth (`spec.md` §3 `Subscriber`).
const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<MirrorFrame>,
}

/// Hydration payload handed to a subscriber before live frames start
/// flowing, so a late joiner doesn't have to replay the whole session from
/// scratch (`spec.md` §4.4 C10 "late-subscriber hydration").
#[derive(Debug, Clone, Default)]
pub struct ReplaySnapshot {
    pub summary: Option<String>,
    pub diff: Option<String>,
    pub resources: Option<String>,
    pub health: Option<(bool, String)>,
    pub phases: Vec<(String, bool, String)>,
    pub logs: Vec<String>,
}

struct SessionEntry {
    session: Arc<AsyncMutex<MirrorSession>>,
    replay: Arc<AsyncMutex<ktl_protocol::ReplayState>>,
    subscribers: AsyncMutex<Vec<Subscriber>>,
}

pub struct MirrorHub {
    store: SessionStore,
    config: MirrorConfig,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    next_subscriber_id: AtomicU64,
}

impl MirrorHub {
    pub fn new(store: SessionStore, config: MirrorConfig) -> Self {
        Self {
            store,
            config,
            sessions: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub async fn open_session(
        &self,
        meta: SessionMeta,
        tags: Vec<String>,
    ) -> Result<SessionId, MirrorError> {
        let id = SessionId(uuid::Uuid::new_v4().to_string());
        let session = MirrorSession::new(id.clone(), meta, tags);
        self.store.create_session(&session).await?;
        self.sessions.insert(
            id.clone(),
            Arc::new(SessionEntry {
                session: Arc::new(AsyncMutex::new(session)),
                replay: Arc::new(AsyncMutex::new(ktl_protocol::ReplayState::new(
                    self.config.replay_cache_logs,
                ))),
                subscribers: AsyncMutex::new(Vec::new()),
            }),
        );
        Ok(id)
    }

    /// Publishes one frame, assigning its session-scoped sequence
    /// (`spec.md` §3 `MirrorFrame` invariant: the server always assigns
    /// `sequence`, overwriting whatever the producer sent).
    pub async fn publish(
        &self,
        session_id: &SessionId,
        producer: impl Into<String>,
        payload: FramePayload,
    ) -> Result<u64, MirrorError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| MirrorError::UnknownSession(session_id.0.clone()))?;

        let sequence = {
            let mut session = entry.session.lock().await;
            let sequence = session.assign_sequence();
            self.store.save_session_state(&session).await?;
            sequence
        };

        let frame = MirrorFrame {
            session_id: session_id.clone(),
            producer: producer.into(),
            sequence,
            payload,
        };
        self.store.append_frame(&frame).await?;

        if let FramePayload::DeployEvent(event) = &frame.payload {
            entry.replay.lock().await.apply(event);
        }

        self.fan_out(&entry, &frame).await;
        Ok(sequence)
    }

    async fn fan_out(&self, entry: &SessionEntry, frame: &MirrorFrame) {
        let mut subs = entry.subscribers.lock().await;
        subs.retain(|sub| match sub.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    session_id = %frame.session_id,
                    subscriber_id = sub.id,
                    "subscriber backpressure exceeded; unregistering"
                );
                false
            }
        });
    }

    /// Registers a new subscriber and returns its receiver plus a hydration
    /// snapshot of the session's current replay state.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<(mpsc::Receiver<MirrorFrame>, ReplaySnapshot), MirrorError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| MirrorError::UnknownSession(session_id.0.clone()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        entry.subscribers.lock().await.push(Subscriber { id, tx });

        let snapshot = {
            let replay = entry.replay.lock().await;
            ReplaySnapshot {
                summary: replay.summary.as_ref().map(|s| s.text.clone()),
                diff: replay.diff.as_ref().map(|d| d.text.clone()),
                resources: replay.resources.as_ref().map(|r| r.text.clone()),
                health: replay.health.as_ref().map(|h| (h.healthy, h.detail.clone())),
                phases: replay
                    .ordered_phases()
                    .into_iter()
                    .map(|(name, entry)| (name.to_string(), entry.completed, entry.detail.clone()))
                    .collect(),
                logs: replay.logs.iter().map(|l| l.line.clone()).collect(),
            }
        };

        Ok((rx, snapshot))
    }

    pub async fn close_session(
        &self,
        session_id: &SessionId,
        state: SessionState,
    ) -> Result<(), MirrorError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| MirrorError::UnknownSession(session_id.0.clone()))?;
        let mut session = entry.session.lock().await;
        session.state = state;
        self.store.save_session_state(&session).await?;
        Ok(())
    }

    pub async fn set_session_tags(
        &self,
        session_id: SessionId,
        tags: Vec<String>,
    ) -> Result<(), MirrorError> {
        self.store.set_session_tags(session_id, tags).await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<MirrorSession, MirrorError> {
        Ok(self.store.load_session(session_id).await?)
    }

    pub async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<MirrorSession>, MirrorError> {
        Ok(self.store.list_sessions(filter).await?)
    }

    /// Loads frames strictly after `since_sequence`, the resume path for a
    /// reconnecting SSE client sending `Last-Event-ID` (`spec.md` §4.5).
    pub async fn frames_since(
        &self,
        session_id: SessionId,
        since_sequence: u64,
    ) -> Result<Vec<MirrorFrame>, MirrorError> {
        Ok(self.store.load_frames_since(session_id, since_sequence).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::frame::{DeployLogShape, Heartbeat, SummaryShape};

    async fn hub() -> MirrorHub {
        let store = ktl_store::Store::open_in_memory().unwrap().sessions;
        MirrorHub::new(store, MirrorConfig::default())
    }

    #[tokio::test]
    async fn publish_fans_out_to_live_subscribers() {
        let hub = hub().await;
        let session_id = hub.open_session(SessionMeta::default(), vec![]).await.unwrap();
        let (mut rx, _snapshot) = hub.subscribe(&session_id).await.unwrap();

        hub.publish(
            &session_id,
            "agent",
            FramePayload::Heartbeat(Heartbeat { sent_at_epoch_ms: 1 }),
        )
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.sequence, 1);
    }

    #[tokio::test]
    async fn late_subscriber_hydrates_from_replay_state() {
        let hub = hub().await;
        let session_id = hub.open_session(SessionMeta::default(), vec![]).await.unwrap();

        hub.publish(
            &session_id,
            "agent",
            FramePayload::DeployEvent(DeployEvent::Summary(SummaryShape { text: "ok".into() })),
        )
        .await
        .unwrap();
        hub.publish(
            &session_id,
            "agent",
            FramePayload::DeployEvent(DeployEvent::Log(DeployLogShape { line: "line-1".into() })),
        )
        .await
        .unwrap();

        let (_rx, snapshot) = hub.subscribe(&session_id).await.unwrap();
        assert_eq!(snapshot.summary.as_deref(), Some("ok"));
        assert_eq!(snapshot.logs, vec!["line-1".to_string()]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking_publish() {
        let hub = hub().await;
        let session_id = hub.open_session(SessionMeta::default(), vec![]).await.unwrap();
        let (_rx, _snapshot) = hub.subscribe(&session_id).await.unwrap();

        for i in 0..SUBSCRIBER_CAPACITY as i64 + 10 {
            hub.publish(
                &session_id,
                "agent",
                FramePayload::Heartbeat(Heartbeat { sent_at_epoch_ms: i }),
            )
            .await
            .unwrap();
        }
    }
}
