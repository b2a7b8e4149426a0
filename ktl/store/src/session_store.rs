use ktl_protocol::{MirrorFrame, MirrorSession, SessionFilter, SessionId, SessionMeta, SessionState};
use rusqlite::{params, OptionalExtension};

use crate::{error::StoreError, writer::Writer};

/// Mirror bus session/frame persistence (`spec.md` §3 `MirrorSession`,
/// §4.4 C7/C8). Sequence assignment itself happens in-memory on
/// [`MirrorSession::assign_sequence`] under the hub's session lock; this
/// store only durably records the result, so late subscribers and restarts
/// can replay from it.
#[derive(Clone)]
pub struct SessionStore {
    writer: Writer,
}

impl SessionStore {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }

    pub async fn create_session(&self, session: &MirrorSession) -> Result<(), StoreError> {
        let session = session.clone();
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO mirror_sessions \
                     (session_id, meta_json, tags_json, state, created_at, last_seen_at, \
                      frame_count, next_sequence) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        session.id.0,
                        serde_json::to_string(&session.meta)?,
                        serde_json::to_string(&session.tags)?,
                        state_label(session.state),
                        session.created_at.to_rfc3339(),
                        session.last_seen_at.to_rfc3339(),
                        session.frame_count as i64,
                        session.next_sequence as i64,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Persists bookkeeping mutated by frame publication or state
    /// transitions: `state`, `last_seen_at`, `frame_count`, `next_sequence`.
    pub async fn save_session_state(&self, session: &MirrorSession) -> Result<(), StoreError> {
        let session = session.clone();
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE mirror_sessions SET state = ?1, last_seen_at = ?2, \
                     frame_count = ?3, next_sequence = ?4 WHERE session_id = ?5",
                    params![
                        state_label(session.state),
                        session.last_seen_at.to_rfc3339(),
                        session.frame_count as i64,
                        session.next_sequence as i64,
                        session.id.0,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_session_tags(
        &self,
        session_id: SessionId,
        tags: Vec<String>,
    ) -> Result<(), StoreError> {
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE mirror_sessions SET tags_json = ?1 WHERE session_id = ?2",
                    params![serde_json::to_string(&tags)?, session_id.0],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn load_session(&self, session_id: SessionId) -> Result<MirrorSession, StoreError> {
        self.writer
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT session_id, meta_json, tags_json, state, created_at, last_seen_at, \
                     frame_count, next_sequence FROM mirror_sessions WHERE session_id = ?1",
                    params![session_id.0],
                    row_to_session,
                )
                .optional()?
                .ok_or_else(|| StoreError::SessionNotFound(session_id.0.clone()))
            })
            .await
    }

    pub async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<MirrorSession>, StoreError> {
        self.writer
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, meta_json, tags_json, state, created_at, last_seen_at, \
                     frame_count, next_sequence FROM mirror_sessions ORDER BY last_seen_at DESC",
                )?;
                let rows = stmt.query_map([], row_to_session)?;
                let mut out = Vec::new();
                for row in rows {
                    let session = row?;
                    if filter.matches(&session) {
                        out.push(session);
                        if filter.limit.is_some_and(|limit| out.len() >= limit) {
                            break;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Persists a frame the hub has already assigned a sequence to.
    pub async fn append_frame(&self, frame: &MirrorFrame) -> Result<(), StoreError> {
        let frame = frame.clone();
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO mirror_frames (session_id, sequence, producer, payload_json) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        frame.session_id.0,
                        frame.sequence as i64,
                        frame.producer,
                        serde_json::to_string(&frame.payload)?,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Loads frames strictly after `since_sequence`, ordered ascending —
    /// the replay path for `Last-Event-ID` resume (`spec.md` §4.5 SSE).
    pub async fn load_frames_since(
        &self,
        session_id: SessionId,
        since_sequence: u64,
    ) -> Result<Vec<MirrorFrame>, StoreError> {
        self.writer
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sequence, producer, payload_json FROM mirror_frames \
                     WHERE session_id = ?1 AND sequence > ?2 ORDER BY sequence ASC",
                )?;
                let rows = stmt.query_map(params![session_id.0, since_sequence as i64], |row| {
                    let sequence: i64 = row.get(0)?;
                    let producer: String = row.get(1)?;
                    let payload_json: String = row.get(2)?;
                    Ok((sequence as u64, producer, payload_json))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (sequence, producer, payload_json) = row?;
                    let payload = serde_json::from_str(&payload_json)?;
                    out.push(MirrorFrame {
                        session_id: session_id.clone(),
                        producer,
                        sequence,
                        payload,
                    });
                }
                Ok(out)
            })
            .await
    }
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Running => "running",
        SessionState::Done => "done",
        SessionState::Error => "error",
    }
}

fn parse_state(raw: &str) -> SessionState {
    match raw {
        "done" => SessionState::Done,
        "error" => SessionState::Error,
        _ => SessionState::Running,
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<MirrorSession> {
    let session_id: String = row.get(0)?;
    let meta_json: String = row.get(1)?;
    let tags_json: String = row.get(2)?;
    let state: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let last_seen_at: String = row.get(5)?;
    let frame_count: i64 = row.get(6)?;
    let next_sequence: i64 = row.get(7)?;

    let meta: SessionMeta = serde_json::from_str(&meta_json).unwrap_or_default();
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());
    let last_seen_at = chrono::DateTime::parse_from_rfc3339(&last_seen_at)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());

    Ok(MirrorSession {
        id: SessionId(session_id),
        meta,
        tags,
        state: parse_state(&state),
        created_at,
        last_seen_at,
        frame_count: frame_count.max(0) as u64,
        next_sequence: next_sequence.max(1) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::FramePayload;
    use ktl_protocol::frame::Heartbeat;

    fn sample_session() -> MirrorSession {
        MirrorSession::new(
            SessionId("s1".into()),
            SessionMeta {
                namespace: Some("payments".into()),
                ..Default::default()
            },
            vec!["ci".into()],
        )
    }

    #[tokio::test]
    async fn round_trips_session_and_frames() {
        let store = SessionStore::new(Writer::open_in_memory().unwrap());
        let mut session = sample_session();
        store.create_session(&session).await.unwrap();

        let seq = session.assign_sequence();
        store.save_session_state(&session).await.unwrap();
        store
            .append_frame(&MirrorFrame {
                session_id: session.id.clone(),
                producer: "agent-1".into(),
                sequence: seq,
                payload: FramePayload::Heartbeat(Heartbeat { sent_at_epoch_ms: 0 }),
            })
            .await
            .unwrap();

        let loaded = store.load_session(session.id.clone()).await.unwrap();
        assert_eq!(loaded.frame_count, 1);
        assert_eq!(loaded.next_sequence, 2);

        let frames = store.load_frames_since(session.id.clone(), 0).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 1);
    }

    #[tokio::test]
    async fn list_sessions_applies_filter() {
        let store = SessionStore::new(Writer::open_in_memory().unwrap());
        store.create_session(&sample_session()).await.unwrap();

        let mut filter = SessionFilter::default();
        filter.namespace = Some("payments".into());
        assert_eq!(store.list_sessions(filter).await.unwrap().len(), 1);

        let mut filter = SessionFilter::default();
        filter.namespace = Some("other".into());
        assert_eq!(store.list_sessions(filter).await.unwrap().len(), 0);
    }
}
