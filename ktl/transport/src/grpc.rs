//! Bidirectional RPC transport over the mirror hub (`spec.md` §4.5 "A.
//! Bidirectional RPC").

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use ktl_mirror::MirrorHub;
use ktl_protocol::session::{SessionFilter, SessionMeta, SessionState};
use ktl_protocol::FramePayload;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::mirror_service_server::MirrorService;
use crate::proto::{
    subscribe_event, Frame, GetSessionRequest, HealthEntry, ListSessionsRequest,
    ListSessionsResponse, OpenSessionRequest, OpenSessionResponse, PhaseEntry, PublishAck,
    PublishRequest, ReplayState, SessionDescriptor, SetSessionMetaRequest, SetSessionMetaResponse,
    SubscribeEvent, SubscribeRequest,
};

pub struct MirrorGrpcService {
    hub: Arc<MirrorHub>,
}

impl MirrorGrpcService {
    pub fn new(hub: Arc<MirrorHub>) -> Self {
        Self { hub }
    }
}

fn session_state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Running => "running",
        SessionState::Done => "done",
        SessionState::Error => "error",
    }
}

fn parse_session_state(raw: &str) -> Option<SessionState> {
    match raw {
        "running" => Some(SessionState::Running),
        "done" => Some(SessionState::Done),
        "error" => Some(SessionState::Error),
        _ => None,
    }
}

fn to_descriptor(session: ktl_protocol::MirrorSession) -> Result<SessionDescriptor, Status> {
    Ok(SessionDescriptor {
        session_id: session.id.0,
        meta_json: serde_json::to_vec(&session.meta)
            .map_err(|e| Status::internal(e.to_string()))?,
        tags: session.tags,
        state: session_state_label(session.state).to_string(),
        created_at: session.created_at.to_rfc3339(),
        last_seen_at: session.last_seen_at.to_rfc3339(),
        frame_count: session.frame_count,
    })
}

#[tonic::async_trait]
impl MirrorService for MirrorGrpcService {
    type PublishStream =
        Pin<Box<dyn Stream<Item = Result<PublishAck, Status>> + Send + 'static>>;
    type SubscribeStream =
        Pin<Box<dyn Stream<Item = Result<SubscribeEvent, Status>> + Send + 'static>>;

    async fn publish(
        &self,
        request: Request<Streaming<PublishRequest>>,
    ) -> Result<Response<Self::PublishStream>, Status> {
        let hub = Arc::clone(&self.hub);
        let mut inbound = request.into_inner();

        let output = async_stream::try_stream! {
            while let Some(req) = inbound.message().await? {
                let payload: FramePayload = serde_json::from_slice(&req.payload_json)
                    .map_err(|e| Status::invalid_argument(format!("invalid payload: {e}")))?;
                let session_id = ktl_protocol::SessionId(req.session_id.clone());
                let sequence = hub
                    .publish(&session_id, req.producer, payload)
                    .await
                    .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?;
                yield PublishAck { session_id: req.session_id, sequence };
            }
        };

        Ok(Response::new(Box::pin(output)))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let session_id = ktl_protocol::SessionId(req.session_id.clone());
        let hub = Arc::clone(&self.hub);

        // Register the live channel before reading the backlog so no frame
        // published in between is lost; duplicates are filtered by
        // sequence instead (`spec.md` §8 scenario 5, SSE resume).
        let (mut rx, snapshot) = hub
            .subscribe(&session_id)
            .await
            .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?;

        let since = req.from_sequence.saturating_sub(1);
        let backlog = hub
            .frames_since(session_id.clone(), since)
            .await
            .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?;
        let mut last_seq = backlog.last().map(|f| f.sequence).unwrap_or(since);

        let output = async_stream::try_stream! {
            yield to_replay_state_event(snapshot);
            for frame in backlog {
                yield to_frame_event(frame)?;
            }
            while let Some(frame) = rx.recv().await {
                if frame.sequence <= last_seq {
                    continue;
                }
                last_seq = frame.sequence;
                yield to_frame_event(frame)?;
            }
        };

        Ok(Response::new(Box::pin(output)))
    }

    async fn list_sessions(
        &self,
        request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let req = request.into_inner();
        let filter = SessionFilter {
            command: req.command,
            requester: req.requester,
            cluster: req.cluster,
            kube_context: req.kube_context,
            namespace: req.namespace,
            release: req.release,
            chart: req.chart,
            state: req.state.as_deref().and_then(parse_session_state),
            since: None,
            until: None,
            tags: req.tags,
            limit: req.limit.map(|l| l as usize),
        };

        let sessions = self
            .hub
            .list_sessions(filter)
            .await
            .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?
            .into_iter()
            .map(to_descriptor)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Response::new(ListSessionsResponse { sessions }))
    }

    async fn get_session(
        &self,
        request: Request<GetSessionRequest>,
    ) -> Result<Response<SessionDescriptor>, Status> {
        let req = request.into_inner();
        let session = self
            .hub
            .get_session(ktl_protocol::SessionId(req.session_id))
            .await
            .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?;
        Ok(Response::new(to_descriptor(session)?))
    }

    async fn set_session_meta(
        &self,
        request: Request<SetSessionMetaRequest>,
    ) -> Result<Response<SetSessionMetaResponse>, Status> {
        let req = request.into_inner();
        self.hub
            .set_session_tags(ktl_protocol::SessionId(req.session_id), req.tags)
            .await
            .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?;
        Ok(Response::new(SetSessionMetaResponse {}))
    }

    async fn open_session(
        &self,
        request: Request<OpenSessionRequest>,
    ) -> Result<Response<OpenSessionResponse>, Status> {
        let req = request.into_inner();
        let meta: SessionMeta = serde_json::from_slice(&req.meta_json)
            .map_err(|e| Status::invalid_argument(format!("invalid meta: {e}")))?;
        let session_id = self
            .hub
            .open_session(meta, req.tags)
            .await
            .map_err(|e| crate::error::TransportError::Mirror(e).grpc_status())?;
        Ok(Response::new(OpenSessionResponse {
            session_id: session_id.0,
        }))
    }
}

fn to_wire_frame(frame: ktl_protocol::MirrorFrame) -> Result<Frame, Status> {
    Ok(Frame {
        session_id: frame.session_id.0,
        producer: frame.producer,
        sequence: frame.sequence,
        payload_json: serde_json::to_vec(&frame.payload).map_err(|e| Status::internal(e.to_string()))?,
    })
}

fn to_frame_event(frame: ktl_protocol::MirrorFrame) -> Result<SubscribeEvent, Status> {
    Ok(SubscribeEvent {
        payload: Some(subscribe_event::Payload::Frame(to_wire_frame(frame)?)),
    })
}

fn to_replay_state_event(snapshot: ktl_mirror::ReplaySnapshot) -> SubscribeEvent {
    SubscribeEvent {
        payload: Some(subscribe_event::Payload::ReplayState(ReplayState {
            summary: snapshot.summary,
            diff: snapshot.diff,
            resources: snapshot.resources,
            health: snapshot.health.map(|(healthy, detail)| HealthEntry { healthy, detail }),
            phases: snapshot
                .phases
                .into_iter()
                .map(|(name, done, detail)| PhaseEntry { name, done, detail })
                .collect(),
            logs: snapshot.logs,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::frame::{FramePayload, Heartbeat};
    use ktl_protocol::{MirrorFrame, MirrorSession, SessionId};

    #[test]
    fn session_state_label_round_trips_through_parse() {
        for state in [SessionState::Running, SessionState::Done, SessionState::Error] {
            let label = session_state_label(state);
            assert_eq!(parse_session_state(label), Some(state));
        }
    }

    #[test]
    fn parse_session_state_rejects_unknown_labels() {
        assert_eq!(parse_session_state("paused"), None);
    }

    #[test]
    fn to_descriptor_serializes_meta_and_state() {
        let session = MirrorSession::new(SessionId("s1".into()), SessionMeta::default(), vec!["a".into()]);
        let descriptor = to_descriptor(session).expect("serializable meta");
        assert_eq!(descriptor.session_id, "s1");
        assert_eq!(descriptor.state, "running");
        assert_eq!(descriptor.tags, vec!["a".to_string()]);
    }

    #[test]
    fn to_wire_frame_preserves_sequence_and_payload() {
        let frame = MirrorFrame {
            session_id: SessionId("s1".into()),
            producer: "runner".into(),
            sequence: 7,
            payload: FramePayload::Heartbeat(Heartbeat { sent_at_epoch_ms: 0 }),
        };
        let wire = to_wire_frame(frame).expect("serializable payload");
        assert_eq!(wire.sequence, 7);
        assert_eq!(wire.producer, "runner");
    }

    #[tokio::test]
    async fn subscribe_yields_replay_state_before_any_frame() {
        use futures::StreamExt;
        use ktl_protocol::frame::{DeployEvent, SummaryShape};

        let store = ktl_store::Store::open_in_memory().unwrap().sessions;
        let hub = Arc::new(ktl_mirror::MirrorHub::new(store, ktl_config::MirrorConfig::default()));
        let session_id = hub
            .open_session(SessionMeta::default(), vec![])
            .await
            .unwrap();
        hub.publish(
            &session_id,
            "agent",
            FramePayload::DeployEvent(DeployEvent::Summary(SummaryShape { text: "ok".into() })),
        )
        .await
        .unwrap();

        let service = MirrorGrpcService::new(Arc::clone(&hub));
        let response = service
            .subscribe(Request::new(SubscribeRequest {
                session_id: session_id.0.clone(),
                from_sequence: 0,
            }))
            .await
            .expect("subscribe succeeds");
        let mut stream = response.into_inner();

        let first = stream.next().await.expect("stream yields").expect("no error");
        match first.payload {
            Some(subscribe_event::Payload::ReplayState(state)) => {
                assert_eq!(state.summary.as_deref(), Some("ok"));
            }
            other => panic!("expected ReplayState first, got {other:?}"),
        }

        let second = stream.next().await.expect("stream yields").expect("no error");
        assert!(matches!(second.payload, Some(subscribe_event::Payload::Frame(_))));
    }
}
