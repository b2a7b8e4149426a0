//! HTTP/SSE gateway over the mirror hub (`spec.md` §4.5 "B. HTTP/SSE
//! gateway").

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use ktl_config::MirrorConfig;
use ktl_mirror::MirrorHub;
use ktl_protocol::session::{SessionFilter, SessionState};
use ktl_protocol::SessionId;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::auth::{self, AuthConfig, TokenStore};
use crate::error::TransportError;

#[derive(Clone)]
pub struct GatewayState {
    pub hub: Arc<MirrorHub>,
    pub mirror_config: MirrorConfig,
    pub auth: AuthConfig,
    pub tokens: TokenStore,
}

/// Builds the full router: public auth endpoint plus the token-gated
/// mirror API, with permissive CORS left for a reverse proxy to tighten
/// (`spec.md` §4.5).
pub fn router(state: GatewayState) -> Router {
    let protected = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/export", get(export_session))
        .route("/sessions/:id/tail", get(tail_session))
        .layer(axum::middleware::from_fn_with_state(
            (state.auth.clone(), state.tokens.clone()),
            auth::require_token,
        ));

    let auth_routes = Router::new()
        .route("/auth/cookie", post(issue_cookie))
        .route("/auth/cookie", delete(revoke_cookie));

    Router::new()
        .nest("/api/v1/mirror", protected.merge(auth_routes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    command: Option<String>,
    requester: Option<String>,
    cluster: Option<String>,
    kube_context: Option<String>,
    namespace: Option<String>,
    release: Option<String>,
    chart: Option<String>,
    state: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    limit: Option<usize>,
}

fn parse_state(raw: &str) -> Option<SessionState> {
    match raw {
        "running" => Some(SessionState::Running),
        "done" => Some(SessionState::Done),
        "error" => Some(SessionState::Error),
        _ => None,
    }
}

async fn list_sessions(
    State(state): State<GatewayState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, TransportError> {
    let filter = SessionFilter {
        command: query.command,
        requester: query.requester,
        cluster: query.cluster,
        kube_context: query.kube_context,
        namespace: query.namespace,
        release: query.release,
        chart: query.chart,
        state: query.state.as_deref().and_then(parse_state),
        since: None,
        until: None,
        tags: query.tags,
        limit: query.limit,
    };
    let sessions = state.hub.list_sessions(filter).await?;
    Ok(Json(sessions).into_response())
}

async fn get_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Response, TransportError> {
    let session = state.hub.get_session(SessionId(id)).await?;
    Ok(Json(session).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct ExportQuery {
    from_sequence: Option<u64>,
}

/// NDJSON export from `from_sequence` (default 1), one frame per line.
async fn export_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, TransportError> {
    let since = query.from_sequence.unwrap_or(1).saturating_sub(1);
    let frames = state.hub.frames_since(SessionId(id), since).await?;

    let body = frames
        .into_iter()
        .map(|frame| {
            let mut line = serde_json::to_vec(&wire_frame(&frame)).unwrap_or_default();
            line.push(b'\n');
            Ok::<_, Infallible>(bytes::Bytes::from(line))
        })
        .collect::<Vec<_>>();
    let stream = futures::stream::iter(body);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("static NDJSON response is well-formed"))
}

#[derive(Debug, Deserialize, Default)]
struct TailQuery {
    last_event_id: Option<u64>,
    retry_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
    replay: Option<u8>,
}

fn wire_frame(frame: &ktl_protocol::MirrorFrame) -> serde_json::Value {
    serde_json::json!({
        "session_id": frame.session_id.0,
        "producer": frame.producer,
        "sequence": frame.sequence,
        "payload": frame.payload,
    })
}

/// Builds the event stream `tail_session` wraps in `Sse`: a replay-state
/// hydration event, then backlog, then live frames. Split out so it can be
/// driven directly in tests without going through the SSE response body.
async fn tail_events(
    state: &GatewayState,
    session_id: SessionId,
    since: u64,
    replay: bool,
    retry_ms: u64,
) -> Result<impl Stream<Item = Result<Event, Infallible>>, TransportError> {
    let (mut rx, snapshot) = state.hub.subscribe(&session_id).await?;
    let backlog = if replay {
        state.hub.frames_since(session_id.clone(), since).await?
    } else {
        Vec::new()
    };

    let mut expected = since + 1;
    Ok(async_stream::stream! {
        yield Ok(replay_state_event(&snapshot));
        for frame in backlog {
            if frame.sequence > expected {
                yield Ok(dropped_event(expected, frame.sequence - 1));
            }
            expected = frame.sequence + 1;
            yield Ok(frame_event(&frame, retry_ms));
        }
        while let Some(frame) = rx.recv().await {
            if frame.sequence < expected {
                continue;
            }
            if frame.sequence > expected {
                yield Ok(dropped_event(expected, frame.sequence - 1));
            }
            expected = frame.sequence + 1;
            yield Ok(frame_event(&frame, retry_ms));
        }
    })
}

/// Server-Sent Events stream honoring `Last-Event-ID` resume, gap
/// reporting, and heartbeat/retry overrides (`spec.md` §4.5 "tail").
async fn tail_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TailQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, TransportError> {
    let session_id = SessionId(id);

    let last_event_id = query.last_event_id.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    });
    let replay = query.replay.map(|v| v != 0).unwrap_or(last_event_id.is_some());
    let since = last_event_id.unwrap_or(0);

    let heartbeat = query
        .heartbeat_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.mirror_config.clamped_heartbeat());
    let retry_ms = query.retry_ms.unwrap_or(1000);

    let events = tail_events(&state, session_id, since, replay, retry_ms).await?;
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(heartbeat).text("ping")))
}

fn frame_event(frame: &ktl_protocol::MirrorFrame, retry_ms: u64) -> Event {
    Event::default()
        .event("frame")
        .id(frame.sequence.to_string())
        .retry(Duration::from_millis(retry_ms))
        .json_data(wire_frame(frame))
        .expect("frame payload always serializes")
}

/// Hydration event emitted once, before any backlog or live frame, so a
/// client can render current state without waiting on a full replay
/// (`spec.md` §4.4 C10 "late-subscriber hydration").
fn replay_state_event(snapshot: &ktl_mirror::ReplaySnapshot) -> Event {
    let phases: Vec<_> = snapshot
        .phases
        .iter()
        .map(|(name, done, detail)| serde_json::json!({ "name": name, "done": done, "detail": detail }))
        .collect();
    let health = snapshot
        .health
        .as_ref()
        .map(|(healthy, detail)| serde_json::json!({ "healthy": healthy, "detail": detail }));
    Event::default()
        .event("replay-state")
        .json_data(serde_json::json!({
            "summary": snapshot.summary,
            "diff": snapshot.diff,
            "resources": snapshot.resources,
            "health": health,
            "phases": phases,
            "logs": snapshot.logs,
        }))
        .expect("replay state payload always serializes")
}

fn dropped_event(expected: u64, observed_high: u64) -> Event {
    Event::default()
        .event("dropped")
        .id(observed_high.to_string())
        .json_data(serde_json::json!({ "expected": expected, "through": observed_high }))
        .expect("dropped payload always serializes")
}

async fn issue_cookie(State(state): State<GatewayState>) -> impl IntoResponse {
    let token = state.tokens.issue();
    let cookie = format!(
        "{}={}; HttpOnly; Path=/; SameSite=Strict",
        auth::COOKIE_NAME,
        token
    );
    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, cookie.parse().unwrap());
    (StatusCode::NO_CONTENT, headers)
}

async fn revoke_cookie(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(cookie) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookie.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == auth::COOKIE_NAME {
                    state.tokens.revoke(value);
                }
            }
        }
    }
    let expired = format!(
        "{}=; HttpOnly; Path=/; Max-Age=0",
        auth::COOKIE_NAME
    );
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::SET_COOKIE, expired.parse().unwrap());
    (StatusCode::NO_CONTENT, response_headers)
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::frame::{FramePayload, Heartbeat};

    #[test]
    fn parse_state_accepts_known_labels_only() {
        assert_eq!(parse_state("running"), Some(SessionState::Running));
        assert_eq!(parse_state("done"), Some(SessionState::Done));
        assert_eq!(parse_state("error"), Some(SessionState::Error));
        assert_eq!(parse_state("bogus"), None);
    }

    #[test]
    fn wire_frame_carries_sequence_and_producer() {
        let frame = ktl_protocol::MirrorFrame {
            session_id: SessionId("s1".into()),
            producer: "runner".into(),
            sequence: 3,
            payload: FramePayload::Heartbeat(Heartbeat { sent_at_epoch_ms: 0 }),
        };
        let value = wire_frame(&frame);
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["producer"], "runner");
    }

    #[tokio::test]
    async fn tail_events_yields_replay_state_before_any_frame() {
        use ktl_protocol::frame::{DeployEvent, SummaryShape};
        use ktl_protocol::SessionMeta;

        let store = ktl_store::Store::open_in_memory().unwrap().sessions;
        let hub = Arc::new(ktl_mirror::MirrorHub::new(store, ktl_config::MirrorConfig::default()));
        let session_id = hub.open_session(SessionMeta::default(), vec![]).await.unwrap();
        hub.publish(
            &session_id,
            "agent",
            FramePayload::DeployEvent(DeployEvent::Summary(SummaryShape { text: "ok".into() })),
        )
        .await
        .unwrap();

        let state = GatewayState {
            hub,
            mirror_config: MirrorConfig::default(),
            auth: AuthConfig::new("secret"),
            tokens: TokenStore::new(),
        };

        let mut events = Box::pin(
            tail_events(&state, session_id, 0, false, 1000)
                .await
                .expect("builds stream"),
        );

        let first = events.next().await.expect("stream yields").expect("infallible");
        let rendered = first.to_string();
        assert!(rendered.contains("replay-state"));
        assert!(rendered.contains("\"summary\":\"ok\""));
    }
}
