// sse.rs — northbound SSE sessions and their paired POST message channel.
//
// A client GETs /sse and holds the stream open. The first event is named
// `endpoint` and carries the paired POST path including the session id;
// every later event is named `message` and carries one JSON-RPC response.
// The POST handler never writes the reply into the POST body — it queues
// the response on the session's outbound channel and answers 202 Accepted.
// The SSE stream task is the sole owner of the HTTP response; handlers
// only ever send into the channel.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jsonrpc::{self, Request, Response};
use crate::GatewayContext;

const OUTBOUND_BUFFER: usize = 32;
const AGENT_QUERY_PARAM: &str = "agent";
const AGENT_HEADER: &str = "x-agent-name";

/// One northbound session. Shared between the SSE stream and the POST
/// handler servicing the paired URL.
pub struct SseSession {
    pub id: String,
    pub agent: String,
    tx: mpsc::Sender<String>,
    /// Serializes dispatch+enqueue so responses keep POST submission order
    /// on this channel.
    dispatch_lock: Mutex<()>,
    created_at: Instant,
    last_seen: StdMutex<Instant>,
}

impl SseSession {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn touch(&self) {
        *self.last_seen.lock().expect("last_seen poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().expect("last_seen poisoned").elapsed()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SseSession>>>,
    message_path: String,
    max_age: Duration,
}

impl SessionManager {
    pub fn new(message_path: impl Into<String>, max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            message_path: message_path.into(),
            max_age,
        }
    }

    /// Allocate a session with a 128-bit random hex id and register it.
    pub async fn register(&self, agent: String) -> (Arc<SseSession>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session = Arc::new(SseSession {
            id: uuid::Uuid::new_v4().simple().to_string(),
            agent,
            tx,
            dispatch_lock: Mutex::new(()),
            created_at: Instant::now(),
            last_seen: StdMutex::new(Instant::now()),
        });
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session = %session.id, agent = %session.agent, "sse session opened");
        (session, rx)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SseSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            info!(session = %id, "sse session closed");
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn endpoint_path(&self, session_id: &str) -> String {
        format!("{}?sessionId={session_id}", self.message_path)
    }

    /// Drop sessions idle past the max age and sessions whose stream went
    /// away without the guard firing.
    pub async fn sweep(&self) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.idle_for() > self.max_age || s.tx.is_closed())
                .map(|s| s.id.clone())
                .collect()
        };
        if stale.is_empty() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        for id in &stale {
            sessions.remove(id);
            debug!(session = %id, "stale session swept");
        }
        stale.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = manager.sweep().await;
                        if swept > 0 {
                            info!(count = swept, "swept idle sse sessions");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}

/// Resolve the agent identity: query parameter first, then header, then
/// empty. Fixed at session creation.
pub fn agent_identity(params: &HashMap<String, String>, headers: &HeaderMap) -> String {
    if let Some(agent) = params.get(AGENT_QUERY_PARAM) {
        if !agent.is_empty() {
            return agent.clone();
        }
    }
    headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Deregisters the session when the SSE stream is dropped.
struct SessionGuard {
    id: String,
    manager: Arc<SessionManager>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let manager = Arc::clone(&self.manager);
        let id = std::mem::take(&mut self.id);
        tokio::spawn(async move {
            manager.remove(&id).await;
        });
    }
}

/// A stream that owns its session guard; dropping the stream (client
/// disconnect) deregisters the session.
struct SessionStream<S> {
    inner: S,
    _guard: SessionGuard,
}

impl<S: Stream + Unpin> Stream for SessionStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<S::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// GET /sse
pub async fn sse_handler(
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = agent_identity(&params, &headers);
    let (session, rx) = ctx.sessions.register(agent).await;

    let endpoint = Event::default()
        .event("endpoint")
        .data(ctx.sessions.endpoint_path(&session.id));

    let messages = SessionStream {
        inner: ReceiverStream::new(rx),
        _guard: SessionGuard {
            id: session.id.clone(),
            manager: Arc::clone(&ctx.sessions),
        },
    }
    .map(|payload| Ok::<Event, Infallible>(Event::default().event("message").data(payload)));

    let stream = stream::once(async move { Ok::<Event, Infallible>(endpoint) }).chain(messages);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// POST /message?sessionId=…
pub async fn message_handler(
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> axum::response::Response {
    let Some(session_id) = params.get("sessionId") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing sessionId"})),
        )
            .into_response();
    };
    let Some(session) = ctx.sessions.get(session_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response();
    };
    session.touch();

    let req: Request = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(_) => {
            // Malformed JSON-RPC is the one case answered in the POST body.
            let resp = Response::error(Value::Null, jsonrpc::PARSE_ERROR, "Parse error");
            return (StatusCode::BAD_REQUEST, Json(resp)).into_response();
        }
    };

    // Hold the per-session lock across dispatch and enqueue so two
    // concurrent POSTs cannot reorder their responses on the stream.
    let _ordering = session.dispatch_lock.lock().await;
    if let Some(resp) = ctx.gateway.dispatch(req, &session.agent, &ctx.shutdown).await {
        match serde_json::to_string(&resp) {
            Ok(payload) => {
                if session.tx.send(payload).await.is_err() {
                    warn!(session = %session.id, "session stream gone; response dropped");
                }
            }
            Err(e) => warn!(session = %session.id, err = %e, "response serialization failed"),
        }
    }

    StatusCode::ACCEPTED.into_response()
}
