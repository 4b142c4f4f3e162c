//! Downstream side served over HTTP.
//!
//! Every downstream HTTP session shares the one upstream relay session. Two
//! transports are offered side by side:
//! - streamable HTTP at the configured path, where only POST carries messages
//! - the older HTTP+SSE pair: `GET /sse` opens an event stream that announces
//!   a `/messages/` URL for POSTs, and answers plus upstream notifications
//!   arrive on the stream

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, MutexGuard};

use anyhow::Context as _;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt as _;
use futures::stream::{self, unfold};
use relay_core::{RelayCore, RelayError, recover_message};
use relay_mcp::{
    Frame, INVALID_REQUEST, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, parse_frame,
};
use tokio::sync::{Mutex, mpsc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

pub const SSE_PATH: &str = "/sse";
pub const MESSAGES_PATH: &str = "/messages/";

/// Outbound messages buffered per event stream.
const STREAM_BUFFER: usize = 64;

type EventStreams = Arc<std::sync::Mutex<HashMap<String, mpsc::Sender<JsonRpcMessage>>>>;

fn lock_streams(
    streams: &EventStreams,
) -> MutexGuard<'_, HashMap<String, mpsc::Sender<JsonRpcMessage>>> {
    streams.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
struct HttpState {
    core: Arc<RelayCore>,
    sessions: Arc<Mutex<HashSet<String>>>,
    streams: EventStreams,
    allowed_origins: Arc<Vec<String>>,
}

/// Builds the downstream router. Upstream notifications, if given, are fanned
/// out to every open event stream.
pub fn router(
    core: Arc<RelayCore>,
    path: &str,
    allowed_origins: Vec<String>,
    notifications: Option<mpsc::Receiver<JsonRpcNotification>>,
) -> Router {
    let cors = cors_layer(&allowed_origins);
    let st = HttpState {
        core,
        sessions: Arc::new(Mutex::new(HashSet::new())),
        streams: Arc::default(),
        allowed_origins: Arc::new(allowed_origins),
    };
    if let Some(notes) = notifications {
        tokio::spawn(fan_out(st.streams.clone(), notes));
    }

    let app = Router::new()
        .route(path, post(http_post).delete(http_delete).get(http_get))
        .route(SSE_PATH, get(sse_open))
        .route(MESSAGES_PATH, post(sse_post))
        .layer(TraceLayer::new_for_http())
        .with_state(st);
    match cors {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

pub async fn serve_http(
    addr: SocketAddr,
    path: &str,
    allowed_origins: Vec<String>,
    core: Arc<RelayCore>,
    notifications: mpsc::Receiver<JsonRpcNotification>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        path != SSE_PATH && path != MESSAGES_PATH,
        "http path {path} is reserved for the sse transport"
    );
    let app = router(core, path, allowed_origins, Some(notifications));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let local = listener.local_addr().context("read bound address")?;

    info!(addr = %local, path = %path, sse = SSE_PATH, "serving MCP over HTTP");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);
    if origins.iter().any(|o| o == "*") {
        return Some(layer.allow_origin(Any));
    }
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    Some(layer.allow_origin(AllowOrigin::list(list)))
}

async fn http_get() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        "server-sent events are offered at /sse",
    )
}

async fn http_delete(State(st): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(sid) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    if st.sessions.lock().await.remove(sid) {
        debug!(session = %sid, "downstream session ended");
    }
    StatusCode::ACCEPTED.into_response()
}

async fn http_post(State(st): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    if let Err((code, msg)) = validate_origin(&headers, &st.allowed_origins) {
        return (code, msg).into_response();
    }
    if let Some(v) = header_str(&headers, PROTOCOL_HEADER)
        && v.trim().is_empty()
    {
        return (StatusCode::BAD_REQUEST, "invalid mcp-protocol-version").into_response();
    }

    let msg = match decode_body(&body) {
        Ok(msg) => msg,
        Err(resp) => return jsonrpc_http_response(resp, None),
    };

    // Initialize starts a new downstream session.
    if let JsonRpcMessage::Request(JsonRpcRequest { method, .. }) = &msg
        && method == "initialize"
    {
        let sid = Uuid::new_v4().to_string();
        let resp = st.core.handle_message(msg).await;
        st.sessions.lock().await.insert(sid.clone());
        debug!(session = %sid, "downstream session started");
        return match resp {
            Some(r) => jsonrpc_http_response(r, Some(&sid)),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    let Some(sid) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    if !st.sessions.lock().await.contains(sid) {
        return (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response();
    }

    match st.core.handle_message(msg).await {
        Some(r) => jsonrpc_http_response(r, Some(sid)),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// One JSON-RPC message per body; malformed bodies are salvaged when possible.
fn decode_body(body: &str) -> Result<JsonRpcMessage, JsonRpcResponse> {
    if body.trim_start().starts_with('[') {
        return Err(JsonRpcResponse::err(
            JsonRpcId::Null,
            JsonRpcError {
                code: INVALID_REQUEST,
                message: "batching not supported".to_string(),
                data: None,
            },
        ));
    }

    match parse_frame(body.trim()) {
        Frame::Message(m) => Ok(m),
        Frame::Malformed(m) => recover_message(&m).ok_or_else(|| {
            JsonRpcResponse::err(JsonRpcId::Null, RelayError::parse(&m).to_jsonrpc())
        }),
    }
}

/// Drops the stream's registration once the client goes away.
struct StreamRegistration {
    sid: String,
    streams: EventStreams,
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        if lock_streams(&self.streams).remove(&self.sid).is_some() {
            debug!(session = %self.sid, "event stream closed");
        }
    }
}

async fn sse_open(State(st): State<HttpState>, headers: HeaderMap) -> Response {
    if let Err((code, msg)) = validate_origin(&headers, &st.allowed_origins) {
        return (code, msg).into_response();
    }

    let sid = Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    lock_streams(&st.streams).insert(sid.clone(), tx);
    debug!(session = %sid, "event stream opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGES_PATH}?session_id={sid}"));
    let registration = StreamRegistration {
        sid,
        streams: st.streams.clone(),
    };
    let messages = unfold((rx, registration), |(mut rx, registration)| async move {
        let msg = rx.recv().await?;
        let data = serde_json::to_string(&msg).unwrap_or_default();
        let event = Event::default().event("message").data(data);
        Some((Ok::<_, Infallible>(event), (rx, registration)))
    });

    Sse::new(stream::once(async move { Ok::<_, Infallible>(endpoint) }).chain(messages))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn sse_post(
    State(st): State<HttpState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err((code, msg)) = validate_origin(&headers, &st.allowed_origins) {
        return (code, msg).into_response();
    }
    let Some(sid) = query.get("session_id") else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    let Some(tx) = lock_streams(&st.streams).get(sid).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown session_id").into_response();
    };

    let msg = match decode_body(&body) {
        Ok(msg) => msg,
        Err(resp) => {
            let _ = tx.send(JsonRpcMessage::Response(resp)).await;
            return (StatusCode::BAD_REQUEST, "could not parse message").into_response();
        }
    };

    // Answers travel on the event stream, so the POST returns right away.
    let core = st.core.clone();
    tokio::spawn(async move {
        if let Some(resp) = core.handle_message(msg).await
            && tx.send(JsonRpcMessage::Response(resp)).await.is_err()
        {
            debug!("event stream gone before the answer was ready");
        }
    });
    StatusCode::ACCEPTED.into_response()
}

async fn fan_out(streams: EventStreams, mut notes: mpsc::Receiver<JsonRpcNotification>) {
    while let Some(note) = notes.recv().await {
        let targets: Vec<_> = lock_streams(&streams).values().cloned().collect();
        if targets.is_empty() {
            debug!(method = %note.method, "no event stream open; dropping upstream notification");
            continue;
        }
        for tx in targets {
            if tx
                .try_send(JsonRpcMessage::Notification(note.clone()))
                .is_err()
            {
                debug!(method = %note.method, "event stream full or closed; notification dropped");
            }
        }
    }
}

/// Browsers may only reach the relay from loopback pages or configured
/// origins.
fn validate_origin(
    headers: &HeaderMap,
    allowed: &[String],
) -> Result<(), (StatusCode, &'static str)> {
    let Some(origin) = headers
        .get("origin")
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.trim().is_empty())
    else {
        return Ok(());
    };
    if allowed.iter().any(|a| a == "*" || a == origin) {
        return Ok(());
    }

    let u = url::Url::parse(origin).map_err(|_| (StatusCode::FORBIDDEN, "invalid origin"))?;
    let host = u.host().ok_or((StatusCode::FORBIDDEN, "invalid origin"))?;
    let is_loopback = match host {
        url::Host::Domain(d) => d.eq_ignore_ascii_case("localhost"),
        url::Host::Ipv4(ip) => ip.is_loopback(),
        url::Host::Ipv6(ip) => ip.is_loopback(),
    };
    if !is_loopback {
        return Err((StatusCode::FORBIDDEN, "origin not allowed"));
    }
    Ok(())
}

fn jsonrpc_http_response(resp: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let body = serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string());
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json");

    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        builder = builder.header(SESSION_HEADER, v);
    }

    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}
