use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::PROTOCOL_VERSION_LATEST;
use crate::channel::{Frame, TransportError, UpstreamChannel, parse_frame};
use crate::jsonrpc::{
    JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::sse::message_payloads;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

#[derive(Debug, Clone)]
pub struct HttpUpstreamOptions {
    pub endpoint: Url,
    /// Extra request headers, e.g. `Authorization`.
    pub headers: Vec<(String, String)>,
    pub protocol_version: String,
    /// Whole-request deadline applied by the HTTP client. `None` disables it.
    pub timeout: Option<Duration>,
}

impl HttpUpstreamOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            headers: Vec::new(),
            protocol_version: PROTOCOL_VERSION_LATEST.to_string(),
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Upstream reached over MCP streamable HTTP.
///
/// Every request is its own POST, so correlation is implicit. The session id
/// handed out by the server and the protocol version it negotiates during
/// `initialize` are remembered and sent on every later POST.
pub struct HttpUpstream {
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    protocol_version: RwLock<String>,
    session_id: RwLock<Option<String>>,
    notifications: Option<mpsc::Sender<JsonRpcNotification>>,
}

impl HttpUpstream {
    pub fn new(
        opts: HttpUpstreamOptions,
        notifications: Option<mpsc::Sender<JsonRpcNotification>>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(t) = opts.timeout {
            builder = builder.timeout(t);
        }
        let http = builder
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            http,
            endpoint: opts.endpoint,
            headers: header_map(&opts.headers)?,
            protocol_version: RwLock::new(opts.protocol_version),
            session_id: RwLock::new(None),
            notifications,
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn protocol_version(&self) -> String {
        self.protocol_version
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn post(&self, body: &JsonRpcMessage) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
            .header(PROTOCOL_HEADER, self.protocol_version())
            .json(body);

        if let Some(sid) = self.session_id() {
            req = req.header(SESSION_HEADER, sid);
        }
        req
    }

    fn remember_negotiated(&self, method: &str, frame: &Frame) {
        if method != "initialize" {
            return;
        }
        if let Frame::Message(JsonRpcMessage::Response(JsonRpcResponse {
            result: Some(result),
            ..
        })) = frame
            && let Some(v) = result.get("protocolVersion").and_then(Value::as_str)
        {
            *self
                .protocol_version
                .write()
                .unwrap_or_else(|e| e.into_inner()) = v.to_string();
        }
    }

    async fn forward_notification(&self, note: JsonRpcNotification) {
        match &self.notifications {
            Some(tx) => {
                if tx.send(note).await.is_err() {
                    debug!("notification receiver dropped");
                }
            }
            None => debug!(method = %note.method, "dropping upstream notification"),
        }
    }

    /// Picks the answer to request `id` out of an SSE body; notifications
    /// streamed ahead of it are forwarded.
    async fn frame_from_event_stream(
        &self,
        id: &JsonRpcId,
        body: &str,
    ) -> Result<Frame, TransportError> {
        let mut first_malformed = None;
        for payload in message_payloads(body) {
            match parse_frame(&payload) {
                Frame::Message(JsonRpcMessage::Response(r)) if r.id == *id => {
                    return Ok(Frame::Message(JsonRpcMessage::Response(r)));
                }
                Frame::Message(JsonRpcMessage::Response(r)) => {
                    debug!(id = %r.id, "skipping response to another request");
                }
                Frame::Message(JsonRpcMessage::Notification(n)) => {
                    self.forward_notification(n).await;
                }
                Frame::Message(JsonRpcMessage::Request(r)) => {
                    debug!(method = %r.method, "ignoring upstream request on response stream");
                }
                Frame::Malformed(m) => {
                    first_malformed.get_or_insert(m);
                }
            }
        }
        first_malformed
            .map(Frame::Malformed)
            .ok_or_else(|| TransportError::Protocol("no response in event stream".to_string()))
    }
}

pub(crate) fn header_map(pairs: &[(String, String)]) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (k, v) in pairs {
        let name = HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid header name {k}"))?;
        let value =
            HeaderValue::from_str(v).with_context(|| format!("invalid value for header {k}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl UpstreamChannel for HttpUpstream {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Frame, TransportError> {
        let id = JsonRpcId::String(Uuid::new_v4().to_string());
        let msg = JsonRpcMessage::Request(JsonRpcRequest::new(id.clone(), method, params));

        let resp = self
            .post(&msg)
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("send request: {e}")))?;
        let status = resp.status();

        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.write().unwrap_or_else(|e| e.into_inner()) = Some(sid.to_string());
        }

        if status == StatusCode::ACCEPTED {
            return Err(TransportError::Protocol(
                "server returned 202 accepted for a request (no response)".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(TransportError::Http(format!("mcp http status {status}")));
        }

        let ct = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Http(format!("read response body: {e}")))?;
        debug!(content_type = %ct, method, "mcp http response");

        let frame = if ct.starts_with("application/json") || ct.is_empty() {
            parse_frame(body.trim())
        } else if ct.starts_with("text/event-stream") {
            self.frame_from_event_stream(&id, &body).await?
        } else {
            return Err(TransportError::Protocol(format!(
                "unsupported content-type: {ct}"
            )));
        };

        self.remember_negotiated(method, &frame);
        Ok(frame)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let msg = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        let resp = self
            .post(&msg)
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("send notification: {e}")))?;

        // Some servers answer notifications with 200 and a body; both are fine.
        if resp.status() == StatusCode::ACCEPTED || resp.status().is_success() {
            return Ok(());
        }
        Err(TransportError::Http(format!(
            "notification failed: {}",
            resp.status()
        )))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(sid) = self.session_id() else {
            return Ok(());
        };

        // Session teardown is advisory; servers may not support DELETE.
        match self
            .http
            .delete(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, sid)
            .send()
            .await
        {
            Ok(r) if !r.status().is_success() => {
                debug!(status = %r.status(), "mcp session delete not accepted");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "mcp session delete failed"),
        }
        Ok(())
    }
}
