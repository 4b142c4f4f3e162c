//! Upstream reached over the HTTP+SSE transport that predates streamable HTTP.
//!
//! One long-lived GET event stream carries every server message. Its first
//! `endpoint` event names the URL that client messages are POSTed to; answers
//! come back on the stream, so correlation happens the same way as on a pipe.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use http::header::{ACCEPT, HeaderMap};
use tracing::{debug, info};
use url::Url;

use crate::channel::{Frame, FrameSink, FrameSource, TransportError, parse_frame};
use crate::http_client::header_map;
use crate::jsonrpc::JsonRpcMessage;
use crate::sse::{SseEvent, decode_sse_events};

/// Largest event accepted before a blank line terminates it.
const MAX_EVENT_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SseUpstreamOptions {
    /// The event stream URL, typically ending in `/sse`.
    pub url: Url,
    /// Extra headers sent on the GET and on every POST.
    pub headers: Vec<(String, String)>,
    /// How long the stream may take to announce its POST endpoint.
    pub endpoint_timeout: Duration,
    /// Deadline for each POST. `None` disables it.
    pub post_timeout: Option<Duration>,
}

impl SseUpstreamOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            endpoint_timeout: Duration::from_secs(30),
            post_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Opens the event stream and waits for its `endpoint` announcement.
///
/// The returned halves plug into [`PipeUpstream`](crate::PipeUpstream), which
/// assigns ids and routes answers read from the stream back to their callers.
pub async fn connect_sse(
    opts: SseUpstreamOptions,
) -> anyhow::Result<(SseMessageSource, SsePostSink)> {
    let headers = header_map(&opts.headers)?;
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build reqwest client")?;

    let resp = http
        .get(opts.url.clone())
        .headers(headers.clone())
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .context("open event stream")?;
    anyhow::ensure!(
        resp.status().is_success(),
        "event stream status {}",
        resp.status()
    );

    let mut events = EventStream::new(resp);
    let endpoint = tokio::time::timeout(
        opts.endpoint_timeout,
        wait_for_endpoint(&mut events, &opts.url),
    )
    .await
    .context("no endpoint event before the deadline")??;
    info!(stream = %opts.url, endpoint = %endpoint, "event stream announced its endpoint");

    let sink = SsePostSink {
        http,
        endpoint,
        headers,
        timeout: opts.post_timeout,
    };
    Ok((SseMessageSource { events }, sink))
}

async fn wait_for_endpoint(events: &mut EventStream, stream_url: &Url) -> anyhow::Result<Url> {
    while let Some(ev) = events.next_event().await? {
        if ev.event.as_deref() != Some("endpoint") {
            debug!(event = ?ev.event, "event ahead of the endpoint announcement");
            continue;
        }
        let endpoint = stream_url
            .join(ev.data.trim())
            .with_context(|| format!("invalid endpoint {}", ev.data.trim()))?;
        anyhow::ensure!(
            endpoint.origin() == stream_url.origin(),
            "endpoint {endpoint} is not on the event stream's origin"
        );
        return Ok(endpoint);
    }
    anyhow::bail!("event stream ended before announcing an endpoint")
}

/// Incremental SSE decoding over a streaming response body.
struct EventStream {
    resp: reqwest::Response,
    buf: Vec<u8>,
    ready: VecDeque<SseEvent>,
    done: bool,
}

impl EventStream {
    fn new(resp: reqwest::Response) -> Self {
        Self {
            resp,
            buf: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    async fn next_event(&mut self) -> Result<Option<SseEvent>, TransportError> {
        loop {
            if let Some(ev) = self.ready.pop_front() {
                return Ok(Some(ev));
            }
            if self.done {
                return Ok(None);
            }

            let chunk = self
                .resp
                .chunk()
                .await
                .map_err(|e| TransportError::Http(format!("read event stream: {e}")))?;
            let Some(chunk) = chunk else {
                self.done = true;
                let rest = std::mem::take(&mut self.buf);
                self.ready
                    .extend(decode_sse_events(&String::from_utf8_lossy(&rest)));
                continue;
            };

            // CRLF and LF line endings decode the same.
            self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
            match complete_events_end(&self.buf) {
                Some(end) => {
                    let complete: Vec<u8> = self.buf.drain(..end).collect();
                    self.ready
                        .extend(decode_sse_events(&String::from_utf8_lossy(&complete)));
                }
                None if self.buf.len() > MAX_EVENT_LEN => {
                    return Err(TransportError::Protocol(format!(
                        "event exceeds {MAX_EVENT_LEN} bytes"
                    )));
                }
                None => {}
            }
        }
    }
}

/// End of the last blank-line-terminated event in `buf`.
fn complete_events_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).rposition(|w| w == b"\n\n").map(|i| i + 2)
}

/// Inbound half: JSON-RPC messages carried by `message` events.
pub struct SseMessageSource {
    events: EventStream,
}

#[async_trait]
impl FrameSource for SseMessageSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        while let Some(ev) = self.events.next_event().await? {
            match ev.event.as_deref() {
                None | Some("message") => return Ok(Some(parse_frame(ev.data.trim()))),
                Some(other) => debug!(event = other, "skipping non-message event"),
            }
        }
        Ok(None)
    }
}

/// Outbound half: every message is its own POST to the announced endpoint.
pub struct SsePostSink {
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl SsePostSink {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl FrameSink for SsePostSink {
    async fn send_frame(&mut self, msg: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(msg);
        if let Some(t) = self.timeout {
            req = req.timeout(t);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("post message: {e}")))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "post message status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
