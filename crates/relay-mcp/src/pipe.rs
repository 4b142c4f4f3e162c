use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Frame, FrameSink, FrameSource, TransportError, UpstreamChannel};
use crate::jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, METHOD_NOT_FOUND,
};

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<Frame>>>;
type SharedSink = Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<i64, oneshot::Sender<Frame>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the pending entry when the waiting request is dropped (timeout,
/// cancellation) so late answers are discarded instead of leaking senders.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

/// Upstream reached over a duplex frame stream such as a child process's
/// stdin/stdout.
///
/// Concurrent requests are multiplexed with channel-assigned numeric ids. A
/// background task reads inbound frames and routes responses to their waiters;
/// upstream notifications go to the optional notification sender, and
/// upstream-initiated requests are answered "method not found".
pub struct PipeUpstream {
    sink: SharedSink,
    pending: Arc<PendingMap>,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PipeUpstream {
    pub fn spawn<S, K>(
        source: S,
        sink: K,
        notifications: Option<mpsc::Sender<JsonRpcNotification>>,
    ) -> Self
    where
        S: FrameSource + 'static,
        K: FrameSink + 'static,
    {
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(Box::new(sink)));
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            Box::new(source),
            sink.clone(),
            pending.clone(),
            closed.clone(),
            notifications,
        ));

        Self {
            sink,
            pending,
            next_id: AtomicI64::new(1),
            closed,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

#[async_trait]
impl UpstreamChannel for PipeUpstream {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Frame, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: self.pending.as_ref(),
            id,
        };

        // Checked after registering: the reader marks the pipe closed before it
        // drains the pending map, so either we see the flag or our sender is dropped.
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let req = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);
        self.sink
            .lock()
            .await
            .send_frame(&JsonRpcMessage::Request(req))
            .await?;

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let note = JsonRpcNotification::new(method, params);
        self.sink
            .lock()
            .await
            .send_frame(&JsonRpcMessage::Notification(note))
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        let res = self.sink.lock().await.close().await;
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        lock_pending(&self.pending).clear();
        res
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}

async fn read_loop(
    mut source: Box<dyn FrameSource>,
    sink: SharedSink,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    notifications: Option<mpsc::Sender<JsonRpcNotification>>,
) {
    loop {
        let frame = match source.next_frame().await {
            Ok(Some(f)) => f,
            Ok(None) => {
                debug!("upstream pipe closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "upstream pipe read failed");
                break;
            }
        };

        match frame {
            Frame::Message(JsonRpcMessage::Response(resp)) => route_response(&pending, resp),
            Frame::Message(JsonRpcMessage::Notification(note)) => match &notifications {
                Some(tx) => {
                    if tx.send(note).await.is_err() {
                        debug!("notification receiver dropped");
                    }
                }
                None => debug!(method = %note.method, "dropping upstream notification"),
            },
            Frame::Message(JsonRpcMessage::Request(req)) => {
                debug!(method = %req.method, "rejecting upstream-initiated request");
                let resp = JsonRpcResponse::err(
                    req.id,
                    JsonRpcError {
                        code: METHOD_NOT_FOUND,
                        message: "method not found".to_string(),
                        data: None,
                    },
                );
                if let Err(e) = sink
                    .lock()
                    .await
                    .send_frame(&JsonRpcMessage::Response(resp))
                    .await
                {
                    warn!(error = %e, "answer upstream request failed");
                }
            }
            Frame::Malformed(m) => {
                // Without an id the frame can only be attributed when exactly one
                // request is waiting.
                let mut map = lock_pending(&pending);
                if map.len() == 1 {
                    let id = *map.keys().next().unwrap_or(&0);
                    if let Some(tx) = map.remove(&id) {
                        let _ = tx.send(Frame::Malformed(m));
                    }
                } else {
                    warn!(
                        pending = map.len(),
                        offset = m.error.offset,
                        error = %m.error.message,
                        "dropping unattributable malformed upstream frame"
                    );
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    lock_pending(&pending).clear();
}

fn route_response(pending: &PendingMap, resp: JsonRpcResponse) {
    let JsonRpcId::Number(id) = resp.id else {
        warn!(id = %resp.id, "upstream response with foreign id");
        return;
    };
    let tx = lock_pending(pending).remove(&id);
    match tx {
        Some(tx) => {
            let _ = tx.send(Frame::Message(JsonRpcMessage::Response(resp)));
        }
        None => debug!(id, "late or unknown upstream response"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::parse_frame;
    use crate::stdio::{LineSink, LineSource};
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

    /// A fake upstream process on the far end of an in-memory duplex pipe.
    fn pipe_pair() -> (PipeUpstream, BufReader<tokio::io::DuplexStream>, tokio::io::DuplexStream)
    {
        let (ours_in, theirs_out) = tokio::io::duplex(64 * 1024);
        let (theirs_in, ours_out) = tokio::io::duplex(64 * 1024);
        let up = PipeUpstream::spawn(
            LineSource::new(BufReader::new(ours_in)),
            LineSink::new(ours_out),
            None,
        );
        (up, BufReader::new(theirs_in), theirs_out)
    }

    async fn read_request(reader: &mut BufReader<tokio::io::DuplexStream>) -> JsonRpcRequest {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        match parse_frame(line.trim()) {
            Frame::Message(JsonRpcMessage::Request(r)) => r,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn correlates_out_of_order_responses() {
        let (up, mut reader, mut writer) = pipe_pair();
        let up = Arc::new(up);

        let a = tokio::spawn({
            let up = up.clone();
            async move { up.request("tools/list", None).await }
        });
        let first = read_request(&mut reader).await;
        let b = tokio::spawn({
            let up = up.clone();
            async move { up.request("prompts/list", None).await }
        });
        let second = read_request(&mut reader).await;

        for (req, tag) in [(&second, "second"), (&first, "first")] {
            let resp = JsonRpcResponse::ok(req.id.clone(), serde_json::json!({ "tag": tag }));
            let line = serde_json::to_string(&resp).unwrap();
            writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }

        let tag_of = |f: Frame| match f {
            Frame::Message(JsonRpcMessage::Response(r)) => r.result.unwrap()["tag"].clone(),
            other => panic!("unexpected {other:?}"),
        };
        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        let (ta, tb) = (tag_of(ra), tag_of(rb));
        let (ma, mb) = (first.method.as_str(), second.method.as_str());
        assert_eq!((ma, ta), ("tools/list", serde_json::json!("first")));
        assert_eq!((mb, tb), ("prompts/list", serde_json::json!("second")));
        assert_eq!(up.pending_len(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_goes_to_single_waiter() {
        let (up, mut reader, mut writer) = pipe_pair();
        let up = Arc::new(up);
        let call = tokio::spawn({
            let up = up.clone();
            async move { up.request("tools/list", None).await }
        });
        let _ = read_request(&mut reader).await;
        writer.write_all(b"{\"id\":1,\"result\":{}}garbage\n").await.unwrap();

        let frame = call.await.unwrap().unwrap();
        assert!(matches!(frame, Frame::Malformed(_)));
    }

    #[tokio::test]
    async fn upstream_eof_fails_waiters_and_later_requests() {
        let (up, mut reader, writer) = pipe_pair();
        let up = Arc::new(up);
        let call = tokio::spawn({
            let up = up.clone();
            async move { up.request("tools/list", None).await }
        });
        let _ = read_request(&mut reader).await;
        drop(writer);

        let err = call.await.unwrap().expect_err("closed");
        assert!(matches!(err, TransportError::Closed));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !up.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            up.request("tools/list", None).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn forwards_notifications_and_rejects_upstream_requests() {
        let (ours_in, mut theirs_out) = tokio::io::duplex(4096);
        let (theirs_in, ours_out) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::channel(4);
        let _up = PipeUpstream::spawn(
            LineSource::new(BufReader::new(ours_in)),
            LineSink::new(ours_out),
            Some(tx),
        );

        theirs_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"level\":\"info\"}}\n")
            .await
            .unwrap();
        theirs_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"s1\",\"method\":\"sampling/createMessage\"}\n")
            .await
            .unwrap();

        let note = rx.recv().await.expect("notification");
        assert_eq!(note.method, "notifications/message");

        let mut reader = BufReader::new(theirs_in);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let Frame::Message(JsonRpcMessage::Response(resp)) = parse_frame(line.trim()) else {
            panic!("expected response");
        };
        assert_eq!(resp.id, JsonRpcId::String("s1".to_string()));
        assert_eq!(resp.error.map(|e| e.code), Some(METHOD_NOT_FOUND));
    }
}
