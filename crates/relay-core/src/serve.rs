use std::sync::Arc;

use relay_mcp::{
    Frame, FrameSink, FrameSource, INTERNAL_ERROR, JsonRpcError, JsonRpcId, JsonRpcMessage,
    JsonRpcNotification, JsonRpcResponse, TransportError,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::RelayError;
use crate::recovery::RecoveringSource;
use crate::relay::RelayCore;

const OUTBOUND_BUFFER: usize = 64;

/// Serves one downstream peer over a frame channel until it closes, then shuts
/// the relay session down.
///
/// Requests run concurrently, one task each; every outbound frame goes through
/// a single writer task. Upstream notifications, if a receiver is given, are
/// interleaved into the same outbound stream.
pub async fn serve<S, K>(
    core: Arc<RelayCore>,
    source: S,
    sink: K,
    upstream_notifications: Option<mpsc::Receiver<JsonRpcNotification>>,
) -> Result<(), TransportError>
where
    S: FrameSource,
    K: FrameSink + 'static,
{
    let mut source = RecoveringSource::new(source);
    let (tx, rx) = mpsc::channel::<JsonRpcMessage>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_loop(sink, rx));

    let forwarder = upstream_notifications.map(|mut notes| {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(note) = notes.recv().await {
                debug!(method = %note.method, "forwarding upstream notification");
                if tx.send(JsonRpcMessage::Notification(note)).await.is_err() {
                    break;
                }
            }
        })
    });

    let mut requests = JoinSet::new();
    let result = loop {
        let frame = match source.next_frame().await {
            Ok(Some(f)) => f,
            Ok(None) => {
                debug!("downstream closed");
                break Ok(());
            }
            Err(e) => {
                warn!(error = %e, "downstream read failed");
                break Err(e);
            }
        };
        while requests.try_join_next().is_some() {}

        match frame {
            Frame::Malformed(m) => {
                warn!(
                    offset = m.error.offset,
                    error = %m.error.message,
                    "unparseable downstream frame"
                );
                let resp =
                    JsonRpcResponse::err(JsonRpcId::Null, RelayError::parse(&m).to_jsonrpc());
                let _ = tx.send(JsonRpcMessage::Response(resp)).await;
            }
            Frame::Message(JsonRpcMessage::Request(req)) => {
                let core = core.clone();
                let tx = tx.clone();
                requests.spawn(async move {
                    let id = req.id.clone();
                    let method = req.method.clone();
                    let handler = tokio::spawn(async move {
                        core.handle_message(JsonRpcMessage::Request(req)).await
                    });
                    let resp = match handler.await {
                        Ok(resp) => resp,
                        Err(e) => {
                            error!(method = %method, error = %e, "request handler failed");
                            Some(internal_error(id))
                        }
                    };
                    if let Some(resp) = resp {
                        let _ = tx.send(JsonRpcMessage::Response(resp)).await;
                    }
                });
            }
            // Notifications are handled in arrival order.
            Frame::Message(other) => {
                if let Some(resp) = core.handle_message(other).await {
                    let _ = tx.send(JsonRpcMessage::Response(resp)).await;
                }
            }
        }
    };

    // In-flight calls have nobody left to answer them.
    core.shutdown().await;
    while requests.join_next().await.is_some() {}
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(tx);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "closing downstream sink failed"),
        Err(e) => warn!(error = %e, "downstream writer task failed"),
    }
    result
}

async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut rx: mpsc::Receiver<JsonRpcMessage>,
) -> Result<(), TransportError> {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send_frame(&msg).await {
            warn!(error = %e, "write to downstream failed");
            break;
        }
    }
    sink.close().await
}

fn internal_error(id: JsonRpcId) -> JsonRpcResponse {
    JsonRpcResponse::err(
        id,
        JsonRpcError {
            code: INTERNAL_ERROR,
            message: "internal error".to_string(),
            data: None,
        },
    )
}
