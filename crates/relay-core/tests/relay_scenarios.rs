use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{RelayCore, RelayError, SessionConfig, SessionState, serve};
use relay_mcp::{
    Frame, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, LineSink, LineSource, TransportError, UpstreamChannel, parse_frame,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

enum Reply {
    Result(Value),
    Error(i64),
    Raw(&'static str),
    Fail,
}

/// Upstream double that records every request it receives.
struct Spy {
    capabilities: Value,
    handshake_delay: Duration,
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<(String, Instant)>>,
    notifications: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl Spy {
    fn new(capabilities: Value) -> Self {
        Self {
            capabilities,
            handshake_delay: Duration::ZERO,
            script: Mutex::default(),
            requests: Mutex::default(),
            notifications: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    fn script(self, method: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .extend(replies);
        self
    }

    fn sends(&self, method: &str) -> Vec<Instant> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, at)| *at)
            .collect()
    }

    fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn respond(result: Result<Value, JsonRpcError>) -> Frame {
    let resp = match result {
        Ok(v) => JsonRpcResponse::ok(JsonRpcId::Number(1), v),
        Err(e) => JsonRpcResponse::err(JsonRpcId::Number(1), e),
    };
    Frame::Message(JsonRpcMessage::Response(resp))
}

#[async_trait]
impl UpstreamChannel for Spy {
    async fn request(&self, method: &str, _params: Option<Value>) -> Result<Frame, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), Instant::now()));
        if method == "initialize" && !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Reply::Result(v)) => Ok(respond(Ok(v))),
            Some(Reply::Error(code)) => Ok(respond(Err(JsonRpcError {
                code,
                message: format!("error {code}"),
                data: None,
            }))),
            Some(Reply::Raw(raw)) => Ok(parse_frame(raw)),
            Some(Reply::Fail) => Err(TransportError::Http("503 service unavailable".to_string())),
            None if method == "initialize" => Ok(respond(Ok(json!({
                "protocolVersion": "2025-06-18",
                "capabilities": self.capabilities,
                "serverInfo": { "name": "spy", "version": "1.0.0" },
            })))),
            None => Ok(respond(Ok(json!({ "echo": method })))),
        }
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), TransportError> {
        self.notifications.lock().unwrap().push(method.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}

fn config(max_retries: u32) -> SessionConfig {
    SessionConfig {
        max_retries,
        backoff_unit: Duration::from_millis(500),
        request_timeout: Some(Duration::from_secs(10)),
        ..SessionConfig::default()
    }
}

async fn ready(spy: Spy, cfg: SessionConfig) -> (Arc<Spy>, Arc<RelayCore>) {
    let spy = Arc::new(spy);
    let core = Arc::new(RelayCore::new(spy.clone(), cfg));
    core.handshake().await.expect("handshake");
    (spy, core)
}

#[tokio::test]
async fn unannounced_family_is_rejected_without_upstream_io() {
    let (spy, core) = ready(Spy::new(json!({ "tools": true })), config(1)).await;

    let err = core.call("resources/list", None).await.unwrap_err();
    assert_eq!(err, RelayError::unsupported("resources/list"));
    assert_eq!(err.to_jsonrpc().code, -32601);
    assert_eq!(spy.methods(), vec!["initialize"]);
    assert_eq!(
        spy.notifications.lock().unwrap().as_slice(),
        ["notifications/initialized"]
    );
}

#[tokio::test]
async fn concatenated_answer_yields_the_first_message() {
    let spy = Spy::new(json!({ "tools": {} })).script(
        "tools/call",
        [Reply::Raw(r#"{"id":1,"result":{"data":true}}{"id":2,"method":"x"}"#)],
    );
    let (_spy, core) = ready(spy, config(1)).await;

    let result = core.call("tools/call", Some(json!({ "name": "t" }))).await;
    assert_eq!(result, Ok(json!({ "data": true })));
}

#[tokio::test]
async fn method_not_found_denies_later_calls_without_io() {
    let spy = Spy::new(json!({ "prompts": {} })).script("prompts/get", [Reply::Error(-32601)]);
    let (spy, core) = ready(spy, config(3)).await;

    let first = core.call("prompts/get", None).await;
    assert_eq!(first, Err(RelayError::unsupported("prompts/get")));
    let second = core.call("prompts/get", None).await;
    assert_eq!(second, Err(RelayError::unsupported("prompts/get")));

    assert_eq!(spy.sends("prompts/get").len(), 1);
    assert!(core.deny_list().contains("prompts/get"));
    // Other methods of the family are unaffected.
    assert!(core.call("prompts/list", None).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_with_growing_delay() {
    let spy = Spy::new(json!({ "tools": {} })).script(
        "tools/list",
        [Reply::Fail, Reply::Fail, Reply::Result(json!({ "tools": [] }))],
    );
    let (spy, core) = ready(spy, config(2)).await;

    let result = core.call("tools/list", None).await;
    assert_eq!(result, Ok(json!({ "tools": [] })));

    let sends = spy.sends("tools/list");
    assert_eq!(sends.len(), 3);
    assert_eq!(sends[1] - sends[0], Duration::from_millis(500));
    assert_eq!(sends[2] - sends[1], Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_attempted_exactly_n_plus_one_times() {
    let spy = Spy::new(json!({ "tools": {} })).script("tools/list", (0..10).map(|_| Reply::Fail));
    let (spy, core) = ready(spy, config(3)).await;

    let err = core.call("tools/list", None).await.unwrap_err();
    assert!(
        matches!(err, RelayError::TransportFailure { attempts: 4, .. }),
        "{err:?}"
    );
    assert_eq!(spy.sends("tools/list").len(), 4);
    assert_eq!(core.state(), SessionState::Ready);
}

#[tokio::test]
async fn bypass_skips_capability_and_deny_list_checks() {
    let spy = Spy::new(json!({})).script("resources/list", [Reply::Error(-32601)]);
    let cfg = SessionConfig {
        bypass_capability_check: true,
        ..config(0)
    };
    let (spy, core) = ready(spy, cfg).await;

    assert_eq!(
        core.call("resources/list", None).await,
        Err(RelayError::unsupported("resources/list"))
    );
    assert!(core.deny_list().contains("resources/list"));
    assert!(core.call("resources/list", None).await.is_ok());
    assert_eq!(spy.sends("resources/list").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_handshake() {
    let spy = Spy::new(json!({ "tools": {} })).with_handshake_delay(Duration::from_secs(1));
    let spy = Arc::new(spy);
    let core = RelayCore::new(spy.clone(), config(1));

    let (a, b, c) = tokio::join!(
        core.handshake(),
        core.handshake(),
        core.call("tools/list", None)
    );
    assert!(a.is_ok());
    assert_eq!(a, b);
    assert_eq!(c, Ok(json!({ "echo": "tools/list" })));
    assert_eq!(spy.sends("initialize").len(), 1);
}

#[tokio::test]
async fn calls_before_handshake_are_not_ready() {
    let spy = Arc::new(Spy::new(json!({ "tools": {} })));
    let core = RelayCore::new(spy.clone(), config(1));

    assert_eq!(core.call("tools/list", None).await, Err(RelayError::NotReady));
    assert_eq!(core.notify("notifications/progress", None).await, Err(RelayError::NotReady));
    assert!(spy.methods().is_empty());
}

#[tokio::test]
async fn failed_handshake_is_fatal() {
    let spy = Arc::new(Spy::new(json!({ "tools": {} })).script("initialize", [Reply::Fail]));
    let core = RelayCore::new(spy.clone(), config(3));

    let first = core.handshake().await.unwrap_err();
    assert!(matches!(first, RelayError::TransportFailure { .. }), "{first:?}");
    assert_eq!(core.state(), SessionState::Closed);
    assert!(spy.is_closed());

    // Not retried, and every later caller sees the same failure.
    assert_eq!(core.handshake().await.unwrap_err(), first);
    assert_eq!(spy.sends("initialize").len(), 1);
    assert_eq!(core.call("tools/list", None).await, Err(RelayError::NotReady));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_calls_waiting_in_backoff() {
    let spy = Spy::new(json!({ "tools": {} })).script("tools/list", (0..10).map(|_| Reply::Fail));
    let cfg = SessionConfig {
        backoff_unit: Duration::from_secs(60),
        ..config(5)
    };
    let (spy, core) = ready(spy, cfg).await;

    let pending = {
        let core = core.clone();
        tokio::spawn(async move { core.call("tools/list", None).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    core.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(60));

    assert_eq!(pending.await.unwrap(), Err(RelayError::Cancelled));
    assert_eq!(core.state(), SessionState::Closed);
    assert!(spy.is_closed());
    assert_eq!(core.call("tools/list", None).await, Err(RelayError::NotReady));

    // A second shutdown is a no-op.
    core.shutdown().await;
}

#[tokio::test]
async fn notifications_are_forwarded_once_and_gated() {
    let (spy, core) = ready(Spy::new(json!({ "tools": {} })), config(1)).await;

    assert_eq!(core.notify("notifications/progress", None).await, Ok(()));
    assert_eq!(
        core.notify("resources/updated", None).await,
        Err(RelayError::unsupported("resources/updated"))
    );
    assert_eq!(
        spy.notifications.lock().unwrap().as_slice(),
        ["notifications/initialized", "notifications/progress"]
    );
}

fn request(id: i64, method: &str, params: Option<Value>) -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest::new(JsonRpcId::Number(id), method, params))
}

#[tokio::test]
async fn downstream_messages_follow_the_dispatch_table() {
    let spy = Spy::new(json!({ "tools": {}, "logging": {} }))
        .script("tools/call", [Reply::Error(-32602)]);
    let (spy, core) = ready(spy, config(0)).await;

    let init = core
        .handle_message(request(1, "initialize", Some(json!({}))))
        .await
        .expect("response");
    assert_eq!(init.result.as_ref().unwrap()["serverInfo"]["name"], "spy");
    assert_eq!(init.result.as_ref().unwrap()["capabilities"]["logging"], json!({}));

    let ping = core.handle_message(request(2, "ping", None)).await.unwrap();
    assert_eq!(ping.result, Some(json!({})));

    let unsupported = core
        .handle_message(request(3, "resources/read", None))
        .await
        .unwrap();
    assert_eq!(unsupported.error.unwrap().code, -32601);

    let tool = core
        .handle_message(request(4, "tools/call", Some(json!({ "name": "t" }))))
        .await
        .unwrap();
    assert!(tool.error.is_none());
    assert_eq!(tool.result.unwrap()["isError"], true);

    let swallowed = core
        .handle_message(JsonRpcMessage::Notification(JsonRpcNotification::new(
            "notifications/initialized",
            None,
        )))
        .await;
    assert!(swallowed.is_none());

    let methods = spy.methods();
    assert_eq!(methods, vec!["initialize", "tools/call"]);
    assert_eq!(spy.notifications.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn serve_relays_a_line_delimited_session() {
    let (_spy, core) = ready(Spy::new(json!({ "tools": {} })), config(0)).await;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_r, server_w) = tokio::io::split(server);
    let (client_r, mut client_w) = tokio::io::split(client);
    let (note_tx, note_rx) = mpsc::channel(4);

    let served = tokio::spawn(serve(
        core.clone(),
        LineSource::new(BufReader::new(server_r)),
        LineSink::new(server_w),
        Some(note_rx),
    ));

    client_w
        .write_all(
            concat!(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#,
                "\n",
                "{not json\n",
                r#"{"jsonrpc":"2.0","id":3,"method":"ping"}trailing"#,
                "\n",
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    note_tx
        .send(JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        ))
        .await
        .unwrap();

    let mut lines = BufReader::new(client_r).lines();
    let mut responses = HashMap::new();
    let mut malformed = 0;
    let mut notifications = Vec::new();
    while responses.len() < 3 || malformed < 1 || notifications.is_empty() {
        let line = lines.next_line().await.unwrap().expect("line");
        match parse_frame(&line) {
            Frame::Message(JsonRpcMessage::Response(r)) if r.id == JsonRpcId::Null => {
                assert_eq!(r.error.unwrap().code, -32700);
                malformed += 1;
            }
            Frame::Message(JsonRpcMessage::Response(r)) => {
                responses.insert(r.id.to_string(), r);
            }
            Frame::Message(JsonRpcMessage::Notification(n)) => notifications.push(n.method),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    assert_eq!(responses["1"].result, Some(json!({ "echo": "tools/list" })));
    assert_eq!(responses["2"].error.as_ref().unwrap().code, -32601);
    assert_eq!(responses["3"].result, Some(json!({})));
    assert_eq!(notifications, vec!["notifications/tools/list_changed"]);

    client_w.shutdown().await.unwrap();
    drop(client_w);
    served.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn downstream_close_cancels_calls_in_backoff() {
    let spy = Spy::new(json!({ "tools": {} })).script("tools/list", (0..6).map(|_| Reply::Fail));
    let cfg = SessionConfig {
        backoff_unit: Duration::from_secs(60),
        ..config(5)
    };
    let (spy, core) = ready(spy, cfg).await;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_r, server_w) = tokio::io::split(server);
    let (_client_r, mut client_w) = tokio::io::split(client);
    let served = tokio::spawn(serve(
        core.clone(),
        LineSource::new(BufReader::new(server_r)),
        LineSink::new(server_w),
        None,
    ));

    client_w
        .write_all(concat!(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#, "\n").as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(spy.sends("tools/list").len(), 1);

    let closed_at = Instant::now();
    client_w.shutdown().await.unwrap();
    drop(client_w);
    served.await.unwrap().unwrap();

    assert!(closed_at.elapsed() < Duration::from_secs(60));
    assert_eq!(spy.sends("tools/list").len(), 1);
    assert_eq!(core.state(), SessionState::Closed);
    assert!(spy.is_closed());
}
