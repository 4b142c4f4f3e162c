use std::sync::{Arc, OnceLock};

use relay_mcp::{
    CallToolResult, INTERNAL_ERROR, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, UpstreamChannel,
};
use serde_json::Value;
use tokio::sync::{OnceCell, RwLock, RwLockReadGuard, watch};
use tracing::{Instrument, debug, error, info, warn};

use crate::capability::CapabilitySet;
use crate::config::SessionConfig;
use crate::dispatch::{DispatchTable, LocalRoute, Route};
use crate::error::RelayError;
use crate::gate::{DenyList, allow};
use crate::retry::{PendingCall, RetryExecutor, cancelled, exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// What the handshake established. Immutable once set.
#[derive(Debug)]
struct Session {
    capabilities: CapabilitySet,
    dispatch: DispatchTable,
    init_result: Value,
}

/// One relay session bound to one upstream channel.
///
/// Owns the session lifecycle, the capability set and the deny-list. Nothing
/// except the handshake reaches the upstream before the session is `Ready`.
pub struct RelayCore {
    upstream: Arc<dyn UpstreamChannel>,
    config: SessionConfig,
    deny: DenyList,
    state: watch::Sender<SessionState>,
    handshake: OnceCell<Result<(), RelayError>>,
    session: OnceLock<Session>,
    cancel: watch::Sender<bool>,
    /// Calls hold a read guard; shutdown takes the write side to wait them out.
    in_flight: RwLock<()>,
}

impl RelayCore {
    pub fn new(upstream: Arc<dyn UpstreamChannel>, config: SessionConfig) -> Self {
        Self {
            upstream,
            config,
            deny: DenyList::new(),
            state: watch::channel(SessionState::Uninitialized).0,
            handshake: OnceCell::new(),
            session: OnceLock::new(),
            cancel: watch::channel(false).0,
            in_flight: RwLock::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn deny_list(&self) -> &DenyList {
        &self.deny
    }

    /// Discovered capabilities, once the handshake succeeded.
    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.session.get().map(|s| &s.capabilities)
    }

    /// The upstream's `initialize` result, as mirrored to downstream clients.
    pub fn handshake_result(&self) -> Option<&Value> {
        self.session.get().map(|s| &s.init_result)
    }

    /// Runs the `initialize` exchange at most once per session.
    ///
    /// Concurrent and later callers observe the same outcome. Failure is fatal:
    /// the session moves to `Closed` and the upstream channel is torn down.
    pub async fn handshake(&self) -> Result<CapabilitySet, RelayError> {
        self.handshake
            .get_or_init(|| self.run_handshake())
            .await
            .clone()?;
        self.session
            .get()
            .map(|s| s.capabilities.clone())
            .ok_or(RelayError::NotReady)
    }

    async fn run_handshake(&self) -> Result<(), RelayError> {
        let began = self.state.send_if_modified(|s| {
            if *s == SessionState::Uninitialized {
                *s = SessionState::Handshaking;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(RelayError::NotReady);
        }
        info!("handshake started");

        let mut cancel = self.cancel.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(RelayError::Cancelled),
            r = self.exchange_handshake() => r,
        };

        match outcome {
            Ok(session) => {
                let supported: Vec<_> = session
                    .capabilities
                    .supported()
                    .into_iter()
                    .map(|c| c.path())
                    .collect();
                let _ = self.session.set(session);
                let ready = self.state.send_if_modified(|s| {
                    if *s == SessionState::Handshaking {
                        *s = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if ready {
                    info!(capabilities = ?supported, "relay ready");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "handshake failed");
                let failed = self.state.send_if_modified(|s| {
                    if *s == SessionState::Handshaking {
                        *s = SessionState::Closed;
                        true
                    } else {
                        false
                    }
                });
                if failed && let Err(close_err) = self.upstream.close().await {
                    warn!(error = %close_err, "closing upstream after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn exchange_handshake(&self) -> Result<Session, RelayError> {
        let params =
            InitializeParams::new_default(&self.config.client_name, &self.config.client_version);
        let params = serde_json::to_value(params).map_err(|e| RelayError::TransportFailure {
            message: format!("encode initialize params: {e}"),
            attempts: 0,
        })?;

        let init_result = exchange(
            self.upstream.as_ref(),
            "initialize",
            Some(params),
            self.config.request_timeout,
        )
        .await?;

        match serde_json::from_value::<InitializeResult>(init_result.clone()) {
            Ok(init) => info!(
                server = %init.server_info.name,
                server_version = %init.server_info.version,
                protocol_version = %init.protocol_version,
                "upstream identified"
            ),
            Err(e) => warn!(error = %e, "upstream initialize result does not match the schema"),
        }

        self.upstream
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| RelayError::TransportFailure {
                message: e.to_string(),
                attempts: 1,
            })?;

        let capabilities = CapabilitySet::discover(&init_result);
        let dispatch =
            DispatchTable::from_capabilities(&capabilities, self.config.bypass_capability_check);
        Ok(Session {
            capabilities,
            dispatch,
            init_result,
        })
    }

    /// Waits out a running handshake, then admits the caller only if the
    /// session is `Ready`. The returned guard keeps shutdown waiting.
    async fn enter(&self) -> Result<(&Session, RwLockReadGuard<'_, ()>), RelayError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s != SessionState::Handshaking)
            .await
            .map(|s| *s)
            .map_err(|_| RelayError::Cancelled)?;
        not_ready(state)?;

        let guard = self.in_flight.read().await;
        not_ready(self.state())?;
        let session = self.session.get().ok_or(RelayError::NotReady)?;
        Ok((session, guard))
    }

    /// Relays one call upstream: gate first, then the retry executor.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RelayError> {
        let res = {
            let (session, _guard) = self.enter().await?;
            if !allow(
                method,
                &self.deny,
                &session.capabilities,
                self.config.bypass_capability_check,
            ) {
                debug!(method, "rejected without contacting upstream");
                return Err(RelayError::unsupported(method));
            }

            let mut call = PendingCall::new(method, params);
            RetryExecutor::new(
                self.upstream.as_ref(),
                &self.deny,
                &self.config,
                self.cancel.subscribe(),
            )
            .execute(&mut call)
            .instrument(tracing::info_span!("relay_call", method = %method))
            .await
        };

        if let Err(RelayError::TransportFailure { .. }) = &res
            && !self.upstream.is_open()
        {
            warn!(method, "upstream channel lost; closing session");
            self.shutdown().await;
        }
        res
    }

    /// Forwards a notification once. No retry.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RelayError> {
        let (session, _guard) = self.enter().await?;
        if !allow(
            method,
            &self.deny,
            &session.capabilities,
            self.config.bypass_capability_check,
        ) {
            return Err(RelayError::unsupported(method));
        }

        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(RelayError::Cancelled),
            r = self.upstream.notify(method, params) => r.map_err(|e| RelayError::TransportFailure {
                message: e.to_string(),
                attempts: 1,
            }),
        }
    }

    /// Downstream entry point. Requests always produce a response;
    /// notifications and stray responses never do.
    pub async fn handle_message(&self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match msg {
            JsonRpcMessage::Request(req) => Some(self.handle_request(req).await),
            JsonRpcMessage::Notification(note) => {
                self.handle_notification(note).await;
                None
            }
            JsonRpcMessage::Response(resp) => {
                debug!(id = %resp.id, "ignoring response from downstream");
                None
            }
        }
    }

    async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = req;
        let Some(session) = self.session.get() else {
            return JsonRpcResponse::err(id, RelayError::NotReady.to_jsonrpc());
        };

        let result = match session.dispatch.resolve(&method) {
            Route::Local(LocalRoute::Initialize) => Ok(session.init_result.clone()),
            Route::Local(LocalRoute::Ping | LocalRoute::Initialized) => {
                Ok(Value::Object(Default::default()))
            }
            Route::Unsupported => {
                debug!(method = %method, "family not announced by upstream");
                Err(RelayError::unsupported(method.as_str()))
            }
            Route::Forward | Route::Passthrough => self.call(&method, params).await,
        };

        match result {
            Ok(v) => JsonRpcResponse::ok(id, v),
            Err(e) if method == "tools/call" && is_tool_level(&e) => tool_error(id, &e),
            Err(e) => JsonRpcResponse::err(id, e.to_jsonrpc()),
        }
    }

    async fn handle_notification(&self, note: JsonRpcNotification) {
        let Some(session) = self.session.get() else {
            debug!(method = %note.method, "dropping notification before handshake");
            return;
        };
        match session.dispatch.resolve(&note.method) {
            Route::Local(_) => debug!(method = %note.method, "handled locally"),
            Route::Unsupported => {
                debug!(method = %note.method, "dropping unsupported notification")
            }
            Route::Forward | Route::Passthrough => {
                if let Err(e) = self.notify(&note.method, note.params).await {
                    warn!(method = %note.method, error = %e, "forwarding notification failed");
                }
            }
        }
    }

    /// Cancels in-flight work, waits for it to drain, closes the upstream.
    /// Idempotent; concurrent callers return once the session is `Closed`.
    pub async fn shutdown(&self) {
        let began = self.state.send_if_modified(|s| match s {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *s = SessionState::Closing;
                true
            }
        });
        if !began {
            self.closed().await;
            return;
        }

        info!("relay shutting down");
        self.cancel.send_replace(true);
        let _drained = self.in_flight.write().await;
        if let Err(e) = self.upstream.close().await {
            warn!(error = %e, "closing upstream failed");
        }
        self.state.send_replace(SessionState::Closed);
        info!("relay closed");
    }

    /// Resolves once the session reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

fn not_ready(state: SessionState) -> Result<(), RelayError> {
    match state {
        SessionState::Ready => Ok(()),
        SessionState::Closing => Err(RelayError::Cancelled),
        SessionState::Uninitialized | SessionState::Handshaking | SessionState::Closed => {
            Err(RelayError::NotReady)
        }
    }
}

/// Failures a tool caller should see as a failed tool run rather than a
/// protocol error.
fn is_tool_level(e: &RelayError) -> bool {
    matches!(
        e,
        RelayError::UpstreamRejected { .. }
            | RelayError::TransportFailure { .. }
            | RelayError::Timeout { .. }
    )
}

fn tool_error(id: relay_mcp::JsonRpcId, e: &RelayError) -> JsonRpcResponse {
    match serde_json::to_value(CallToolResult::error_text(e.to_string())) {
        Ok(v) => JsonRpcResponse::ok(id, v),
        Err(encode) => JsonRpcResponse::err(
            id,
            JsonRpcError {
                code: INTERNAL_ERROR,
                message: format!("encode tool error: {encode}"),
                data: None,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_admits_calls() {
        assert_eq!(not_ready(SessionState::Ready), Ok(()));
        assert_eq!(
            not_ready(SessionState::Uninitialized),
            Err(RelayError::NotReady)
        );
        assert_eq!(not_ready(SessionState::Closed), Err(RelayError::NotReady));
        assert_eq!(not_ready(SessionState::Closing), Err(RelayError::Cancelled));
    }

    #[test]
    fn tool_errors_become_error_results() {
        let e = RelayError::Timeout {
            timeout: std::time::Duration::from_secs(1),
            attempts: 2,
        };
        assert!(is_tool_level(&e));
        assert!(!is_tool_level(&RelayError::unsupported("tools/call")));

        let resp = tool_error(relay_mcp::JsonRpcId::Number(7), &e);
        let result = resp.result.expect("result");
        assert_eq!(result["isError"], true);
        assert!(
            result["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("did not answer")
        );
    }
}
