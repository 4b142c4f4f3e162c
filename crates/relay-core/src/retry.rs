use std::time::Duration;

use relay_mcp::{Frame, JsonRpcMessage, JsonRpcResponse, METHOD_NOT_FOUND, UpstreamChannel};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::RelayError;
use crate::gate::DenyList;
use crate::recovery::recover_message;

/// One relay invocation in flight. Never persisted.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub method: String,
    pub params: Option<Value>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub backoff: Duration,
}

impl PendingCall {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Resolves once `cancel` flips to `true` (or its sender is gone).
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

/// One request/answer exchange, classified. Recovery is applied to a malformed
/// answer; nothing is retried here.
pub(crate) async fn exchange(
    channel: &dyn UpstreamChannel,
    method: &str,
    params: Option<Value>,
    timeout: Option<Duration>,
) -> Result<Value, RelayError> {
    let answer = channel.request(method, params);
    let answer = match timeout {
        Some(t) => match tokio::time::timeout(t, answer).await {
            Ok(r) => r,
            Err(_) => {
                return Err(RelayError::Timeout {
                    timeout: t,
                    attempts: 1,
                });
            }
        },
        None => answer.await,
    };

    let frame = answer.map_err(|e| RelayError::TransportFailure {
        message: e.to_string(),
        attempts: 1,
    })?;

    let resp = match frame {
        Frame::Message(JsonRpcMessage::Response(resp)) => resp,
        Frame::Message(other) => {
            return Err(RelayError::TransportFailure {
                message: format!(
                    "expected a response, got {}",
                    other.method().unwrap_or("a message")
                ),
                attempts: 1,
            });
        }
        Frame::Malformed(m) => match recover_message(&m) {
            Some(JsonRpcMessage::Response(resp)) => {
                debug!(method, "using recovered upstream response");
                resp
            }
            _ => return Err(RelayError::parse(&m)),
        },
    };

    classify(method, resp)
}

fn classify(method: &str, resp: JsonRpcResponse) -> Result<Value, RelayError> {
    match resp.error {
        Some(err) if err.code == METHOD_NOT_FOUND => Err(RelayError::unsupported(method)),
        Some(err) => Err(RelayError::UpstreamRejected {
            code: err.code,
            message: err.message,
            data: err.data,
            attempts: 1,
        }),
        None => Ok(resp.result.unwrap_or(Value::Null)),
    }
}

fn with_attempts(err: RelayError, n: u32) -> RelayError {
    match err {
        RelayError::UpstreamRejected {
            code,
            message,
            data,
            ..
        } => RelayError::UpstreamRejected {
            code,
            message,
            data,
            attempts: n,
        },
        RelayError::TransportFailure { message, .. } => RelayError::TransportFailure {
            message,
            attempts: n,
        },
        RelayError::Timeout { timeout, .. } => RelayError::Timeout {
            timeout,
            attempts: n,
        },
        other => other,
    }
}

/// Bounded retry around [`exchange`].
///
/// "Method not found" lands the method on the deny-list and ends the call;
/// unrecoverable parse failures end it too. Everything else is retried up to
/// `max_retries` times with linearly growing backoff.
pub struct RetryExecutor<'a> {
    channel: &'a dyn UpstreamChannel,
    deny: &'a DenyList,
    config: &'a SessionConfig,
    cancel: watch::Receiver<bool>,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(
        channel: &'a dyn UpstreamChannel,
        deny: &'a DenyList,
        config: &'a SessionConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            channel,
            deny,
            config,
            cancel,
        }
    }

    pub async fn execute(&mut self, call: &mut PendingCall) -> Result<Value, RelayError> {
        loop {
            let attempt = call.attempts;
            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(RelayError::Cancelled),
                r = exchange(
                    self.channel,
                    &call.method,
                    call.params.clone(),
                    self.config.request_timeout,
                ) => r,
            };
            call.attempts += 1;

            let err = match outcome {
                Ok(v) => {
                    if attempt > 0 {
                        info!(
                            method = %call.method,
                            attempts = call.attempts,
                            "upstream call succeeded after retry"
                        );
                    }
                    return Ok(v);
                }
                Err(e) => e,
            };

            if let RelayError::MethodUnsupported { .. } = err {
                if self.deny.insert(&call.method) {
                    info!(
                        method = %call.method,
                        "upstream does not support method; denying for this session"
                    );
                }
                return Err(err);
            }
            if err.is_permanent() {
                debug!(method = %call.method, error = %err, "permanent failure");
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                warn!(
                    method = %call.method,
                    attempts = call.attempts,
                    error = %err,
                    "upstream call failed"
                );
                return Err(with_attempts(err, call.attempts));
            }

            let delay = self.config.backoff_for(attempt);
            warn!(
                method = %call.method,
                attempt = call.attempts,
                max_retries = self.config.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "upstream call failed; retrying"
            );
            call.backoff += delay;
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
