use std::time::Duration;

use relay_mcp::{JsonRpcError, METHOD_NOT_FOUND, MalformedFrame, PARSE_ERROR};
use serde_json::Value;
use thiserror::Error;

pub const TRANSPORT_FAILURE: i64 = -32000;
pub const TIMEOUT: i64 = -32001;
pub const NOT_READY: i64 = -32002;
pub const CANCELLED: i64 = -32800;

/// Bytes of raw frame content kept in parse errors.
const CONTEXT_BYTES: usize = 120;

/// Terminal outcome of a relayed operation.
///
/// Every variant maps to exactly one JSON-RPC error object via
/// [`RelayError::to_jsonrpc`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("parse error at byte {offset}: {detail}")]
    Parse {
        offset: usize,
        context: String,
        detail: String,
    },
    #[error("method not found: {method}")]
    MethodUnsupported { method: String },
    #[error("upstream rejected call ({code}): {message}")]
    UpstreamRejected {
        code: i64,
        message: String,
        data: Option<Value>,
        attempts: u32,
    },
    #[error("transport failure after {attempts} attempt(s): {message}")]
    TransportFailure { message: String, attempts: u32 },
    #[error("upstream did not answer within {timeout:?} ({attempts} attempt(s))")]
    Timeout { timeout: Duration, attempts: u32 },
    #[error("session not ready")]
    NotReady,
    #[error("operation cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn parse(frame: &MalformedFrame) -> Self {
        RelayError::Parse {
            offset: frame.error.offset,
            context: frame.excerpt(CONTEXT_BYTES),
            detail: frame.error.message.clone(),
        }
    }

    pub fn unsupported(method: impl Into<String>) -> Self {
        RelayError::MethodUnsupported {
            method: method.into(),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            RelayError::Parse { .. } => PARSE_ERROR,
            RelayError::MethodUnsupported { .. } => METHOD_NOT_FOUND,
            RelayError::UpstreamRejected { code, .. } => *code,
            RelayError::TransportFailure { .. } => TRANSPORT_FAILURE,
            RelayError::Timeout { .. } => TIMEOUT,
            RelayError::NotReady => NOT_READY,
            RelayError::Cancelled => CANCELLED,
        }
    }

    /// Retrying cannot change the outcome of these.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RelayError::Parse { .. }
                | RelayError::MethodUnsupported { .. }
                | RelayError::NotReady
                | RelayError::Cancelled
        )
    }

    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            RelayError::Parse {
                offset,
                context,
                detail,
            } => JsonRpcError {
                code: PARSE_ERROR,
                message: format!("parse error at byte {offset}"),
                data: Some(serde_json::json!({
                    "offset": offset,
                    "context": context,
                    "detail": detail,
                })),
            },
            RelayError::MethodUnsupported { method } => JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: "method not found".to_string(),
                data: Some(serde_json::json!({ "method": method })),
            },
            RelayError::UpstreamRejected {
                code,
                message,
                data,
                ..
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            RelayError::TransportFailure { message, attempts } => JsonRpcError {
                code: TRANSPORT_FAILURE,
                message: "upstream transport failure".to_string(),
                data: Some(serde_json::json!({ "detail": message, "attempts": attempts })),
            },
            RelayError::Timeout { timeout, attempts } => JsonRpcError {
                code: TIMEOUT,
                message: "upstream timeout".to_string(),
                data: Some(serde_json::json!({
                    "timeoutMs": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "attempts": attempts,
                })),
            },
            RelayError::NotReady => JsonRpcError {
                code: NOT_READY,
                message: "not initialized".to_string(),
                data: None,
            },
            RelayError::Cancelled => JsonRpcError {
                code: CANCELLED,
                message: "request cancelled".to_string(),
                data: None,
            },
        }
    }
}
