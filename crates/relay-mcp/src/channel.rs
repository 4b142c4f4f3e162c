use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::JsonRpcMessage;

/// How a frame failed to parse, taken from the parser's own position data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorCategory {
    /// Invalid JSON syntax, including trailing content after a complete value.
    Syntax,
    /// Input ended in the middle of a value.
    Eof,
    /// Valid JSON that is not a JSON-RPC message.
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// Byte offset into the raw frame where parsing stopped.
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    pub category: FrameErrorCategory,
    pub message: String,
}

impl FrameError {
    pub fn from_serde(raw: &str, err: &serde_json::Error) -> Self {
        let category = match err.classify() {
            serde_json::error::Category::Eof => FrameErrorCategory::Eof,
            serde_json::error::Category::Data => FrameErrorCategory::Data,
            serde_json::error::Category::Syntax | serde_json::error::Category::Io => {
                FrameErrorCategory::Syntax
            }
        };
        Self {
            offset: byte_offset(raw, err.line(), err.column()),
            line: err.line(),
            column: err.column(),
            category,
            message: err.to_string(),
        }
    }

    fn not_a_message(err: &serde_json::Error) -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 0,
            category: FrameErrorCategory::Data,
            message: err.to_string(),
        }
    }
}

/// Converts serde_json's 1-based line and column into a byte offset.
///
/// serde_json reports the column of the offending byte, so the offset points at
/// the first byte the parser refused. Clamped to the input length.
fn byte_offset(raw: &str, line: usize, column: usize) -> usize {
    let mut start_of_line = 0;
    if line > 1 {
        let mut seen = 1;
        for (i, b) in raw.bytes().enumerate() {
            if b == b'\n' {
                seen += 1;
                if seen == line {
                    start_of_line = i + 1;
                    break;
                }
            }
        }
    }
    (start_of_line + column.saturating_sub(1)).min(raw.len())
}

/// A frame that could not be parsed into a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub raw: String,
    pub error: FrameError,
}

impl MalformedFrame {
    /// Up to `max` bytes of raw content around the error offset, for logs and
    /// error payloads.
    pub fn excerpt(&self, max: usize) -> String {
        let mut start = self.error.offset.saturating_sub(max / 2);
        while !self.raw.is_char_boundary(start) {
            start -= 1;
        }
        let mut end = (start + max).min(self.raw.len());
        while !self.raw.is_char_boundary(end) {
            end -= 1;
        }
        self.raw[start..end].to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(JsonRpcMessage),
    Malformed(MalformedFrame),
}

/// Parses one raw frame. Never fails: unparseable input becomes
/// [`Frame::Malformed`] with the parser's position data attached.
pub fn parse_frame(raw: &str) -> Frame {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(v) => v,
        Err(e) => {
            return Frame::Malformed(MalformedFrame {
                raw: raw.to_string(),
                error: FrameError::from_serde(raw, &e),
            });
        }
    };
    match JsonRpcMessage::from_value(value) {
        Ok(msg) => Frame::Message(msg),
        Err(e) => Frame::Malformed(MalformedFrame {
            raw: raw.to_string(),
            error: FrameError::not_a_message(&e),
        }),
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel closed")]
    Closed,
}

/// Inbound half of a duplex frame channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` once the peer closed the stream.
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Outbound half of a duplex frame channel.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, msg: &JsonRpcMessage) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Request-level view of the upstream peer.
///
/// Implementations assign request ids and correlate answers; the returned frame
/// is the upstream's answer to this request, possibly malformed.
#[async_trait]
pub trait UpstreamChannel: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Frame, TransportError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// `false` once the channel can no longer carry requests.
    fn is_open(&self) -> bool {
        true
    }
}
