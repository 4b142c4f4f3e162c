//! Model Context Protocol (MCP) wire plumbing used by the relay.
//!
//! This crate is scoped to what relaying needs:
//! - JSON-RPC message types and frame parsing that never fails outright
//!   (unparseable input becomes a malformed frame with position data)
//! - duplex frame channels: newline-delimited pipes, streamable HTTP and the
//!   older HTTP+SSE transport
//! - a request-level upstream abstraction with response correlation

mod channel;
mod http_client;
mod jsonrpc;
mod pipe;
mod sse;
mod sse_client;
mod stdio;
mod types;

pub use channel::{
    Frame, FrameError, FrameErrorCategory, FrameSink, FrameSource, MalformedFrame,
    TransportError, UpstreamChannel, parse_frame,
};
pub use http_client::{HttpUpstream, HttpUpstreamOptions};
pub use jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, JsonRpcError, JsonRpcId,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
pub use pipe::PipeUpstream;
pub use sse::{SseEvent, decode_sse_events, message_payloads};
pub use sse_client::{SseMessageSource, SsePostSink, SseUpstreamOptions, connect_sse};
pub use stdio::{DEFAULT_MAX_LINE_LEN, LineSink, LineSource};
pub use types::{
    CallToolResult, ContentBlock, InitializeParams, InitializeResult, McpClientInfo, McpServerInfo,
};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-11-25";

/// Older protocol version still commonly used by clients.
pub const PROTOCOL_VERSION_2025_06_18: &str = "2025-06-18";
