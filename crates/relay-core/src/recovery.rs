//! Salvaging a usable message out of a malformed frame.
//!
//! Transports occasionally deliver two messages glued together, trailing
//! garbage after a complete message, or a message wrapped in a string. The
//! first complete object is kept; everything else is logged and dropped.

use async_trait::async_trait;
use relay_mcp::{
    Frame, FrameError, FrameSource, JsonRpcMessage, MalformedFrame, TransportError,
};
use serde_json::Value;
use tracing::{debug, warn};

const LOG_EXCERPT_BYTES: usize = 80;

struct Salvage {
    value: Value,
    /// Byte range of `content` the value was parsed from.
    start: usize,
    end: usize,
}

/// Attempts to recover one JSON object from a frame that failed to parse.
///
/// Deterministic and side-effect free apart from logging. Input that already
/// parses as an object is returned unchanged.
pub fn recover(raw: &str) -> Option<Value> {
    let err = match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => return Some(v),
        // A message that arrived wrapped in a JSON string.
        Ok(Value::String(inner)) => {
            return leading_region(&inner).map(|s| log_salvage(&inner, s, "string-wrapped"));
        }
        Ok(_) => return None,
        Err(e) => e,
    };

    if !starts_structured(raw) {
        return leading_region(raw).map(|s| log_salvage(raw, s, "leading-region"));
    }

    prefix_before_error(raw, &err).map(|s| log_salvage(raw, s, "error-prefix"))
}

/// [`recover`] followed by JSON-RPC classification.
pub fn recover_message(frame: &MalformedFrame) -> Option<JsonRpcMessage> {
    let value = recover(&frame.raw)?;
    match JsonRpcMessage::from_value(value) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, "recovered value is not a json-rpc message");
            None
        }
    }
}

fn starts_structured(s: &str) -> bool {
    s.trim_start().starts_with(['{', '['])
}

/// Strategy 1: content that is not structured as a whole, but has a complete
/// object at its start once leading noise (control bytes, BOM, replacement
/// characters from undecodable bytes) is skipped.
fn leading_region(content: &str) -> Option<Salvage> {
    let body = content.trim_start_matches(|c: char| {
        c.is_whitespace() || c.is_control() || c == '\u{feff}' || c == '\u{fffd}'
    });
    if !body.starts_with('{') {
        return None;
    }
    let start = content.len() - body.len();
    let end = balanced_end(body)?;
    let value = serde_json::from_str::<Value>(&body[..end]).ok()?;
    value.is_object().then_some(Salvage {
        value,
        start,
        end: start + end,
    })
}

/// Strategy 2: the parser stopped at byte `p`; if everything before `p` is a
/// balanced value on its own, that value is the message.
fn prefix_before_error(raw: &str, err: &serde_json::Error) -> Option<Salvage> {
    let p = FrameError::from_serde(raw, err).offset;
    let prefix = raw.get(..p)?;
    let body = prefix.trim();
    if body.is_empty() || balanced_end(body) != Some(body.len()) {
        return None;
    }
    let value = serde_json::from_str::<Value>(body).ok()?;
    let start = prefix.len() - prefix.trim_start().len();
    value.is_object().then_some(Salvage {
        value,
        start,
        end: start + body.len(),
    })
}

/// Length of the balanced `{...}` / `[...]` value at the start of `s`.
///
/// Delimiters inside string literals are ignored and backslash escapes are
/// honored. `None` if `s` does not start with an opener or never closes.
fn balanced_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if !matches!(bytes.first(), Some(b'{' | b'[')) {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn log_salvage(content: &str, s: Salvage, strategy: &'static str) -> Value {
    let leading = s.start;
    let trailing = content.len() - s.end;
    if leading > 0 || trailing > 0 {
        warn!(
            strategy,
            leading_bytes = leading,
            trailing_bytes = trailing,
            discarded = %excerpt(&content[s.end..]),
            "recovered frame; discarding surrounding content"
        );
    }
    s.value
}

fn excerpt(s: &str) -> &str {
    let mut end = s.len().min(LOG_EXCERPT_BYTES);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Frame source decorator that applies [`recover_message`] to malformed frames
/// before handing them on. Frames that cannot be salvaged pass through still
/// marked malformed.
pub struct RecoveringSource<S> {
    inner: S,
}

impl<S> RecoveringSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S> FrameSource for RecoveringSource<S>
where
    S: FrameSource,
{
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        let frame = self.inner.next_frame().await?;
        Ok(frame.map(|f| match f {
            Frame::Malformed(m) => match recover_message(&m) {
                Some(msg) => Frame::Message(msg),
                None => Frame::Malformed(m),
            },
            other => other,
        }))
    }
}
