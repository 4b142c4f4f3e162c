/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the last `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Small SSE decoder for MCP streamable HTTP bodies.
///
/// Only `event:` and `data:` fields are kept; each blank-line-delimited block
/// with at least one data line becomes one event.
pub fn decode_sse_events(buf: &str) -> Vec<SseEvent> {
    let mut out = Vec::new();
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let l = line.trim_end_matches('\r');

        if l.is_empty() {
            if !data_lines.is_empty() {
                out.push(SseEvent {
                    event: event.take(),
                    data: data_lines.join("\n"),
                });
                data_lines.clear();
            }
            event = None;
            continue;
        }

        // Comments and keep-alives.
        if l.starts_with(':') {
            continue;
        }

        if let Some(rest) = l.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = l.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
    }

    if !data_lines.is_empty() {
        out.push(SseEvent {
            event,
            data: data_lines.join("\n"),
        });
    }

    out
}

/// Payloads of the JSON-RPC carrying events (`message` or unnamed), in order.
///
/// Payloads are returned as raw text so the caller can classify malformed data
/// instead of losing it to a parse error here.
pub fn message_payloads(buf: &str) -> Vec<String> {
    decode_sse_events(buf)
        .into_iter()
        .filter(|e| matches!(e.event.as_deref(), None | Some("message")))
        .map(|e| e.data)
        .collect()
}
