//! Newline-delimited JSON framing over any async byte stream (process pipes,
//! stdin/stdout, in-memory duplex streams in tests).

use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _,
};

use crate::channel::{Frame, FrameSink, FrameSource, TransportError, parse_frame};
use crate::jsonrpc::JsonRpcMessage;

/// Longest line accepted by default, newline excluded.
pub const DEFAULT_MAX_LINE_LEN: usize = 16 * 1024 * 1024;

pub struct LineSource<R> {
    reader: R,
    buf: Vec<u8>,
    max_line_len: usize,
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }
}

#[async_trait]
impl<R> FrameSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            self.buf.clear();
            let limit = u64::try_from(self.max_line_len)
                .unwrap_or(u64::MAX)
                .saturating_add(1);
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            if self.buf.len() > self.max_line_len && self.buf.last() != Some(&b'\n') {
                return Err(TransportError::Protocol(format!(
                    "line exceeds {} bytes",
                    self.max_line_len
                )));
            }

            // Non-UTF-8 bytes survive as replacement characters so the frame can
            // still be reported (and possibly salvaged) instead of killing the stream.
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(parse_frame(line)));
        }
    }
}

pub struct LineSink<W> {
    writer: W,
}

impl<W> LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FrameSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, msg: &JsonRpcMessage) -> Result<(), TransportError> {
        let out = serde_json::to_string(msg)?;
        self.writer.write_all(out.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
