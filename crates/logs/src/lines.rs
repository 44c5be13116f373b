use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::LogError;

/// Splits a byte stream into `\n`-terminated lines. The final line is
/// yielded even without a terminator. A stream error discards any partial
/// line and ends the reader.
pub struct LineReader<S> {
    stream: S,
    buf: BytesMut,
    done: bool,
}

impl<S, E> LineReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    pub fn new(stream: S) -> Self {
        Self { stream, buf: BytesMut::new(), done: false }
    }

    /// Next line without its `\n`, `None` at end of stream.
    pub async fn next_line(&mut self) -> Option<Result<Bytes, LogError>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos);
                let _ = self.buf.split_to(1); // drop '\n'
                return Some(Ok(line.freeze()));
            }
            if self.done {
                if self.buf.is_empty() {
                    return None;
                }
                return Some(Ok(self.buf.split().freeze()));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    self.buf.clear();
                    return Some(Err(LogError::Read(e.to_string())));
                }
                None => self.done = true,
            }
        }
    }
}
