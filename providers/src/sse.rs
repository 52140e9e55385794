//! Server-sent-events framing.
//!
//! Minimal incremental SSE decoding: byte chunks go in, complete events come
//! out. Handles both LF and CRLF event delimiters, whichever occurs first in
//! the buffer.

/// Incremental buffer over a byte stream of SSE frames.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Drain and return the next complete event, without its delimiter.
    pub(crate) fn next_event(&mut self) -> Option<Vec<u8>> {
        let (end, delimiter_len) = self.boundary()?;
        let event = self.buf[..end].to_vec();
        self.buf.drain(..end + delimiter_len);
        Some(event)
    }

    fn boundary(&self) -> Option<(usize, usize)> {
        let lf = self.buf.windows(2).position(|window| window == b"\n\n");
        let crlf = self
            .buf
            .windows(4)
            .position(|window| window == b"\r\n\r\n");
        match (lf, crlf) {
            (Some(a), Some(b)) if b < a => Some((b, 4)),
            (Some(a), _) => Some((a, 2)),
            (None, Some(b)) => Some((b, 4)),
            (None, None) => None,
        }
    }
}

/// Concatenated `data:` payload of one event, `None` when the event carries
/// no data lines (comments, ids, retry hints).
pub(crate) fn event_data(event: &str) -> Option<String> {
    let mut data: Option<String> = None;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);

        match &mut data {
            Some(data) => {
                data.push('\n');
                data.push_str(rest);
            }
            None => data = Some(rest.to_string()),
        }
    }

    data
}
