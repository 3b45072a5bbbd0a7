//! Response wire encoding.
//!
//! Pure byte transformations, no I/O:
//! - head block: `HTTP/1.1 <code> <reason>\r\n`, one `<name>: <value>\r\n`
//!   per header in insertion order, then `\r\n`
//! - buffered: head block followed by the body bytes, no framing
//! - chunked: `<hex-size>\r\n<data>\r\n` per chunk, terminated by `0\r\n\r\n`

use super::Headers;
use bytes::BytesMut;

/// Zero-length chunk ending a chunked body.
pub const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

const HTTP_VERSION: &str = "HTTP/1.1";

/// Append the status line and header block to `out`.
pub fn encode_head(status: u16, reason: &str, headers: &Headers, out: &mut BytesMut) {
    out.extend_from_slice(format!("{HTTP_VERSION} {status} {reason}\r\n").as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Append a complete buffered response (head block + body) to `out`.
pub fn encode_buffered(
    status: u16,
    reason: &str,
    headers: &Headers,
    body: &[u8],
    out: &mut BytesMut,
) {
    encode_head(status, reason, headers, out);
    out.extend_from_slice(body);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Open,
    Finished,
}

/// Frames one chunked body.
///
/// Empty chunks are never framed, so the terminator written by [`finish`]
/// is the only zero-length chunk and nothing is written after it.
///
/// [`finish`]: ChunkedEncoder::finish
#[derive(Debug)]
pub struct ChunkedEncoder {
    state: ChunkedState,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::Open,
        }
    }

    /// Frame `data` as one chunk. Returns `false` if nothing was written
    /// (empty data, or the body is already finished).
    pub fn chunk(&mut self, data: &[u8], out: &mut BytesMut) -> bool {
        if self.state == ChunkedState::Finished || data.is_empty() {
            return false;
        }
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        true
    }

    /// Write the terminator. Returns `false` if it was already written.
    pub fn finish(&mut self, out: &mut BytesMut) -> bool {
        if self.state == ChunkedState::Finished {
            return false;
        }
        self.state = ChunkedState::Finished;
        out.extend_from_slice(CHUNK_TERMINATOR);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state == ChunkedState::Finished
    }
}

impl Default for ChunkedEncoder {
    fn default() -> Self {
        Self::new()
    }
}
