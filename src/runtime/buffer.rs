//! Outbound write buffer.
//!
//! Response bytes are appended by the pipeline and drained into the socket
//! with non-blocking writes. A partial write leaves the remainder in place
//! until the next writable event.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushStatus {
    /// Everything was written.
    Drained,
    /// The socket would block with bytes still pending.
    Pending,
}

pub(crate) struct WriteBuffer {
    buf: BytesMut,
}

impl WriteBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// The buffer the pipeline encodes into.
    pub(crate) fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write as much as the writer accepts.
    pub(crate) fn flush_into<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        while !self.buf.is_empty() {
            match writer.write(&self.buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(FlushStatus::Drained)
    }
}
