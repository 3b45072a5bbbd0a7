//! Incremental HTTP/1.x request parser.
//!
//! A `ParserSession` lives as long as its connection. Raw bytes are fed in as
//! they arrive and parser events are pulled out one at a time, so pipelined
//! requests are segmented correctly no matter how the bytes were split
//! across reads. Head parsing is delegated to `httparse`; body framing
//! (`content-length` and chunked) is tracked here.

use super::{Headers, RequestHead};
use crate::error::ParseError;
use bytes::{Buf, Bytes, BytesMut};

/// Maximum number of header fields in one request head.
const MAX_HEADERS: usize = 64;

/// Maximum length of a chunk-size line (including extensions).
const MAX_CHUNK_LINE: usize = 1024;

/// Events produced while parsing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// Request line and headers are complete.
    Head(RequestHead),
    /// A piece of the request body.
    Body(Bytes),
    /// The current request is complete.
    MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
    Failed,
}

/// How the body of a parsed head is framed.
enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

/// Parser state for one connection.
#[derive(Debug)]
pub struct ParserSession {
    buf: BytesMut,
    state: State,
    max_head_size: usize,
}

impl ParserSession {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Head,
            max_head_size,
        }
    }

    /// Append raw bytes. Ignored once the session has failed.
    pub fn feed(&mut self, data: &[u8]) {
        if self.state != State::Failed {
            self.buf.extend_from_slice(data);
        }
    }

    /// Bytes received but not yet consumed by an event.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    /// True between requests, when no part of a request has been consumed.
    pub fn at_message_boundary(&self) -> bool {
        self.state == State::Head
    }

    /// Pull the next event. `Ok(None)` means more bytes are needed.
    ///
    /// After an error the session stays failed and yields no further events.
    pub fn next_event(&mut self) -> Result<Option<ParserEvent>, ParseError> {
        match self.advance() {
            Ok(event) => Ok(event),
            Err(e) => {
                self.state = State::Failed;
                self.buf.clear();
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<ParserEvent>, ParseError> {
        loop {
            match self.state {
                State::Failed => return Ok(None),
                State::Head => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let Some((head, framing, len)) = self.parse_head()? else {
                        return Ok(None);
                    };
                    self.buf.advance(len);
                    self.state = match framing {
                        Framing::Empty | Framing::Length(0) => State::Complete,
                        Framing::Length(n) => State::Body { remaining: n },
                        Framing::Chunked => State::ChunkSize,
                    };
                    return Ok(Some(ParserEvent::Head(head)));
                }
                State::Body { remaining } => {
                    let Some(data) = self.take_body(remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        State::Complete
                    } else {
                        State::Body { remaining: left }
                    };
                    return Ok(Some(ParserEvent::Body(data)));
                }
                State::ChunkSize => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        self.buf.advance(consumed);
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buf.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunkSize);
                        }
                        return Ok(None);
                    }
                    Err(_) => return Err(ParseError::InvalidChunkSize),
                },
                State::ChunkData { remaining } => {
                    let Some(data) = self.take_body(remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                    return Ok(Some(ParserEvent::Body(data)));
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunkSize);
                    }
                    self.buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    // Trailer fields are read and discarded.
                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.buf.len() > self.max_head_size {
                            return Err(ParseError::HeadTooLarge);
                        }
                        return Ok(None);
                    };
                    self.buf.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = State::Complete;
                    }
                }
                State::Complete => {
                    self.state = State::Head;
                    return Ok(Some(ParserEvent::MessageComplete));
                }
            }
        }
    }

    /// Split off up to `remaining` body bytes, or `None` if nothing is buffered.
    fn take_body(&mut self, remaining: u64) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        let take = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        Some(self.buf.split_to(take).freeze())
    }

    fn parse_head(&self) -> Result<Option<(RequestHead, Framing, usize)>, ParseError> {
        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut fields);

        let len = match req.parse(&self.buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if self.buf.len() > self.max_head_size {
                    return Err(ParseError::HeadTooLarge);
                }
                return Ok(None);
            }
        };
        if len > self.max_head_size {
            return Err(ParseError::HeadTooLarge);
        }

        let headers: Headers = req
            .headers
            .iter()
            .map(|h| (h.name, String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        let framing = body_framing(&headers)?;

        let head = RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers,
        };
        Ok(Some((head, framing, len)))
    }
}

/// RFC 9112 section 6.3: transfer-encoding wins over content-length;
/// conflicting content-length values are an error.
fn body_framing(headers: &Headers) -> Result<Framing, ParseError> {
    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(Framing::Chunked);
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all("content-length") {
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::InvalidContentLength)
            }
            _ => length = Some(parsed),
        }
    }

    Ok(length.map_or(Framing::Empty, Framing::Length))
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(session: &mut ParserSession) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_simple_get() {
        let mut session = ParserSession::new(8192);
        session.feed(b"GET /index HTTP/1.1\r\nHost: x\r\n\r\n");

        let events = drain(&mut session);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParserEvent::Head(head) => {
                assert_eq!(head.method, "GET");
                assert_eq!(head.target, "/index");
                assert_eq!(head.version, 1);
                assert_eq!(head.headers.get("host"), Some("x"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(events[1], ParserEvent::MessageComplete);
        assert!(session.at_message_boundary());
        assert_eq!(session.buffered(), 0);
    }

    #[test]
    fn test_incomplete_head_waits() {
        let mut session = ParserSession::new(8192);
        session.feed(b"GET / HTTP/1.1\r\nHo");
        assert!(session.next_event().unwrap().is_none());

        session.feed(b"st: x\r\n\r\n");
        assert!(matches!(
            session.next_event().unwrap(),
            Some(ParserEvent::Head(_))
        ));
    }

    #[test]
    fn test_content_length_body_split_across_feeds() {
        let mut session = ParserSession::new(8192);
        session.feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");

        let events = drain(&mut session);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ParserEvent::Body(Bytes::from_static(b"hel")));

        session.feed(b"lo");
        let events = drain(&mut session);
        assert_eq!(
            events,
            vec![
                ParserEvent::Body(Bytes::from_static(b"lo")),
                ParserEvent::MessageComplete
            ]
        );
    }

    #[test]
    fn test_chunked_request_body() {
        let mut session = ParserSession::new(8192);
        session.feed(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\nX-Trailer: 1\r\n\r\n",
        );

        let events = drain(&mut session);
        assert_eq!(
            &events[1..],
            &[
                ParserEvent::Body(Bytes::from_static(b"abc")),
                ParserEvent::Body(Bytes::from_static(b"de")),
                ParserEvent::MessageComplete,
            ]
        );
    }

    #[test]
    fn test_pipelined_requests() {
        let mut session = ParserSession::new(8192);
        session.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        let targets: Vec<_> = drain(&mut session)
            .into_iter()
            .filter_map(|e| match e {
                ParserEvent::Head(head) => Some(head.target),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["/a", "/b"]);
    }

    #[test]
    fn test_malformed_request_fails_session() {
        let mut session = ParserSession::new(8192);
        session.feed(b"NOT A REQUEST\r\n\r\n");

        assert!(matches!(
            session.next_event(),
            Err(ParseError::Malformed(_))
        ));
        assert!(session.is_failed());

        session.feed(b"GET / HTTP/1.1\r\n\r\n");
        assert!(session.next_event().unwrap().is_none());
    }

    #[test]
    fn test_conflicting_content_length() {
        let mut session = ParserSession::new(8192);
        session.feed(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n");

        assert!(matches!(
            session.next_event(),
            Err(ParseError::InvalidContentLength)
        ));
    }

    #[test]
    fn test_head_too_large() {
        let mut session = ParserSession::new(32);
        session.feed(b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        assert!(matches!(
            session.next_event(),
            Err(ParseError::HeadTooLarge)
        ));
    }

    #[test]
    fn test_bad_chunk_size() {
        let mut session = ParserSession::new(8192);
        session.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");

        assert!(matches!(
            session.next_event().unwrap(),
            Some(ParserEvent::Head(_))
        ));
        assert!(matches!(
            session.next_event(),
            Err(ParseError::InvalidChunkSize)
        ));
    }
}
