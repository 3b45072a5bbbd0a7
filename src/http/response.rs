//! Outgoing responses.
//!
//! A [`Response`] is populated by the user handler. The handler's calls are
//! recorded as [`ResponseEvent`]s which the pipeline turns into wire bytes:
//!
//! - `write_head` finalizes the headers and fixes the framing (chunked iff a
//!   `transfer-encoding: chunked` header is present at that moment)
//! - `write` either accumulates into the body buffer or, for a chunked
//!   response, produces one body chunk
//! - `end` completes the message

use super::Headers;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Things the handler did to a response, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// Headers were finalized.
    HeadersFinalized,
    /// A body chunk was produced (chunked responses only).
    Chunk(Bytes),
    /// The message is complete.
    Complete,
}

/// Mutable outgoing HTTP response.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Headers,
    body: BytesMut,
    /// Framing decided when the headers were finalized.
    chunked: Option<bool>,
    ended: bool,
    events: Vec<ResponseEvent>,
}

impl Response {
    /// A `200 OK` response with no headers and an empty body.
    pub fn new() -> Self {
        Self {
            status: 200,
            reason: reason_phrase(200).to_string(),
            headers: Headers::new(),
            body: BytesMut::new(),
            chunked: None,
            ended: false,
            events: Vec::new(),
        }
    }

    /// The response sent on internal failures: `content-type: text/html`,
    /// a `date` header and a body of `"<code> <reason phrase>"`.
    pub fn error_page(status: u16) -> Self {
        let mut response = Response::new();
        response.set_status(status);
        response
            .set_header("content-type", "text/html")
            .set_header("date", http_date(Utc::now()));
        let body = format!("{} {}", response.status, response.reason);
        response.send(body);
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Bytes accumulated for a buffered response.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the body is sent with chunked transfer-encoding. Fixed once
    /// the headers are finalized.
    pub fn is_chunked(&self) -> bool {
        self.chunked
            .unwrap_or_else(|| self.headers.has_token("transfer-encoding", "chunked"))
    }

    pub fn headers_sent(&self) -> bool {
        self.chunked.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Set the status code and its standard reason phrase.
    pub fn set_status(&mut self, status: u16) -> &mut Self {
        if self.head_frozen("status") {
            return self;
        }
        self.status = status;
        self.reason = reason_phrase(status).to_string();
        self
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) -> &mut Self {
        if self.head_frozen("reason") {
            return self;
        }
        self.reason = reason.into();
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if !self.head_frozen("header") {
            self.headers.set(name, value);
        }
        self
    }

    pub fn append_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        if !self.head_frozen("header") {
            self.headers.append(name, value);
        }
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        if !self.head_frozen("header") {
            self.headers.remove(name);
        }
        self
    }

    /// Finalize the headers. For a chunked response this flushes the head
    /// block immediately; a buffered head is written together with the body.
    pub fn write_head(&mut self) -> &mut Self {
        if self.chunked.is_none() {
            self.chunked = Some(self.headers.has_token("transfer-encoding", "chunked"));
            self.events.push(ResponseEvent::HeadersFinalized);
        }
        self
    }

    /// Write body data.
    pub fn write(&mut self, data: impl Into<Bytes>) -> &mut Self {
        if self.ended {
            warn!("write after end ignored");
            return self;
        }
        let data = data.into();
        if self.is_chunked() {
            self.write_head();
            if !data.is_empty() {
                self.events.push(ResponseEvent::Chunk(data));
            }
        } else {
            self.body.extend_from_slice(&data);
        }
        self
    }

    /// Complete the message. Further calls are no-ops.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.write_head();
        self.ended = true;
        self.events.push(ResponseEvent::Complete);
    }

    /// Write `data` and complete the message.
    pub fn send(&mut self, data: impl Into<Bytes>) {
        self.write(data);
        self.end();
    }

    /// Drain the events recorded since the last call.
    pub(crate) fn take_events(&mut self) -> Vec<ResponseEvent> {
        std::mem::take(&mut self.events)
    }

    fn head_frozen(&self, what: &str) -> bool {
        if self.chunked.is_some() {
            warn!(field = what, "response head already finalized, change ignored");
            return true;
        }
        false
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard reason phrase for `status`, or `"Unknown"`.
pub fn reason_phrase(status: u16) -> &'static str {
    ::http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// RFC 1123 date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
