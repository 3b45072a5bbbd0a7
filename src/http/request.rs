//! Parsed HTTP requests.

use super::Headers;
use bytes::Bytes;

/// Request line and headers, as produced by the parser before the body has
/// been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
}

impl RequestHead {
    /// Whether the client asked for the connection to persist.
    ///
    /// HTTP/1.1 persists unless `connection: close` is sent; HTTP/1.0 only
    /// persists with an explicit `connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        self.version >= 1 || self.headers.has_token("connection", "keep-alive")
    }
}

/// Immutable view of one complete HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    head: RequestHead,
    keep_alive: bool,
    body: Bytes,
}

impl Request {
    pub fn new(head: RequestHead, body: Bytes) -> Self {
        let keep_alive = head.wants_keep_alive();
        Self {
            head,
            keep_alive,
            body,
        }
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    /// Request target as sent on the request line (path and query).
    pub fn target(&self) -> &str {
        &self.head.target
    }

    pub fn version(&self) -> u8 {
        self.head.version
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
