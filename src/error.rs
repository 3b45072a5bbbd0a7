//! Error types for the server lifecycle and per-connection failures.
//!
//! Listening-socket errors (`Bind`, `Listen`) are returned synchronously from
//! the call that caused them. Everything that happens on an individual
//! connection is delivered to the user callback instead and never stops the
//! server.

use std::io;

/// Errors produced by the incremental request parser.
#[derive(Debug)]
pub enum ParseError {
    /// The request head is not valid HTTP/1.x.
    Malformed(httparse::Error),
    /// `content-length` is missing a value, not a number, or repeated with
    /// conflicting values.
    InvalidContentLength,
    /// A chunk-size line in a chunked request body could not be parsed.
    InvalidChunkSize,
    /// The request head grew beyond the configured limit.
    HeadTooLarge,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Malformed(e) => write!(f, "malformed request head: {e}"),
            ParseError::InvalidContentLength => write!(f, "invalid content-length"),
            ParseError::InvalidChunkSize => write!(f, "invalid chunk size"),
            ParseError::HeadTooLarge => write!(f, "request head too large"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        ParseError::Malformed(e)
    }
}

/// Server and connection errors.
#[derive(Debug)]
pub enum ServerError {
    /// The address is invalid or already in use.
    Bind(io::Error),
    /// The bound socket could not enter the listening state.
    Listen(io::Error),
    /// Accepting a connection failed (or TCP_NODELAY could not be applied).
    Accept(io::Error),
    /// Reading from a connection failed.
    TransportRead(io::Error),
    /// Writing to a connection failed.
    TransportWrite(io::Error),
    /// The request bytes could not be parsed.
    Parse(ParseError),
    /// Transport-level keep-alive could not be enabled on a connection.
    KeepAliveSetup(io::Error),
    /// Polling the event loop failed.
    EventLoop(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "bind failed: {e}"),
            ServerError::Listen(e) => write!(f, "listen failed: {e}"),
            ServerError::Accept(e) => write!(f, "accept failed: {e}"),
            ServerError::TransportRead(e) => write!(f, "read failed: {e}"),
            ServerError::TransportWrite(e) => write!(f, "write failed: {e}"),
            ServerError::Parse(e) => write!(f, "parse failed: {e}"),
            ServerError::KeepAliveSetup(e) => write!(f, "keep-alive setup failed: {e}"),
            ServerError::EventLoop(e) => write!(f, "event loop failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e)
            | ServerError::Listen(e)
            | ServerError::Accept(e)
            | ServerError::TransportRead(e)
            | ServerError::TransportWrite(e)
            | ServerError::KeepAliveSetup(e)
            | ServerError::EventLoop(e) => Some(e),
            ServerError::Parse(e) => Some(e),
        }
    }
}

impl From<ParseError> for ServerError {
    fn from(e: ParseError) -> Self {
        ServerError::Parse(e)
    }
}
