//! Request/response pipeline for one connection.
//!
//! A `Pipeline` is bound to a connection for its whole open lifetime and
//! owns the connection's parser session, so pipelined requests are parsed
//! strictly in order. It performs no I/O: raw bytes go in, wire bytes come
//! out, and every call reports whether the connection stays open once those
//! bytes are flushed.
//!
//! Per-connection state machine:
//!
//! ```text
//! Accepted -> Reading -> HeaderParsed -> Responding
//!     Responding -> HeaderFlushed -> BodyStreaming -> Completed   (chunked)
//!     Responding -> Completed                                     (buffered)
//! Completed -> Idle -> Reading ...   (keep-alive)
//! any       -> Closed                (terminal)
//! ```

use crate::error::{ParseError, ServerError};
use crate::http::encoder::{self, ChunkedEncoder};
use crate::http::{ParserEvent, ParserSession, Request, RequestHead, Response, ResponseEvent};
use bytes::BytesMut;
use tracing::{debug, trace};

/// What the user callback receives for each exchange or failure.
pub enum ConnectionResult<'a> {
    /// A complete request and the response to populate.
    Success(&'a Request, &'a mut Response),
    /// A connection-level failure. The connection is being torn down.
    Error(&'a ServerError),
}

/// Exchange state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Accepted,
    Reading,
    HeaderParsed,
    Responding,
    HeaderFlushed,
    BodyStreaming,
    Completed,
    Idle,
    Closed,
}

impl ExchangeState {
    /// Whether `next` is a legal successor of `self`. `Closed` is reachable
    /// from every state and has no successors.
    pub fn can_advance_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Accepted, Reading)
            | (Reading, HeaderParsed)
            | (HeaderParsed, Responding)
            | (Responding, HeaderFlushed)
            | (Responding, Completed)
            | (HeaderFlushed, BodyStreaming)
            | (HeaderFlushed, Completed)
            | (BodyStreaming, BodyStreaming)
            | (BodyStreaming, Completed)
            | (Completed, Idle)
            | (Idle, Reading) => true,
            _ => false,
        }
    }
}

/// Whether the connection stays open after the pending output is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Open,
    Close,
}

/// Connection persistence settings.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlivePolicy {
    /// Seconds an idle connection is kept; 0 disables keep-alive.
    pub timeout_secs: u64,
    /// Exchanges allowed per connection; 0 means unlimited.
    pub max_requests: usize,
}

impl KeepAlivePolicy {
    pub fn enabled(&self) -> bool {
        self.timeout_secs > 0
    }
}

pub struct Pipeline {
    state: ExchangeState,
    parser: ParserSession,
    head: Option<RequestHead>,
    body: BytesMut,
    encoder: Option<ChunkedEncoder>,
    request_keep_alive: bool,
    policy: KeepAlivePolicy,
    served: usize,
}

impl Pipeline {
    pub fn new(policy: KeepAlivePolicy, max_head_size: usize) -> Self {
        Self {
            state: ExchangeState::Accepted,
            parser: ParserSession::new(max_head_size),
            head: None,
            body: BytesMut::new(),
            encoder: None,
            request_keep_alive: false,
            policy,
            served: 0,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Exchanges completed on this connection.
    pub fn served(&self) -> usize {
        self.served
    }

    /// Idle between requests with nothing buffered. Idle connections do not
    /// keep the event loop alive.
    pub fn is_idle(&self) -> bool {
        self.state == ExchangeState::Idle && self.parser.buffered() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state == ExchangeState::Closed
    }

    /// Begin reading from a freshly accepted connection.
    pub fn start(&mut self) {
        self.advance(ExchangeState::Reading);
    }

    /// Stop persisting the connection after the current exchange.
    pub fn disable_keep_alive(&mut self) {
        self.policy.timeout_secs = 0;
    }

    /// Feed bytes read from the socket, dispatching every request they
    /// complete. Response bytes are appended to `out`.
    pub fn on_bytes(
        &mut self,
        data: &[u8],
        out: &mut BytesMut,
        handler: &mut dyn FnMut(ConnectionResult<'_>),
    ) -> Fate {
        if self.state == ExchangeState::Closed {
            return Fate::Close;
        }
        if self.state == ExchangeState::Idle && !data.is_empty() {
            self.advance(ExchangeState::Reading);
        }
        self.parser.feed(data);

        loop {
            match self.parser.next_event() {
                Ok(None) => return Fate::Open,
                Ok(Some(ParserEvent::Head(head))) => {
                    if self.state == ExchangeState::Idle {
                        self.advance(ExchangeState::Reading);
                    }
                    self.advance(ExchangeState::HeaderParsed);
                    self.head = Some(head);
                    self.body.clear();
                }
                Ok(Some(ParserEvent::Body(data))) => self.body.extend_from_slice(&data),
                Ok(Some(ParserEvent::MessageComplete)) => {
                    if self.dispatch(out, handler) == Fate::Close {
                        return Fate::Close;
                    }
                }
                Err(e) => return self.on_parse_error(e, out, handler),
            }
        }
    }

    /// Peer closed its side. Torn down silently.
    pub fn on_eof(&mut self) {
        if self.state != ExchangeState::Closed {
            self.advance(ExchangeState::Closed);
        }
    }

    /// Report a transport failure and close.
    pub fn abort(&mut self, err: ServerError, handler: &mut dyn FnMut(ConnectionResult<'_>)) {
        handler(ConnectionResult::Error(&err));
        if self.state != ExchangeState::Closed {
            self.advance(ExchangeState::Closed);
        }
    }

    fn dispatch(
        &mut self,
        out: &mut BytesMut,
        handler: &mut dyn FnMut(ConnectionResult<'_>),
    ) -> Fate {
        let Some(head) = self.head.take() else {
            return Fate::Open;
        };
        let request = Request::new(head, self.body.split().freeze());
        self.request_keep_alive = request.keep_alive();
        self.advance(ExchangeState::Responding);

        trace!(method = request.method(), target = request.target(), "Dispatching request");

        let mut response = Response::new();
        handler(ConnectionResult::Success(&request, &mut response));
        if !response.is_ended() {
            response.end();
        }
        for event in response.take_events() {
            self.on_response_event(event, &response, out);
        }

        self.finish_exchange()
    }

    /// Transition function for handler-driven events.
    fn on_response_event(&mut self, event: ResponseEvent, response: &Response, out: &mut BytesMut) {
        match (self.state, event) {
            (ExchangeState::Responding, ResponseEvent::HeadersFinalized) => {
                if response.is_chunked() {
                    encoder::encode_head(response.status(), response.reason(), response.headers(), out);
                    self.encoder = Some(ChunkedEncoder::new());
                    self.advance(ExchangeState::HeaderFlushed);
                }
            }
            (
                ExchangeState::HeaderFlushed | ExchangeState::BodyStreaming,
                ResponseEvent::Chunk(data),
            ) => {
                if let Some(encoder) = self.encoder.as_mut() {
                    encoder.chunk(&data, out);
                }
                self.advance(ExchangeState::BodyStreaming);
            }
            (
                ExchangeState::HeaderFlushed | ExchangeState::BodyStreaming,
                ResponseEvent::Complete,
            ) => {
                if let Some(mut encoder) = self.encoder.take() {
                    encoder.finish(out);
                }
                self.advance(ExchangeState::Completed);
            }
            (ExchangeState::Responding, ResponseEvent::Complete) => {
                encoder::encode_buffered(
                    response.status(),
                    response.reason(),
                    response.headers(),
                    response.body(),
                    out,
                );
                self.advance(ExchangeState::Completed);
            }
            (state, event) => debug!(?state, ?event, "Response event ignored"),
        }
    }

    /// Decide the connection's fate after a completed exchange.
    fn finish_exchange(&mut self) -> Fate {
        self.served += 1;

        let limit_reached =
            self.policy.max_requests > 0 && self.served >= self.policy.max_requests;
        if !self.policy.enabled() || !self.request_keep_alive || limit_reached {
            self.advance(ExchangeState::Closed);
            return Fate::Close;
        }

        self.advance(ExchangeState::Idle);
        Fate::Open
    }

    fn on_parse_error(
        &mut self,
        e: ParseError,
        out: &mut BytesMut,
        handler: &mut dyn FnMut(ConnectionResult<'_>),
    ) -> Fate {
        debug!(error = %e, state = ?self.state, "Parse error");
        let err = ServerError::Parse(e);
        handler(ConnectionResult::Error(&err));

        match self.state {
            // Headers are already on the wire; end the body instead.
            ExchangeState::HeaderFlushed | ExchangeState::BodyStreaming => {
                if let Some(mut encoder) = self.encoder.take() {
                    encoder.finish(out);
                }
            }
            _ => {
                let page = Response::error_page(500);
                encoder::encode_buffered(page.status(), page.reason(), page.headers(), page.body(), out);
            }
        }

        self.advance(ExchangeState::Closed);
        Fate::Close
    }

    fn advance(&mut self, next: ExchangeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "Exchange state");
        self.state = next;
    }
}
