//! mio token space.
//!
//! Connection tokens are slab indices. The two highest values are reserved
//! for the listening socket and the worker's distribution channel.

use mio::Token;

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const CHANNEL_TOKEN: Token = Token(usize::MAX - 1);

/// What a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Listener,
    Channel,
    Connection(usize),
}

impl TokenKind {
    pub(crate) fn classify(token: Token) -> Self {
        match token {
            LISTENER_TOKEN => TokenKind::Listener,
            CHANNEL_TOKEN => TokenKind::Channel,
            Token(conn_id) => TokenKind::Connection(conn_id),
        }
    }
}

pub(crate) fn connection_token(conn_id: usize) -> Token {
    Token(conn_id)
}
