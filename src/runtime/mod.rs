//! Single-threaded runtime.
//!
//! - `EventLoop`: mio poll wrapper (epoll on Linux, kqueue on macOS)
//! - `ConnectionRegistry`: slab of live connection handles
//! - `WriteBuffer`: per-connection outbound bytes
//! - tokens: listener / distribution channel / connection

mod buffer;
mod connection;
mod event_loop;
mod token;

pub(crate) use connection::{Connection, ConnectionRegistry};
pub(crate) use event_loop::{
    close_connection, handle_connection_event, next_idle_deadline, reap_idle, settle_connection,
    EventLoop,
};
pub(crate) use token::{connection_token, TokenKind, CHANNEL_TOKEN, LISTENER_TOKEN};
