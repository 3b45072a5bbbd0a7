//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Registrations are edge-triggered, so reads drain the socket until
//! `WouldBlock`.

use crate::error::ServerError;
use crate::pipeline::{ConnectionResult, Fate};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::token::connection_token;
use crate::server::ServerStats;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{self, Read};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One readiness notification, detached from the `Events` buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct EventLoop {
    poll: Poll,
    events: Events,
}

impl EventLoop {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Wait for readiness. An interrupted wait yields no events.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                // Errors and hang-ups surface through the next read.
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect())
    }
}

pub(crate) fn handle_connection_event(
    conn_id: usize,
    ready: Ready,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    read_buf: &mut [u8],
    handler: &mut dyn FnMut(ConnectionResult<'_>),
    stats: &mut ServerStats,
) {
    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };

    let mut result = Ok(());
    let mut read = ready.readable;
    loop {
        if read {
            result = handle_readable(conn, read_buf, handler, stats);
        }
        if result.is_ok() && (ready.writable || !conn.outbound.is_empty()) {
            result = handle_writable(conn);
        }
        // Readiness is edge-triggered: input left unread while output was
        // backed up will not be reported again, so pick it up here once the
        // flush has made room.
        read = result.is_ok() && conn.read_paused && !conn.is_backed_up();
        if !read {
            break;
        }
    }

    if let Err(e) = result {
        debug!(conn_id, error = %e, "Connection error");
        conn.pipeline.abort(e, handler);
        close_connection(registry, connections, stats, conn_id);
        return;
    }

    settle_connection(conn_id, registry, connections, stats, Instant::now());
}

fn handle_readable(
    conn: &mut Connection,
    read_buf: &mut [u8],
    handler: &mut dyn FnMut(ConnectionResult<'_>),
    stats: &mut ServerStats,
) -> Result<(), ServerError> {
    conn.read_paused = false;
    while !conn.pipeline.is_closed() {
        if conn.is_backed_up() {
            conn.read_paused = true;
            break;
        }
        match conn.stream.read(read_buf) {
            Ok(0) => {
                conn.pipeline.on_eof();
                break;
            }
            Ok(n) => {
                let served = conn.pipeline.served();
                let fate = conn
                    .pipeline
                    .on_bytes(&read_buf[..n], conn.outbound.bytes_mut(), handler);
                stats.requests += (conn.pipeline.served() - served) as u64;
                if fate == Fate::Close {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ServerError::TransportRead(e)),
        }
    }
    Ok(())
}

fn handle_writable(conn: &mut Connection) -> Result<(), ServerError> {
    conn.outbound
        .flush_into(&mut conn.stream)
        .map(|_| ())
        .map_err(ServerError::TransportWrite)
}

/// Destroy a finished connection, otherwise bring its interest set and idle
/// clock up to date.
pub(crate) fn settle_connection(
    conn_id: usize,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &mut ServerStats,
    now: Instant,
) {
    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };

    if conn.is_finished() {
        close_connection(registry, connections, stats, conn_id);
        return;
    }

    let want_write = !conn.outbound.is_empty();
    if want_write != conn.write_interest {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = registry.reregister(&mut conn.stream, connection_token(conn_id), interest) {
            warn!(conn_id, error = %e, "Failed to update interest");
            close_connection(registry, connections, stats, conn_id);
            return;
        }
        conn.write_interest = want_write;
    }

    conn.update_idle(now);
}

pub(crate) fn close_connection(
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &mut ServerStats,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = registry.deregister(&mut conn.stream);
        stats.destroyed += 1;
        debug!(
            conn_id,
            peer = %conn.peer,
            served = conn.pipeline.served(),
            pending = conn.outbound.len(),
            "Connection closed"
        );
    }
}

/// Destroy connections idle for at least `timeout`. Returns how many were
/// reaped.
pub(crate) fn reap_idle(
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &mut ServerStats,
    now: Instant,
    timeout: Duration,
) -> usize {
    let expired: Vec<usize> = connections
        .iter()
        .filter(|(_, conn)| conn.idle_deadline(timeout).is_some_and(|at| at <= now))
        .map(|(conn_id, _)| conn_id)
        .collect();

    for &conn_id in &expired {
        debug!(conn_id, "Idle connection reaped");
        close_connection(registry, connections, stats, conn_id);
    }
    expired.len()
}

/// Earliest moment an idle connection expires.
pub(crate) fn next_idle_deadline(
    connections: &ConnectionRegistry,
    timeout: Duration,
) -> Option<Instant> {
    connections
        .iter()
        .filter_map(|(_, conn)| conn.idle_deadline(timeout))
        .min()
}
