//! Connection handles and the slab-backed registry that owns them.
//!
//! A handle lives in exactly one registry slot from accept until it is
//! removed. Removal is the only way a handle is destroyed, and `remove`
//! is a no-op for a vacant slot, so teardown happens at most once.

use crate::pipeline::Pipeline;
use crate::runtime::buffer::WriteBuffer;
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A single client connection.
pub(crate) struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub pipeline: Pipeline,
    pub outbound: WriteBuffer,
    /// Whether WRITABLE interest is currently registered.
    pub write_interest: bool,
    /// Reads stopped because `outbound` reached `high_water`.
    pub read_paused: bool,
    /// Outbound size at which reading stops until the peer catches up.
    pub high_water: usize,
    /// When the connection last became idle.
    idle_since: Option<Instant>,
    /// Exchanges served when the idle clock was last started.
    idle_served: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, pipeline: Pipeline, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            pipeline,
            outbound: WriteBuffer::with_capacity(buffer_size),
            write_interest: false,
            read_paused: false,
            high_water: buffer_size.max(1),
            idle_since: None,
            idle_served: 0,
        }
    }

    /// The pipeline reached its terminal state and all output is flushed.
    pub fn is_finished(&self) -> bool {
        self.pipeline.is_closed() && self.outbound.is_empty()
    }

    /// Waiting for the next request on a kept-alive connection.
    pub fn is_idle(&self) -> bool {
        self.pipeline.is_idle() && self.outbound.is_empty()
    }

    /// Output has backed up far enough that no more requests are read.
    pub fn is_backed_up(&self) -> bool {
        self.outbound.len() >= self.high_water
    }

    /// Start or stop the idle clock. The clock restarts whenever another
    /// exchange has completed since it was last started, even if the
    /// connection never looked busy between two calls.
    pub fn update_idle(&mut self, now: Instant) {
        if !self.is_idle() {
            self.idle_since = None;
            return;
        }
        let served = self.pipeline.served();
        if self.idle_since.is_none() || served != self.idle_served {
            self.idle_since = Some(now);
            self.idle_served = served;
        }
    }

    pub fn idle_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.idle_since.map(|since| since + timeout)
    }
}

/// Registry of active connections using slab allocation.
pub(crate) struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Returns `None` if the registry is at capacity; the connection is
    /// dropped.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Take a connection out of the registry. Returns `None` if it is
    /// already gone.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection)> {
        self.connections.iter_mut()
    }
}
