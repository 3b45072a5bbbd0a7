//! The server: listening socket, acceptor and event loop driver.
//!
//! A `Server` owns one mio event loop and everything registered with it: at
//! most one listening socket, the worker's distribution channel (in a worker
//! process), and the connection registry. All of it runs on the thread that
//! calls [`Server::run`] or [`Server::run_once`].
//!
//! After an accept the acceptor decides synchronously where the connection
//! goes. A cluster master with at least one worker forwards it, anything
//! else serves it here.

use crate::cluster::Cluster;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::pipeline::{ConnectionResult, Pipeline};
use crate::runtime::{
    close_connection, connection_token, handle_connection_event, next_idle_deadline, reap_idle,
    settle_connection, Connection, ConnectionRegistry, EventLoop, TokenKind, CHANNEL_TOKEN,
    LISTENER_TOKEN,
};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::Interest;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The user callback. Invoked once per completed request and once per
/// connection-level failure.
pub type Handler = Box<dyn FnMut(ConnectionResult<'_>)>;

/// Connection counters for this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections accepted locally or received from the master.
    pub accepted: u64,
    /// Connections handed to a worker.
    pub dispatched: u64,
    /// Connection handles torn down, including those handed off.
    pub destroyed: u64,
    /// Completed request/response exchanges.
    pub requests: u64,
}

pub struct Server {
    config: ServerConfig,
    cluster: Cluster,
    handler: Handler,
    event_loop: EventLoop,
    bound: Option<Socket>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    channel_attached: bool,
    connections: ConnectionRegistry,
    read_buf: Vec<u8>,
    stats: ServerStats,
}

impl Server {
    /// Create a server. A worker registers its distribution channel right
    /// away; everyone else starts with nothing registered.
    pub fn new<F>(config: ServerConfig, cluster: Cluster, handler: F) -> io::Result<Self>
    where
        F: FnMut(ConnectionResult<'_>) + 'static,
    {
        let event_loop = EventLoop::new(config.batch_size)?;

        let mut channel_attached = false;
        if let Cluster::Worker(channel) = &cluster {
            channel.set_nonblocking(true)?;
            let fd = channel.as_raw_fd();
            event_loop
                .registry()
                .register(&mut SourceFd(&fd), CHANNEL_TOKEN, Interest::READABLE)?;
            channel_attached = true;
        }

        Ok(Self {
            connections: ConnectionRegistry::new(config.max_connections),
            read_buf: vec![0; config.buffer_size.max(1)],
            config,
            cluster,
            handler: Box::new(handler),
            event_loop,
            bound: None,
            listener: None,
            local_addr: None,
            channel_attached,
            stats: ServerStats::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Address of the bound socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Live connection handles.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Bind the server socket. Returns the bound address (useful with port 0).
    pub fn bind(&mut self, addr: &str) -> Result<SocketAddr, ServerError> {
        if self.bound.is_some() || self.listener.is_some() {
            return Err(ServerError::Bind(io::Error::new(
                io::ErrorKind::AddrInUse,
                "server is already bound",
            )));
        }

        let addr = addr
            .to_socket_addrs()
            .map_err(ServerError::Bind)?
            .next()
            .ok_or_else(|| {
                ServerError::Bind(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address resolved to nothing",
                ))
            })?;

        let socket = bind_socket(addr).map_err(ServerError::Bind)?;
        let local = socket
            .local_addr()
            .map_err(ServerError::Bind)?
            .as_socket()
            .unwrap_or(addr);

        debug!(addr = %local, "Bound");
        self.bound = Some(socket);
        self.local_addr = Some(local);
        Ok(local)
    }

    /// Start accepting on the bound socket.
    pub fn listen(&mut self) -> Result<(), ServerError> {
        let Some(socket) = self.bound.as_ref() else {
            let reason = if self.listener.is_some() {
                "server is already listening"
            } else {
                "server is not bound"
            };
            return Err(ServerError::Listen(io::Error::new(
                io::ErrorKind::InvalidInput,
                reason,
            )));
        };

        let backlog = i32::try_from(self.config.backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(ServerError::Listen)?;

        if self.config.no_delay {
            if let Err(e) = socket.set_nodelay(true) {
                warn!(error = %e, "Failed to set TCP_NODELAY on listener");
                let err = ServerError::Accept(e);
                (self.handler)(ConnectionResult::Error(&err));
            }
        }

        let Some(socket) = self.bound.take() else {
            return Ok(());
        };
        let mut listener = TcpListener::from_std(socket.into());
        self.event_loop
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Listen)?;
        self.listener = Some(listener);

        info!(
            addr = ?self.local_addr,
            backlog = self.config.backlog,
            keep_alive_timeout = self.config.keep_alive_timeout,
            role = self.cluster.role(),
            "Listening"
        );
        Ok(())
    }

    /// Stop accepting. Idle connections are closed now; connections in the
    /// middle of an exchange close once it completes.
    pub fn close(&mut self) {
        self.bound = None;
        if let Some(mut listener) = self.listener.take() {
            let _ = self.event_loop.registry().deregister(&mut listener);
            info!(addr = ?self.local_addr, "Listener closed");
        }

        let idle: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_idle())
            .map(|(conn_id, _)| conn_id)
            .collect();
        for conn_id in idle {
            close_connection(
                self.event_loop.registry(),
                &mut self.connections,
                &mut self.stats,
                conn_id,
            );
        }

        for (_, conn) in self.connections.iter_mut() {
            conn.pipeline.disable_keep_alive();
        }
    }

    /// Run until there is nothing left that keeps the loop alive: no
    /// listener, no distribution channel, and no connection with work in
    /// progress. Idle keep-alive connections do not count.
    pub fn run(&mut self) -> Result<(), ServerError> {
        while self.is_active() {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Wait for readiness at most `timeout` (bounded by the next idle
    /// expiry) and handle whatever is ready.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        let keep_alive = self.config.keep_alive_duration();
        let now = Instant::now();
        let timeout = match (timeout, next_idle_deadline(&self.connections, keep_alive)) {
            (timeout, None) => timeout,
            (None, Some(at)) => Some(at.saturating_duration_since(now)),
            (Some(timeout), Some(at)) => Some(timeout.min(at.saturating_duration_since(now))),
        };

        let ready = self
            .event_loop
            .poll(timeout)
            .map_err(ServerError::EventLoop)?;

        for ready in ready {
            match TokenKind::classify(ready.token) {
                TokenKind::Listener => self.accept_connections(),
                TokenKind::Channel => self.receive_handles(),
                TokenKind::Connection(conn_id) => handle_connection_event(
                    conn_id,
                    ready,
                    self.event_loop.registry(),
                    &mut self.connections,
                    &mut self.read_buf,
                    &mut *self.handler,
                    &mut self.stats,
                ),
            }
        }

        self.reap_idle(Instant::now());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.listener.is_some()
            || self.channel_attached
            || self.connections.iter().any(|(_, conn)| !conn.is_idle())
    }

    fn reap_idle(&mut self, now: Instant) -> usize {
        reap_idle(
            self.event_loop.registry(),
            &mut self.connections,
            &mut self.stats,
            now,
            self.config.keep_alive_duration(),
        )
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    self.stats.accepted += 1;
                    debug!(peer = %peer, "Accepted connection");
                    self.route(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    let dropped_by_peer = is_connection_error(&e);
                    let err = ServerError::Accept(e);
                    (self.handler)(ConnectionResult::Error(&err));
                    if dropped_by_peer {
                        continue;
                    }
                    // Out of descriptors or similar: the backlog may still
                    // hold connections, so have the next poll report the
                    // listener again instead of waiting for a new arrival.
                    if let Some(listener) = self.listener.as_mut() {
                        if let Err(e) = self.event_loop.registry().reregister(
                            listener,
                            LISTENER_TOKEN,
                            Interest::READABLE,
                        ) {
                            warn!(error = %e, "Failed to re-arm listener");
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Forward to a worker if this process distributes, otherwise serve.
    fn route(&mut self, stream: TcpStream, peer: SocketAddr) {
        let stream = match self.cluster.distributor_mut() {
            Some(distributor) => match distributor.dispatch(stream) {
                Ok(worker) => {
                    self.stats.dispatched += 1;
                    self.stats.destroyed += 1;
                    debug!(worker, peer = %peer, "Connection dispatched");
                    return;
                }
                Err(failed) => {
                    warn!(
                        worker = failed.worker,
                        peer = %peer,
                        error = %failed.error,
                        "Dispatch failed, serving connection locally"
                    );
                    failed.handle
                }
            },
            None => stream,
        };

        self.start_connection(stream, peer);
    }

    /// Enter a connection into the pipeline.
    fn start_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.config.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let pipeline = Pipeline::new(self.config.keep_alive_policy(), self.config.max_head_size);
        let conn = Connection::new(stream, peer, pipeline, self.config.buffer_size);
        let Some(conn_id) = self.connections.insert(conn) else {
            warn!(peer = %peer, "Connection limit reached");
            self.stats.destroyed += 1;
            let err = ServerError::Accept(io::Error::new(
                io::ErrorKind::Other,
                "connection limit reached",
            ));
            (self.handler)(ConnectionResult::Error(&err));
            return;
        };

        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        if self.config.keep_alive_enabled() {
            if let Err(e) = enable_tcp_keepalive(&conn.stream, self.config.keep_alive_duration()) {
                warn!(conn_id, peer = %peer, error = %e, "Failed to enable TCP keep-alive");
                conn.pipeline
                    .abort(ServerError::KeepAliveSetup(e), &mut *self.handler);
                close_connection(
                    self.event_loop.registry(),
                    &mut self.connections,
                    &mut self.stats,
                    conn_id,
                );
                return;
            }
        }

        if let Err(e) = self.event_loop.registry().register(
            &mut conn.stream,
            connection_token(conn_id),
            Interest::READABLE,
        ) {
            warn!(conn_id, error = %e, "Failed to register connection");
            conn.pipeline
                .abort(ServerError::EventLoop(e), &mut *self.handler);
            close_connection(
                self.event_loop.registry(),
                &mut self.connections,
                &mut self.stats,
                conn_id,
            );
            return;
        }

        conn.pipeline.start();
        debug!(conn_id, peer = %peer, "Connection started");

        settle_connection(
            conn_id,
            self.event_loop.registry(),
            &mut self.connections,
            &mut self.stats,
            Instant::now(),
        );
    }

    /// Take connections the master sent over the distribution channel.
    fn receive_handles(&mut self) {
        loop {
            let Cluster::Worker(channel) = &self.cluster else {
                return;
            };

            match channel.recv_handle() {
                Ok(Some(fd)) => {
                    let stream = std::net::TcpStream::from(fd);
                    let peer = match stream
                        .set_nonblocking(true)
                        .and_then(|()| stream.peer_addr())
                    {
                        Ok(peer) => peer,
                        Err(e) => {
                            debug!(error = %e, "Dropping received connection");
                            continue;
                        }
                    };
                    self.stats.accepted += 1;
                    debug!(peer = %peer, "Received connection");
                    self.start_connection(TcpStream::from_std(stream), peer);
                }
                Ok(None) => {
                    info!("Distribution channel closed");
                    self.detach_channel();
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Receiving connection failed");
                    self.detach_channel();
                    return;
                }
            }
        }
    }

    fn detach_channel(&mut self) {
        if !self.channel_attached {
            return;
        }
        if let Cluster::Worker(channel) = &self.cluster {
            let fd = channel.as_raw_fd();
            let _ = self.event_loop.registry().deregister(&mut SourceFd(&fd));
        }
        self.channel_attached = false;
    }
}

/// Create a non-blocking TCP socket bound to `addr`.
fn bind_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn enable_tcp_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Accept failures caused by a single pending connection going away. The
/// rest of the backlog is unaffected, so accepting can carry on.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    ) || e.raw_os_error() == Some(libc::EPROTO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HandleChannel, UnixChannel};
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::os::fd::RawFd;
    use std::rc::Rc;

    type ErrorLog = Rc<RefCell<Vec<String>>>;

    fn hello_handler(errors: ErrorLog) -> impl FnMut(ConnectionResult<'_>) + 'static {
        move |result| match result {
            ConnectionResult::Success(req, res) => {
                if req.target() == "/chunked" {
                    res.set_header("transfer-encoding", "chunked");
                    res.write("ab");
                    res.end();
                } else {
                    res.set_header("content-type", "text/plain");
                    res.send("hi");
                }
            }
            ConnectionResult::Error(e) => errors.borrow_mut().push(e.to_string()),
        }
    }

    fn listening_server(config: ServerConfig, cluster: Cluster) -> (Server, SocketAddr, ErrorLog) {
        let errors = ErrorLog::default();
        let mut server = Server::new(config, cluster, hello_handler(Rc::clone(&errors))).unwrap();
        let addr = server.bind("127.0.0.1:0").unwrap();
        server.listen().unwrap();
        (server, addr, errors)
    }

    /// Drive the server until `done` holds for what the client has read, or
    /// the client sees EOF. Returns the bytes and whether EOF was seen.
    fn drive(
        server: &mut Server,
        client: &mut std::net::TcpStream,
        done: impl Fn(&[u8]) -> bool,
    ) -> (Vec<u8>, bool) {
        client.set_nonblocking(true).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..400 {
            server.run_once(Some(Duration::from_millis(5))).unwrap();
            loop {
                match client.read(&mut buf) {
                    Ok(0) => return (received, true),
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
            if done(&received) {
                return (received, false);
            }
        }
        (received, false)
    }

    fn ends_with(suffix: &'static [u8]) -> impl Fn(&[u8]) -> bool {
        move |buf| buf.ends_with(suffix)
    }

    fn never(_: &[u8]) -> bool {
        false
    }

    #[test]
    fn test_buffered_response_keeps_connection() {
        let (mut server, addr, errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let (received, eof) = drive(&mut server, &mut client, ends_with(b"hi"));

        assert_eq!(
            received,
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\nhi"
        );
        assert!(!eof);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.stats().requests, 1);
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_chunked_response() {
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /chunked HTTP/1.1\r\n\r\n").unwrap();

        let (received, _) = drive(&mut server, &mut client, ends_with(b"0\r\n\r\n"));

        assert_eq!(
            received,
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n2\r\nab\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn test_keep_alive_reuses_connection() {
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&mut server, &mut client, ends_with(b"hi"));
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let (received, eof) = drive(&mut server, &mut client, ends_with(b"hi"));

        assert!(!eof);
        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.destroyed, 0);
    }

    #[test]
    fn test_pipelined_requests_on_one_connection() {
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\nGET /chunked HTTP/1.1\r\n\r\n")
            .unwrap();

        let (received, _) = drive(&mut server, &mut client, ends_with(b"0\r\n\r\n"));

        let text = String::from_utf8(received).unwrap();
        let first = text.find("\r\n\r\nhi").unwrap();
        let second = text.find("transfer-encoding: chunked").unwrap();
        assert!(first < second);
        assert_eq!(server.stats().requests, 2);
    }

    #[test]
    fn test_keep_alive_disabled_closes_after_response() {
        let config = ServerConfig {
            keep_alive_timeout: 0,
            ..ServerConfig::default()
        };
        let (mut server, addr, _errors) = listening_server(config, Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let (received, eof) = drive(&mut server, &mut client, never);

        assert!(eof);
        assert!(received.ends_with(b"hi"));
        assert_eq!(server.stats().destroyed, 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_malformed_request_gets_500_and_close() {
        let (mut server, addr, errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"\x00\x01 nonsense\r\n\r\n").unwrap();

        let (received, eof) = drive(&mut server, &mut client, never);

        assert!(eof);
        let text = String::from_utf8(received).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.ends_with("500 Internal Server Error"));
        assert_eq!(errors.borrow().len(), 1);
        assert!(errors.borrow()[0].starts_with("parse failed"));
        assert_eq!(server.stats().destroyed, 1);
    }

    #[test]
    fn test_client_eof_destroys_once_without_error() {
        let (mut server, addr, errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let client = std::net::TcpStream::connect(addr).unwrap();

        for _ in 0..100 {
            server.run_once(Some(Duration::from_millis(5))).unwrap();
            if server.connection_count() == 1 {
                break;
            }
        }
        drop(client);
        for _ in 0..100 {
            server.run_once(Some(Duration::from_millis(5))).unwrap();
            if server.connection_count() == 0 {
                break;
            }
        }

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.destroyed, 1);
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_idle_connection_reaped_after_timeout() {
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&mut server, &mut client, ends_with(b"hi"));
        assert_eq!(server.connection_count(), 1);

        assert_eq!(server.reap_idle(Instant::now()), 0);
        assert_eq!(server.reap_idle(Instant::now() + Duration::from_secs(16)), 1);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.stats().destroyed, 1);
    }

    #[test]
    fn test_idle_clock_restarts_on_each_request() {
        let config = ServerConfig {
            keep_alive_timeout: 1,
            ..ServerConfig::default()
        };
        let (mut server, addr, _errors) = listening_server(config, Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&mut server, &mut client, ends_with(b"hi"));
        std::thread::sleep(Duration::from_millis(700));
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let (_, eof) = drive(&mut server, &mut client, ends_with(b"hi"));
        assert!(!eof);

        // Measured from the second response, the timeout is still well away.
        assert_eq!(server.reap_idle(Instant::now() + Duration::from_millis(500)), 0);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.reap_idle(Instant::now() + Duration::from_millis(1100)), 1);
    }

    #[test]
    fn test_reset_by_peer_reports_one_read_error() {
        let (mut server, addr, errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&mut server, &mut client, ends_with(b"hi"));
        assert_eq!(server.connection_count(), 1);

        // A zero linger turns the close into a reset.
        SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        for _ in 0..100 {
            server.run_once(Some(Duration::from_millis(5))).unwrap();
            if server.connection_count() == 0 {
                break;
            }
        }

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.stats().destroyed, 1);
        assert_eq!(errors.borrow().len(), 1);
        assert!(errors.borrow()[0].starts_with("read failed"));
    }

    #[test]
    fn test_unread_responses_pause_reading() {
        let config = ServerConfig {
            keepalive_requests: 0,
            buffer_size: 1024,
            ..ServerConfig::default()
        };
        let (mut server, addr, errors) = listening_server(config, Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();

        let request = b"GET / HTTP/1.1\r\n\r\n";
        let stream = request.repeat(20_000);
        let mut offset = 0;
        let mut written = 0;
        let mut stalled = 0;

        // Pipeline requests without ever reading the answers. Once the
        // server stops taking input the client's writes stall.
        for _ in 0..10_000 {
            match client.write(&stream[offset..]) {
                Ok(n) => {
                    written += n;
                    offset = (offset + n) % stream.len();
                    stalled = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => stalled += 1,
                Err(e) => panic!("client write failed: {e}"),
            }
            server.run_once(Some(Duration::from_millis(1))).unwrap();
            if stalled >= 20 {
                break;
            }
        }
        assert!(stalled >= 20);

        let pending: usize = server.connections.iter().map(|(_, c)| c.outbound.len()).sum();
        assert!(pending < 8 * 1024, "{pending} bytes queued");
        assert_eq!(server.connection_count(), 1);

        // Reading the answers lets the server pick up where it left off.
        let total = (written / request.len()) as u64;
        let mut buf = vec![0u8; 64 * 1024];
        for _ in 0..20_000 {
            server.run_once(Some(Duration::from_millis(1))).unwrap();
            loop {
                match client.read(&mut buf) {
                    Ok(0) => panic!("server closed the connection"),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
            if server.stats().requests >= total {
                break;
            }
        }
        assert_eq!(server.stats().requests, total);
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_connection_limit_reports_accept_error() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let (mut server, addr, errors) = listening_server(config, Cluster::Standalone);
        let mut first = std::net::TcpStream::connect(addr).unwrap();
        first.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&mut server, &mut first, ends_with(b"hi"));

        let mut second = std::net::TcpStream::connect(addr).unwrap();
        let (received, eof) = drive(&mut server, &mut second, never);

        assert!(eof);
        assert!(received.is_empty());
        assert_eq!(
            *errors.borrow(),
            vec!["accept failed: connection limit reached".to_string()]
        );
        let stats = server.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_accept_error_classification() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
        ] {
            assert!(is_connection_error(&io::Error::from(kind)));
        }
        assert!(is_connection_error(&io::Error::from_raw_os_error(libc::EPROTO)));

        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::ENOBUFS)));
    }

    #[test]
    fn test_close_stops_run_with_idle_connections() {
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::Standalone);
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&mut server, &mut client, ends_with(b"hi"));

        server.close();

        assert!(!server.is_listening());
        assert_eq!(server.connection_count(), 0);
        server.run().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_bind_and_listen_errors() {
        let (_server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::Standalone);

        let mut other = Server::new(ServerConfig::default(), Cluster::Standalone, |_| {}).unwrap();
        assert!(matches!(other.listen(), Err(ServerError::Listen(_))));
        assert!(matches!(
            other.bind("not an address"),
            Err(ServerError::Bind(_))
        ));
        assert!(matches!(
            other.bind(&addr.to_string()),
            Err(ServerError::Bind(_))
        ));

        let mut third = Server::new(ServerConfig::default(), Cluster::Standalone, |_| {}).unwrap();
        third.bind("127.0.0.1:0").unwrap();
        assert!(matches!(third.bind("127.0.0.1:0"), Err(ServerError::Bind(_))));
        third.listen().unwrap();
        assert!(matches!(third.listen(), Err(ServerError::Listen(_))));
    }

    struct Recorder {
        id: usize,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl HandleChannel for Recorder {
        fn send_handle(&mut self, _fd: RawFd) -> io::Result<()> {
            self.log.borrow_mut().push(self.id);
            Ok(())
        }
    }

    struct Refusing;

    impl HandleChannel for Refusing {
        fn send_handle(&mut self, _fd: RawFd) -> io::Result<()> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_master_distributes_round_robin() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let workers: Vec<Box<dyn HandleChannel>> = (0..3)
            .map(|id| {
                Box::new(Recorder {
                    id,
                    log: Rc::clone(&log),
                }) as Box<dyn HandleChannel>
            })
            .collect();
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::master(workers));

        let mut clients = Vec::new();
        for _ in 0..7 {
            clients.push(std::net::TcpStream::connect(addr).unwrap());
            for _ in 0..100 {
                server.run_once(Some(Duration::from_millis(5))).unwrap();
                if server.stats().dispatched as usize == clients.len() {
                    break;
                }
            }
        }

        assert_eq!(*log.borrow(), vec![0, 1, 2, 0, 1, 2, 0]);
        let stats = server.stats();
        assert_eq!(stats.accepted, 7);
        assert_eq!(stats.dispatched, 7);
        assert_eq!(stats.destroyed, 7);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_dispatch_failure_serves_locally() {
        let workers: Vec<Box<dyn HandleChannel>> = vec![Box::new(Refusing)];
        let (mut server, addr, _errors) = listening_server(ServerConfig::default(), Cluster::master(workers));
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let (received, _) = drive(&mut server, &mut client, ends_with(b"hi"));

        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(server.stats().dispatched, 0);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_worker_serves_received_connection() {
        let (mut master_end, worker_end) = UnixChannel::pair().unwrap();
        let errors = ErrorLog::default();
        let mut worker = Server::new(
            ServerConfig::default(),
            Cluster::worker(worker_end),
            hello_handler(Rc::clone(&errors)),
        )
        .unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        master_end.send_handle(accepted.as_raw_fd()).unwrap();
        drop(accepted);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let (received, _) = drive(&mut worker, &mut client, ends_with(b"hi"));

        assert_eq!(
            received,
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\nhi"
        );
        assert_eq!(worker.stats().accepted, 1);

        // Master hangs up: only the idle connection remains, so run returns.
        drop(master_end);
        worker.run().unwrap();
        assert_eq!(worker.connection_count(), 1);
    }
}
