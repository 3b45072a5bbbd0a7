//! evloop-http: an embeddable HTTP/1.1 server on a single-threaded event loop.
//!
//! - Incremental request parsing with pipelining and chunked request bodies
//! - Buffered and chunked responses built through [`Response`]
//! - Keep-alive with idle reaping and a per-connection request cap
//! - Cluster mode: a master accepts and passes sockets to worker processes
//!   round-robin over Unix domain sockets
//!
//! ```no_run
//! use evloop_http::{Cluster, ConnectionResult, Server, ServerConfig};
//!
//! let mut server = Server::new(ServerConfig::default(), Cluster::Standalone, |result| {
//!     if let ConnectionResult::Success(_req, res) = result {
//!         res.set_header("content-length", "2");
//!         res.send("hi");
//!     }
//! })?;
//! server.bind("127.0.0.1:8080")?;
//! server.listen()?;
//! server.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
mod runtime;
pub mod server;

pub use cluster::{Cluster, DispatchError, Distributor, HandleChannel, UnixChannel};
pub use config::ServerConfig;
pub use error::{ParseError, ServerError};
pub use crate::http::{Headers, Request, Response};
pub use pipeline::{ConnectionResult, ExchangeState};
pub use server::{Handler, Server, ServerStats};
