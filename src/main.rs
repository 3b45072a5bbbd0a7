//! evloop-http demo server
//!
//! Serves a tiny site from one process or, with `--cluster-workers N`, from
//! a master that accepts connections and N worker processes that serve them.
//!
//! Routes:
//! - `/`: buffered plain text
//! - `/chunked`: the same text streamed with chunked transfer-encoding
//! - anything else: 404

use chrono::Utc;
use evloop_http::config::Config;
use evloop_http::http::http_date;
use evloop_http::{Cluster, ConnectionResult, HandleChannel, Server, UnixChannel};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::{Child, Command};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Declared before the server so it is dropped after it: the server owns
    // the channels whose hangup tells the workers to stop.
    let mut children = WorkerProcesses::default();
    let cluster = match config.worker_fd {
        // The fd was handed to us by the master at spawn time.
        Some(fd) => Cluster::worker(UnixChannel::from(unsafe { OwnedFd::from_raw_fd(fd) })),
        None if config.cluster_workers > 0 => {
            Cluster::master(spawn_workers(config.cluster_workers, &mut children)?)
        }
        None => Cluster::Standalone,
    };

    info!(
        listen = %config.listen,
        role = cluster.role(),
        pid = std::process::id(),
        workers = children.len(),
        keep_alive_timeout = config.server.keep_alive_timeout,
        keepalive_requests = config.server.keepalive_requests,
        "Starting evloop-http"
    );

    let is_worker = config.worker_fd.is_some();
    let mut server = Server::new(config.server.clone(), cluster, handle)?;
    if !is_worker {
        server.bind(&config.listen)?;
        server.listen()?;
    }
    server.run()?;

    info!(stats = ?server.stats(), "Server stopped");
    drop(server);
    children.reap();
    Ok(())
}

fn handle(result: ConnectionResult<'_>) {
    match result {
        ConnectionResult::Success(req, res) => {
            let body = format!("hello from pid {}\n", std::process::id());
            match req.target() {
                "/" => {
                    res.set_header("content-type", "text/plain")
                        .set_header("content-length", body.len().to_string())
                        .set_header("date", http_date(Utc::now()));
                    res.send(body);
                }
                "/chunked" => {
                    res.set_header("content-type", "text/plain")
                        .set_header("transfer-encoding", "chunked");
                    for line in body.split_inclusive(' ') {
                        res.write(line.to_string());
                    }
                    res.end();
                }
                _ => {
                    let body = "not found\n";
                    res.set_status(404)
                        .set_header("content-type", "text/plain")
                        .set_header("content-length", body.len().to_string());
                    res.send(body);
                }
            }
        }
        ConnectionResult::Error(e) => debug!(error = %e, "Connection error"),
    }
}

/// Start `count` copies of this binary, each holding one end of a channel
/// pair as `--worker-fd`.
fn spawn_workers(
    count: usize,
    children: &mut WorkerProcesses,
) -> io::Result<Vec<Box<dyn HandleChannel>>> {
    let exe = std::env::current_exe()?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();

    let mut workers: Vec<Box<dyn HandleChannel>> = Vec::with_capacity(count);
    for worker in 0..count {
        let (master_end, worker_end) = UnixChannel::pair()?;
        clear_cloexec(worker_end.as_raw_fd())?;

        let child = Command::new(&exe)
            .args(&args)
            .arg("--worker-fd")
            .arg(worker_end.as_raw_fd().to_string())
            .spawn()?;
        info!(worker, pid = child.id(), "Spawned worker");

        // The child holds its own copy now.
        drop(worker_end);
        workers.push(Box::new(master_end));
        children.0.push(child);
    }
    Ok(workers)
}

/// Worker processes started by the master. Whatever is still running when
/// this is dropped gets waited on.
#[derive(Default)]
struct WorkerProcesses(Vec<Child>);

impl WorkerProcesses {
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Wait for every worker to exit. Returns how many were waited on.
    fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for mut child in self.0.drain(..) {
            let pid = child.id();
            match child.wait() {
                Ok(status) => {
                    info!(pid, %status, "Worker exited");
                    reaped += 1;
                }
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for worker, killing it");
                    let _ = child.kill();
                }
            }
        }
        reaped
    }
}

impl Drop for WorkerProcesses {
    fn drop(&mut self) {
        self.reap();
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
