//! Multi-process cluster support.
//!
//! In cluster mode a master process accepts connections and hands each raw
//! socket descriptor to a worker process over a Unix domain socket
//! (`SCM_RIGHTS`). Workers are picked round-robin. The hand-off is
//! fire-and-forget: the master closes its copy of the descriptor as soon as
//! the send succeeds and the connection belongs to the worker from then on.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

/// Something a socket descriptor can be sent through.
pub trait HandleChannel {
    /// Transmit `fd` without waiting for the receiver. Must not block.
    fn send_handle(&mut self, fd: RawFd) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// One end of a master/worker descriptor channel.
#[derive(Debug)]
pub struct UnixChannel {
    stream: UnixStream,
}

impl UnixChannel {
    /// A connected pair: keep one end in the master, give the other to a
    /// worker.
    pub fn pair() -> io::Result<(UnixChannel, UnixChannel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((UnixChannel { stream: a }, UnixChannel { stream: b }))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    /// Receive one descriptor. `Ok(None)` means the master hung up.
    pub fn recv_handle(&self) -> io::Result<Option<OwnedFd>> {
        recv_fd(self.stream.as_raw_fd())
    }
}

impl From<OwnedFd> for UnixChannel {
    fn from(fd: OwnedFd) -> Self {
        UnixChannel {
            stream: UnixStream::from(fd),
        }
    }
}

impl AsRawFd for UnixChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl HandleChannel for UnixChannel {
    fn send_handle(&mut self, fd: RawFd) -> io::Result<()> {
        send_fd(self.stream.as_raw_fd(), fd)
    }
}

/// Control message buffer, 8-byte aligned and large enough for one fd.
type CmsgBuffer = [u64; 4];

fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };
    let mut control: CmsgBuffer = [0; 4];

    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    if space > mem::size_of_val(&control) {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "control buffer too small",
        ));
    }

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "no room for control message"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
    }

    let sent = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_fd(socket: RawFd) -> io::Result<Option<OwnedFd>> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };
    let mut control: CmsgBuffer = [0; 4];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let received = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received == 0 {
        return Ok(None);
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                return Ok(Some(OwnedFd::from_raw_fd(fd)));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "message carried no socket handle",
    ))
}

/// A failed hand-off. The caller gets the handle back.
#[derive(Debug)]
pub struct DispatchError<S> {
    pub handle: S,
    pub worker: usize,
    pub error: io::Error,
}

/// Round-robin assignment of accepted connections to workers.
pub struct Distributor {
    workers: Vec<Box<dyn HandleChannel>>,
    next: usize,
}

impl Distributor {
    pub fn new(workers: Vec<Box<dyn HandleChannel>>) -> Self {
        Self { workers, next: 0 }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Index of the worker the next connection goes to.
    pub fn next_worker(&self) -> usize {
        self.next
    }

    /// Send `handle` to the next worker and drop the local copy.
    ///
    /// The counter advances whether or not the send succeeds. On failure the
    /// handle is returned so the caller can serve it itself.
    pub fn dispatch<S: AsRawFd>(&mut self, handle: S) -> Result<usize, DispatchError<S>> {
        if self.workers.is_empty() {
            return Err(DispatchError {
                handle,
                worker: 0,
                error: io::Error::new(io::ErrorKind::NotFound, "no workers registered"),
            });
        }

        let worker = self.next;
        self.next = (self.next + 1) % self.workers.len();

        match self.workers[worker].send_handle(handle.as_raw_fd()) {
            Ok(()) => {
                drop(handle);
                Ok(worker)
            }
            Err(error) => Err(DispatchError {
                handle,
                worker,
                error,
            }),
        }
    }
}

/// Role of this process. Passed to the server at construction.
#[derive(Default)]
pub enum Cluster {
    /// Accept and serve everything locally.
    #[default]
    Standalone,
    /// Accept and forward connections to workers.
    Master(Distributor),
    /// Serve connections received from the master.
    Worker(UnixChannel),
}

impl Cluster {
    pub fn master(workers: Vec<Box<dyn HandleChannel>>) -> Self {
        Cluster::Master(Distributor::new(workers))
    }

    pub fn worker(channel: UnixChannel) -> Self {
        Cluster::Worker(channel)
    }

    pub fn role(&self) -> &'static str {
        match self {
            Cluster::Standalone => "standalone",
            Cluster::Master(_) => "master",
            Cluster::Worker(_) => "worker",
        }
    }

    /// The distributor, if connections should be forwarded.
    pub(crate) fn distributor_mut(&mut self) -> Option<&mut Distributor> {
        match self {
            Cluster::Master(distributor) if !distributor.is_empty() => Some(distributor),
            _ => None,
        }
    }
}
