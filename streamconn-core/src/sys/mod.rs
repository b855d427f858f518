//! System call layer.
//!
//! Every socket and epoll call made by the [`Poller`](crate::poller::Poller)
//! and [`Socket`](crate::socket::Socket) goes through the [`Syscall`] trait.
//! The OS implementation lives in [`OsSyscall`]; [`FaultInjection`] wraps it
//! to fail selected calls on demand, and tests can supply a fully scripted
//! implementation.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Type};

mod fault;
#[cfg(target_os = "linux")]
mod os;

pub use fault::{FaultInjection, SyscallKind};
#[cfg(target_os = "linux")]
pub use os::OsSyscall;

/// Read interest bit of an event mask.
pub const EVENT_READ: u32 = libc::EPOLLIN as u32;
/// Write interest bit of an event mask.
pub const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;
/// Error condition bit of an event mask.
pub const EVENT_ERROR: u32 = libc::EPOLLERR as u32;
/// Hangup bit of an event mask.
pub const EVENT_HANGUP: u32 = libc::EPOLLHUP as u32;

/// Invalid descriptor marker.
pub const INVALID_FD: RawFd = -1;

/// One readiness report as returned by [`Syscall::epoll_wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub events: u32,
}

/// Operation for [`Syscall::epoll_ctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Modify,
    Delete,
}

/// Shared handle to a syscall implementation.
pub type SharedSyscall = Arc<dyn Syscall>;

/// Socket and readiness system calls.
///
/// Implementations must be thread-safe: the poll loop thread and foreign
/// threads call into the same instance.
pub trait Syscall: Send + Sync + std::fmt::Debug {
    fn socket(&self, domain: Domain, ty: Type, protocol: Option<Protocol>) -> io::Result<RawFd>;
    fn bind(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()>;
    fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()>;
    /// Accepts one pending connection; the returned descriptor is non-blocking.
    fn accept(&self, fd: RawFd) -> io::Result<(RawFd, SockAddr)>;
    /// Starts a connect. On a non-blocking descriptor `EINPROGRESS` is
    /// returned as an error and interpreted by the caller.
    fn connect(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()>;
    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&self, fd: RawFd) -> io::Result<()>;

    fn set_nonblocking(&self, fd: RawFd, nonblocking: bool) -> io::Result<()>;
    fn set_nodelay(&self, fd: RawFd, nodelay: bool) -> io::Result<()>;
    fn set_linger(&self, fd: RawFd, linger: Option<Duration>) -> io::Result<()>;
    fn set_reuse_address(&self, fd: RawFd, reuse: bool) -> io::Result<()>;
    /// `getsockname`
    fn local_addr(&self, fd: RawFd) -> io::Result<SockAddr>;
    /// Pending `SO_ERROR`, cleared by the call.
    fn take_error(&self, fd: RawFd) -> io::Result<Option<io::Error>>;

    /// Two connected non-blocking descriptors used to interrupt a wait.
    fn wake_pair(&self) -> io::Result<(RawFd, RawFd)>;

    fn epoll_create(&self) -> io::Result<RawFd>;
    fn epoll_ctl(&self, epfd: RawFd, op: CtlOp, fd: RawFd, events: u32) -> io::Result<()>;
    /// Fills `events` and returns how many were written. A negative timeout
    /// blocks indefinitely.
    fn epoll_wait(&self, epfd: RawFd, events: &mut [ReadyEvent], timeout_ms: i32)
        -> io::Result<usize>;
    /// Bytes readable without blocking (`FIONREAD`).
    fn bytes_available(&self, fd: RawFd) -> io::Result<usize>;
}

/// The platform syscall layer.
#[cfg(target_os = "linux")]
#[must_use]
pub fn os() -> SharedSyscall {
    Arc::new(OsSyscall)
}

/// True for errors that mean "try again once the descriptor is ready".
pub(crate) fn is_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.raw_os_error() == Some(libc::EALREADY)
}
