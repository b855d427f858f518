//! Readiness poller with a cooperative wake channel.
//!
//! One [`Poller`] owns an epoll context. Descriptors are registered with
//! read interest and can toggle write interest on demand. [`Poller::wait`]
//! reports one [`DescriptorInfo`] per ready descriptor, with the pending byte
//! count already queried so the caller does not need a second round trip.
//!
//! Foreign threads interrupt a blocked wait through [`Poller::release_wait`]
//! (or a cloned [`PollWaker`]), which writes one byte into a wake pair whose
//! read end is registered with the poller.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::sys::{
    CtlOp, ReadyEvent, SharedSyscall, EVENT_ERROR, EVENT_HANGUP, EVENT_READ, EVENT_WRITE,
    INVALID_FD,
};

/// Default number of events fetched per wait.
pub const DEFAULT_MAX_EVENTS: usize = 256;

/// Readiness of one descriptor after a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub fd: RawFd,
    pub disconnected: bool,
    pub readable: bool,
    pub writable: bool,
    pub bytes_to_read: usize,
}

/// What a wait produced.
#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing became ready before the timeout.
    Timeout,
    /// The wait call failed for a reason other than interruption.
    Error(io::Error),
    /// Descriptors that became ready. Empty when only the wake channel fired.
    Ready(Vec<DescriptorInfo>),
}

/// Result of [`Poller::wait`].
#[derive(Debug)]
pub struct PollerResult {
    pub outcome: PollOutcome,
    /// The wake channel was signaled during this wait.
    pub release_wait: bool,
}

impl PollerResult {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, PollOutcome::Timeout)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, PollOutcome::Error(_))
    }

    /// Ready descriptors, empty for timeouts and errors.
    #[must_use]
    pub fn descriptors(&self) -> &[DescriptorInfo] {
        match &self.outcome {
            PollOutcome::Ready(infos) => infos,
            _ => &[],
        }
    }
}

#[derive(Debug)]
struct WakeChannel {
    sys: SharedSyscall,
    /// (read end, write end); `None` before init and after teardown.
    fds: RwLock<Option<(RawFd, RawFd)>>,
}

impl WakeChannel {
    fn signal(&self) {
        let fds = self.fds.read();
        let Some((_, write_end)) = *fds else {
            return;
        };
        match self.sys.send(write_end, &[1]) {
            Ok(_) => {}
            // A full pair already guarantees a pending wakeup.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(fd = write_end, error = %e, "wake signal failed"),
        }
    }

    fn read_end(&self) -> RawFd {
        self.fds.read().map_or(INVALID_FD, |(read_end, _)| read_end)
    }

    fn drain(&self) {
        let fds = self.fds.read();
        let Some((read_end, _)) = *fds else {
            return;
        };
        let mut scratch = [0u8; 64];
        loop {
            match self.sys.recv(read_end, &mut scratch) {
                Ok(n) if n == scratch.len() => continue,
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn close(&self) {
        if let Some((read_end, write_end)) = self.fds.write().take() {
            let _ = self.sys.close(read_end);
            let _ = self.sys.close(write_end);
        }
    }
}

/// Thread-safe handle that interrupts a blocked [`Poller::wait`].
///
/// Signaling before the poller is initialized or after it is dropped is a no-op.
#[derive(Debug, Clone)]
pub struct PollWaker(Arc<WakeChannel>);

impl PollWaker {
    pub fn release_wait(&self) {
        self.0.signal();
    }
}

#[derive(Debug)]
struct PollerState {
    epfd: RawFd,
    /// Registered descriptors and their current interest mask.
    interest: HashMap<RawFd, u32>,
}

/// Epoll based readiness multiplexer.
///
/// Registration calls are safe from any thread. `wait` is meant to be
/// called from a single loop thread.
#[derive(Debug)]
pub struct Poller {
    sys: SharedSyscall,
    state: Mutex<PollerState>,
    wake: Arc<WakeChannel>,
    events: Mutex<Vec<ReadyEvent>>,
}

impl Poller {
    #[must_use]
    pub fn new(sys: SharedSyscall) -> Self {
        Self::with_capacity(sys, DEFAULT_MAX_EVENTS)
    }

    /// Poller fetching up to `max_events` events per wait.
    #[must_use]
    pub fn with_capacity(sys: SharedSyscall, max_events: usize) -> Self {
        Self {
            wake: Arc::new(WakeChannel {
                sys: Arc::clone(&sys),
                fds: RwLock::new(None),
            }),
            sys,
            state: Mutex::new(PollerState {
                epfd: INVALID_FD,
                interest: HashMap::new(),
            }),
            events: Mutex::new(vec![ReadyEvent::default(); max_events.max(1)]),
        }
    }

    /// Create the epoll context and register the wake pair.
    ///
    /// Calling `init` on an initialized poller does nothing.
    pub fn init(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.epfd != INVALID_FD {
            return Ok(());
        }

        let epfd = self.sys.epoll_create()?;
        let (read_end, write_end) = match self.sys.wake_pair() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = self.sys.close(epfd);
                return Err(e);
            }
        };
        if let Err(e) = self.sys.epoll_ctl(epfd, CtlOp::Add, read_end, EVENT_READ) {
            let _ = self.sys.close(read_end);
            let _ = self.sys.close(write_end);
            let _ = self.sys.close(epfd);
            return Err(e);
        }

        state.epfd = epfd;
        *self.wake.fds.write() = Some((read_end, write_end));
        debug!(epfd, wake_fd = read_end, "poller initialized");
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().epfd != INVALID_FD
    }

    /// Register `fd` with read interest. Registering twice is a no-op.
    pub fn add_socket(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if state.interest.contains_key(&fd) {
            return;
        }
        match self.sys.epoll_ctl(state.epfd, CtlOp::Add, fd, EVENT_READ) {
            Ok(()) => {
                state.interest.insert(fd, EVENT_READ);
                trace!(fd, "descriptor registered");
            }
            Err(e) => warn!(fd, error = %e, "cannot register descriptor"),
        }
    }

    /// Deregister `fd`. Events already fetched for it may still be reported.
    pub fn remove_socket(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if state.interest.remove(&fd).is_none() {
            return;
        }
        if let Err(e) = self.sys.epoll_ctl(state.epfd, CtlOp::Delete, fd, 0) {
            debug!(fd, error = %e, "deregister failed");
        }
    }

    pub fn enable_write(&self, fd: RawFd) {
        self.set_interest(fd, EVENT_READ | EVENT_WRITE);
    }

    pub fn disable_write(&self, fd: RawFd) {
        self.set_interest(fd, EVENT_READ);
    }

    fn set_interest(&self, fd: RawFd, mask: u32) {
        let mut state = self.state.lock();
        let epfd = state.epfd;
        let Some(current) = state.interest.get_mut(&fd) else {
            trace!(fd, "interest change for unregistered descriptor");
            return;
        };
        if *current == mask {
            return;
        }
        match self.sys.epoll_ctl(epfd, CtlOp::Modify, fd, mask) {
            Ok(()) => *current = mask,
            Err(e) => warn!(fd, error = %e, "cannot change interest"),
        }
    }

    /// Whether `fd` currently has write interest.
    #[must_use]
    pub fn is_write_enabled(&self, fd: RawFd) -> bool {
        self.state
            .lock()
            .interest
            .get(&fd)
            .is_some_and(|mask| mask & EVENT_WRITE != 0)
    }

    /// Block until a descriptor is ready, the wake channel fires or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> PollerResult {
        let epfd = self.state.lock().epfd;
        if epfd == INVALID_FD {
            return PollerResult {
                outcome: PollOutcome::Error(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "poller not initialized",
                )),
                release_wait: false,
            };
        }

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut events = self.events.lock();
        let count = loop {
            match self.sys.epoll_wait(epfd, &mut events, timeout_ms) {
                Ok(count) => break count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(epfd, error = %e, "poller wait failed");
                    return PollerResult {
                        outcome: PollOutcome::Error(e),
                        release_wait: false,
                    };
                }
            }
        };

        if count == 0 {
            return PollerResult {
                outcome: PollOutcome::Timeout,
                release_wait: false,
            };
        }

        let wake_fd = self.wake.read_end();
        let mut release_wait = false;
        let mut infos = Vec::with_capacity(count);
        for event in &events[..count] {
            if event.fd == wake_fd {
                release_wait = true;
                self.wake.drain();
                continue;
            }
            infos.push(self.describe(*event));
        }

        PollerResult {
            outcome: PollOutcome::Ready(infos),
            release_wait,
        }
    }

    fn describe(&self, event: ReadyEvent) -> DescriptorInfo {
        let mut info = DescriptorInfo {
            fd: event.fd,
            disconnected: event.events & (EVENT_ERROR | EVENT_HANGUP) != 0,
            readable: event.events & EVENT_READ != 0,
            writable: event.events & EVENT_WRITE != 0,
            bytes_to_read: 0,
        };
        if info.readable {
            match self.sys.bytes_available(event.fd) {
                Ok(0) => info.disconnected = true,
                Ok(n) => info.bytes_to_read = n,
                // Listening sockets do not support FIONREAD.
                Err(e) => trace!(fd = event.fd, error = %e, "pending byte query failed"),
            }
        }
        info
    }

    /// Wake a blocked [`wait`](Self::wait). Callable from any thread.
    pub fn release_wait(&self) {
        self.wake.signal();
    }

    /// Handle for waking this poller from other threads.
    #[must_use]
    pub fn waker(&self) -> PollWaker {
        PollWaker(Arc::clone(&self.wake))
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.wake.close();
        let epfd = std::mem::replace(&mut self.state.get_mut().epfd, INVALID_FD);
        if epfd != INVALID_FD {
            let _ = self.sys.close(epfd);
        }
    }
}
