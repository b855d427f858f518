//! Container and connection configuration.

use std::time::Duration;

use crate::reconnect::ReconnectPolicy;
use crate::tls::CertificateData;

/// Receive iterations per readiness event before moving on to the next descriptor.
pub const DEFAULT_MAX_READS_PER_EVENT: usize = 10;

/// Poll loop configuration.
///
/// # Examples
///
/// ```
/// use streamconn_core::options::ContainerConfig;
/// use std::time::Duration;
///
/// let config = ContainerConfig::default()
///     .with_cycle_time(Duration::from_millis(1))
///     .with_check_reconnect_interval(Duration::from_millis(1));
/// assert_eq!(config.max_reads_per_event, 10);
/// ```
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Poll timeout of one loop iteration.
    ///
    /// Bounds how long the loop thread sleeps when nothing is ready, and
    /// therefore how late a termination request or reconnect check can be.
    pub cycle_time: Duration,

    /// How often outgoing connections waiting to reconnect are scanned.
    pub check_reconnect_interval: Duration,

    /// Backlog passed to `listen`.
    pub listen_backlog: i32,

    /// Upper bound for one receive call of the framed container.
    pub read_chunk_size: usize,

    /// Events fetched per poller wait.
    pub max_events: usize,

    /// Receive iterations per readiness event. Keeps one busy connection
    /// from starving the others sharing a loop pass.
    pub max_reads_per_event: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cycle_time: Duration::from_millis(100),
            check_reconnect_interval: Duration::from_millis(1000),
            listen_backlog: libc::SOMAXCONN,
            read_chunk_size: 64 * 1024,
            max_events: crate::poller::DEFAULT_MAX_EVENTS,
            max_reads_per_event: DEFAULT_MAX_READS_PER_EVENT,
        }
    }
}

impl ContainerConfig {
    #[must_use]
    pub const fn with_cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time = cycle_time;
        self
    }

    #[must_use]
    pub const fn with_check_reconnect_interval(mut self, interval: Duration) -> Self {
        self.check_reconnect_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    #[must_use]
    pub const fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    #[must_use]
    pub const fn with_max_reads_per_event(mut self, reads: usize) -> Self {
        self.max_reads_per_event = reads;
        self
    }
}

/// Options of one outgoing connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Reconnect behavior while the connection is being established.
    pub reconnect: ReconnectPolicy,
    /// TLS material; `None` connects in plain text.
    pub tls: Option<CertificateData>,
}

impl ConnectOptions {
    /// Retry a failed connect every `interval`.
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect.interval = Some(interval);
        self
    }

    /// Stop retrying once `total` has elapsed since the first failure.
    #[must_use]
    pub fn with_total_reconnect_duration(mut self, total: Duration) -> Self {
        self.reconnect.total_duration = Some(total);
        self
    }

    #[must_use]
    pub fn with_tls(mut self, certificate_data: CertificateData) -> Self {
        self.tls = Some(certificate_data);
        self
    }
}
