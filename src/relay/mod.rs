pub mod tcp;
pub mod udp;

use std::time::Duration;

use tokio::sync::watch;

/// Dial deadline for a freshly accepted TCP session's upstream connection.
pub const TCP_DIAL_DEADLINE: Duration = Duration::from_secs(4);

/// Upper bound on how long a TCP session may keep draining once one side has finished, or once
/// shutdown has been requested.
pub const TCP_FORCE_CLOSE_DEADLINE: Duration = Duration::from_secs(90);

/// Idle threshold past which a UDP session is evicted, and the interval the garbage-collection
/// pass runs on.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Capacity of the bounded channels used to fan packets between a relay's reader/writer tasks.
/// Small and bounded so a stalled peer applies backpressure instead of growing memory without
/// bound.
pub const CHANNEL_CAPACITY: usize = 32;

/// Size of the scratch buffer each UDP read is performed into.
pub const UDP_READ_BUFFER: usize = 16 * 1024;

/// Tunable timeouts for a `TcpRelay`. Defaults match the constants above; tests shrink them so
/// forced-close and eviction behavior shows up in milliseconds instead of real minutes.
#[derive(Debug, Clone, Copy)]
pub struct TcpTimeouts {
    pub dial_deadline: Duration,
    pub force_close_deadline: Duration,
}

impl Default for TcpTimeouts {
    fn default() -> Self {
        Self {
            dial_deadline: TCP_DIAL_DEADLINE,
            force_close_deadline: TCP_FORCE_CLOSE_DEADLINE,
        }
    }
}

/// Tunable timeouts for a `UdpRelay`. See [`TcpTimeouts`].
#[derive(Debug, Clone, Copy)]
pub struct UdpTimeouts {
    pub idle_timeout: Duration,
}

impl Default for UdpTimeouts {
    fn default() -> Self {
        Self {
            idle_timeout: UDP_IDLE_TIMEOUT,
        }
    }
}

pub type ShutdownTx = watch::Sender<bool>;
pub type ShutdownRx = watch::Receiver<bool>;

/// A relay's broadcastable, idempotent one-shot quit signal.
pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Triggers `tx`, tolerating a prior trigger — `watch::Sender::send` itself is idempotent in the
/// sense that resending `true` is a no-op observation-wise, but this helper makes the intent
/// explicit at call sites.
pub fn trigger_shutdown(tx: &ShutdownTx) {
    let _ = tx.send(true);
}

/// True once `trigger_shutdown` has been called on the sending side of this receiver.
pub fn is_shutting_down(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}
