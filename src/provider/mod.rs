//! The one injection point between the relay logic and the outside world.
//!
//! Both [`TcpRelay`](crate::relay::tcp::TcpRelay) and
//! [`UdpRelay`](crate::relay::udp::UdpRelay) are built against this trait instead of talking to
//! `tokio::net` directly, so the same relay code can run on plain OS sockets ([`os::OsNetworkProvider`])
//! or routed through an overlay network ([`netns::NetnsNetworkProvider`]).

pub mod netns;
pub mod os;

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Abstraction over listening and dialing. Implementations decide how a `listen_port` or
/// `addr` maps onto real sockets — an ordinary bind/connect, or one performed after entering a
/// network namespace, or (in a production host) an overlay network's own userspace stack.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Bind a TCP listener on the given local port.
    async fn listen_tcp(&self, port: u16) -> Result<TcpListener>;

    /// Bind a UDP packet socket on the given local port.
    async fn listen_udp(&self, port: u16) -> Result<UdpSocket>;

    /// Dial a TCP stream to `addr`, failing if it is not established by `deadline`.
    async fn dial_tcp(&self, addr: &str, deadline: Instant) -> Result<TcpStream>;

    /// Open a UDP socket "connected" to `addr` (see `connect(2)` semantics for datagram sockets:
    /// subsequent `send`/`recv` are scoped to this peer).
    async fn dial_udp(&self, addr: &str) -> Result<UdpSocket>;
}
