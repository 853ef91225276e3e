//! Core of a dual-protocol (TCP/UDP) port-forwarding proxy, meant to be embedded into a larger
//! process. See `SPEC_FULL.md` for the full design; in short:
//!
//! - [`provider`] is the one injection point between relay logic and real sockets.
//! - [`relay::tcp::TcpRelay`] and [`relay::udp::UdpRelay`] each own one listen port.
//! - [`supervisor::ProxySupervisor`] owns a set of relays built from a channel list.
//! - [`config`] turns the channel grammar into the `ChannelDescriptor`s the supervisor consumes.

pub mod config;
pub mod provider;
pub mod relay;
pub mod supervisor;

pub use config::{ChannelDescriptor, Protocol};
pub use provider::NetworkProvider;
pub use supervisor::ProxySupervisor;
