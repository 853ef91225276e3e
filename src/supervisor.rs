//! Owns every relay started from a channel list and fans `shutdown` out to all of them.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::{error, info};

use crate::config::{ChannelDescriptor, Protocol};
use crate::provider::NetworkProvider;
use crate::relay::tcp::TcpRelay;
use crate::relay::udp::UdpRelay;

enum Relay {
    Tcp(TcpRelay),
    Udp(UdpRelay),
}

impl Relay {
    async fn close(&self) -> Result<()> {
        match self {
            Relay::Tcp(relay) => relay.close().await,
            Relay::Udp(relay) => relay.close().await,
        }
    }
}

/// Composes a `ChannelDescriptor[]` into running relays and owns their lifetime.
pub struct ProxySupervisor {
    relays: Vec<Relay>,
}

impl ProxySupervisor {
    /// Instantiates and starts a relay per descriptor. An unknown protocol, or any relay that
    /// fails to bind, aborts startup: relays already started are closed before the error is
    /// returned.
    pub async fn start(
        provider: Arc<dyn NetworkProvider>,
        channels: Vec<ChannelDescriptor>,
    ) -> Result<Self> {
        info!(count = channels.len(), "starting proxy supervisor");
        let mut relays = Vec::with_capacity(channels.len());

        for channel in channels {
            let target = channel.target();
            let started = match channel.protocol {
                Protocol::Tcp => {
                    TcpRelay::bind(provider.clone(), channel.listen_port, target)
                        .await
                        .map(Relay::Tcp)
                }
                Protocol::Udp => {
                    UdpRelay::bind(provider.clone(), channel.listen_port, target)
                        .await
                        .map(Relay::Udp)
                }
            };

            match started {
                Ok(relay) => relays.push(relay),
                Err(err) => {
                    error!(
                        listen_port = channel.listen_port,
                        %channel.protocol,
                        error = %err,
                        "relay failed to start; rolling back supervisor startup"
                    );
                    let partial = Self { relays };
                    // Best-effort: report the original bind failure even if rollback itself
                    // also fails on the way out.
                    let _ = partial.shutdown().await;
                    return Err(err);
                }
            }
        }

        info!(count = relays.len(), "proxy supervisor started");
        Ok(Self { relays })
    }

    /// Triggers every owned relay's quit signal and waits for each to report completion.
    /// Idempotent: each relay's own `close()` is idempotent, so calling this twice is safe.
    pub async fn shutdown(&self) -> Result<()> {
        let results = join_all(self.relays.iter().map(|relay| relay.close())).await;
        let mut first_err = None;
        for result in results {
            if let Err(err) = result {
                error!(error = %err, "relay failed to shut down cleanly");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}
