//! Overlay-network stand-in: a `NetworkProvider` that performs every bind/dial inside a named
//! Linux network namespace instead of the caller's default one.
//!
//! A production host would swap this for a client of whatever overlay network it embeds (a mesh
//! VPN's userspace stack, for instance); the namespace-entry approach here is a complete,
//! testable substitute for the same contract: "binds and dials land on a different network than
//! the one this process would otherwise see".

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::spawn_blocking;

use super::NetworkProvider;

const CURRENT_NET_NS: &str = "/proc/self/ns/net";

/// Identifies the namespace to enter: either a name resolved under `/var/run/netns`, exactly as
/// `ip netns` would, or an explicit path to a namespace handle file.
#[derive(Debug, Clone)]
pub enum NamespaceRef {
    Named(String),
    Path(PathBuf),
}

impl NamespaceRef {
    fn resolve(&self) -> PathBuf {
        match self {
            NamespaceRef::Named(name) => PathBuf::from("/var/run/netns").join(name),
            NamespaceRef::Path(path) => path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetnsNetworkProvider {
    namespace: NamespaceRef,
}

impl NetnsNetworkProvider {
    pub fn new(namespace: NamespaceRef) -> Self {
        Self { namespace }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(NamespaceRef::Named(name.into()))
    }
}

/// Runs `f` with the calling (blocking-pool) thread temporarily moved into the target namespace,
/// restoring the thread's original namespace afterward regardless of whether `f` succeeded.
#[cfg(target_os = "linux")]
fn in_namespace<T>(ns_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    use nix::sched::{CloneFlags, setns};

    let original = File::open(CURRENT_NET_NS).context("failed to open current network namespace")?;
    let target = File::open(ns_path)
        .with_context(|| format!("failed to open namespace file {}", ns_path.display()))?;

    setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
        .with_context(|| format!("setns failed for {}", ns_path.display()))?;

    let result = f();

    // Best-effort restore: a failure here would strand the blocking-pool thread in the wrong
    // namespace for whatever task the pool hands it next, so it is always attempted even if `f`
    // itself failed.
    if let Err(err) = setns(original.as_fd(), CloneFlags::CLONE_NEWNET) {
        tracing::error!(error = %err, "failed to restore original network namespace on blocking thread");
    }

    result
}

#[cfg(not(target_os = "linux"))]
fn in_namespace<T>(_ns_path: &Path, _f: impl FnOnce() -> Result<T>) -> Result<T> {
    bail!("network namespaces are unsupported on this platform")
}

#[async_trait]
impl NetworkProvider for NetnsNetworkProvider {
    async fn listen_tcp(&self, port: u16) -> Result<TcpListener> {
        let ns_path = self.namespace.resolve();
        let std_listener = spawn_blocking(move || {
            in_namespace(&ns_path, || {
                std::net::TcpListener::bind(("0.0.0.0", port))
                    .with_context(|| format!("failed to bind tcp port {port} in namespace"))
            })
        })
        .await
        .context("namespace bind task panicked")??;
        std_listener.set_nonblocking(true)?;
        TcpListener::from_std(std_listener).context("failed to adopt tcp listener into runtime")
    }

    async fn listen_udp(&self, port: u16) -> Result<UdpSocket> {
        let ns_path = self.namespace.resolve();
        let std_socket = spawn_blocking(move || {
            in_namespace(&ns_path, || {
                std::net::UdpSocket::bind(("0.0.0.0", port))
                    .with_context(|| format!("failed to bind udp port {port} in namespace"))
            })
        })
        .await
        .context("namespace bind task panicked")??;
        std_socket.set_nonblocking(true)?;
        UdpSocket::from_std(std_socket).context("failed to adopt udp socket into runtime")
    }

    async fn dial_tcp(&self, addr: &str, deadline: Instant) -> Result<TcpStream> {
        let ns_path = self.namespace.resolve();
        let addr = addr.to_string();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("dial deadline already elapsed for {addr}");
        }
        let std_stream = spawn_blocking(move || {
            in_namespace(&ns_path, || {
                let target = std::net::ToSocketAddrs::to_socket_addrs(&addr)
                    .with_context(|| format!("failed to resolve {addr}"))?
                    .next()
                    .with_context(|| format!("{addr} resolved to no addresses"))?;
                std::net::TcpStream::connect_timeout(&target, remaining)
                    .with_context(|| format!("tcp dial to {addr} failed"))
            })
        })
        .await
        .context("namespace dial task panicked")??;
        std_stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std_stream)?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn dial_udp(&self, addr: &str) -> Result<UdpSocket> {
        let ns_path = self.namespace.resolve();
        let addr = addr.to_string();
        let std_socket = spawn_blocking(move || {
            in_namespace(&ns_path, || {
                let target = std::net::ToSocketAddrs::to_socket_addrs(&addr)
                    .with_context(|| format!("failed to resolve {addr}"))?
                    .next()
                    .with_context(|| format!("{addr} resolved to no addresses"))?;
                let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))
                    .context("failed to bind udp relay socket in namespace")?;
                socket
                    .connect(target)
                    .with_context(|| format!("failed to connect udp target {addr}"))?;
                Ok(socket)
            })
        })
        .await
        .context("namespace dial task panicked")??;
        std_socket.set_nonblocking(true)?;
        UdpSocket::from_std(std_socket).context("failed to adopt udp socket into runtime")
    }
}
