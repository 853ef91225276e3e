use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket, lookup_host};
use tokio::time::timeout;

use super::NetworkProvider;

/// Plain OS sockets, bound with `SO_REUSEADDR`/`SO_REUSEPORT` so a relay can be restarted without
/// waiting out `TIME_WAIT`, and so future forks of this process can share a listen port.
#[derive(Debug, Default)]
pub struct OsNetworkProvider;

impl OsNetworkProvider {
    pub fn new() -> Self {
        Self
    }
}

fn reuseport_socket(domain: Domain, ty: Type) -> Result<Socket> {
    let socket = Socket::new(domain, ty, None).context("failed to create socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .context("failed to set SO_REUSEPORT")?;
    socket
        .set_nonblocking(true)
        .context("failed to set socket nonblocking")?;
    Ok(socket)
}

async fn resolve_one(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {addr}"))?
        .next()
        .with_context(|| format!("{addr} resolved to no addresses"))
}

#[async_trait]
impl NetworkProvider for OsNetworkProvider {
    async fn listen_tcp(&self, port: u16) -> Result<TcpListener> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = reuseport_socket(Domain::IPV4, Type::STREAM.nonblocking())
            .context("failed to build tcp listen socket")?;
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind tcp port {port}"))?;
        socket.listen(1024).context("failed to listen")?;
        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener).context("failed to adopt tcp listener into runtime")
    }

    async fn listen_udp(&self, port: u16) -> Result<UdpSocket> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = reuseport_socket(Domain::IPV4, Type::DGRAM.nonblocking())
            .context("failed to build udp listen socket")?;
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind udp port {port}"))?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).context("failed to adopt udp socket into runtime")
    }

    async fn dial_tcp(&self, addr: &str, deadline: Instant) -> Result<TcpStream> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("dial deadline already elapsed for {addr}");
        }
        let resolved = resolve_one(addr).await?;
        let stream = timeout(remaining, TcpStream::connect(resolved))
            .await
            .with_context(|| format!("tcp dial to {addr} timed out"))?
            .with_context(|| format!("tcp dial to {addr} failed"))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn dial_udp(&self, addr: &str) -> Result<UdpSocket> {
        let resolved = resolve_one(addr).await?;
        let unspecified: SocketAddr = match resolved {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => ([0u16; 8], 0).into(),
        };
        let socket = UdpSocket::bind(unspecified)
            .await
            .context("failed to bind udp relay socket")?;
        socket
            .connect(resolved)
            .await
            .with_context(|| format!("failed to connect udp target {addr}"))?;
        Ok(socket)
    }
}
