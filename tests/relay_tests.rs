//! Integration tests against real loopback sockets. Timeouts are injected via `TcpTimeouts`/
//! `UdpTimeouts` so forced-close and eviction behavior show up in milliseconds rather than the
//! production defaults.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout};

use relaycore::config::{ChannelDescriptor, Protocol};
use relaycore::provider::NetworkProvider;
use relaycore::provider::os::OsNetworkProvider;
use relaycore::relay::tcp::TcpRelay;
use relaycore::relay::udp::UdpRelay;
use relaycore::relay::{TcpTimeouts, UdpTimeouts};
use relaycore::supervisor::ProxySupervisor;

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// An upstream that waits for the client's first message, sleeps (simulating queued work), then
/// replies — without ever closing its own side of the connection.
async fn spawn_queued_reply_upstream(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if conn.read(&mut buf).await.is_err() {
                    return;
                }
                sleep(Duration::from_millis(80)).await;
                let _ = conn.write_all(reply).await;
                let mut sink = [0u8; 64];
                loop {
                    match conn.read(&mut sink).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    addr
}

type UdpLog = Arc<AsyncMutex<Vec<(SocketAddr, Vec<u8>)>>>;

/// Echoes every datagram back prefixed with `R:`, logging the sender address it observed.
async fn spawn_udp_echo_logger() -> (SocketAddr, UdpLog) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let log: UdpLog = Arc::new(AsyncMutex::new(Vec::new()));
    let log_clone = log.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let data = buf[..n].to_vec();
            log_clone.lock().await.push((src, data.clone()));
            let mut reply = b"R:".to_vec();
            reply.extend_from_slice(&data);
            let _ = socket.send_to(&reply, src).await;
        }
    });
    (addr, log)
}

#[tokio::test]
async fn tcp_echo_roundtrip() {
    let upstream = spawn_tcp_echo().await;
    let provider: Arc<dyn NetworkProvider> = Arc::new(OsNetworkProvider::new());
    let relay = TcpRelay::bind(provider, 0, upstream.to_string())
        .await
        .unwrap();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    client.write_all(b"hello relay").await.unwrap();

    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello relay");

    relay.close().await.unwrap();
}

#[tokio::test]
async fn tcp_half_closed_client_still_receives_queued_reply() {
    let upstream = spawn_queued_reply_upstream(b"QUEUED-REPLY").await;
    let provider: Arc<dyn NetworkProvider> = Arc::new(OsNetworkProvider::new());
    let timeouts = TcpTimeouts {
        dial_deadline: Duration::from_secs(2),
        force_close_deadline: Duration::from_millis(500),
    };
    let relay = TcpRelay::bind_with_timeouts(provider, 0, upstream.to_string(), timeouts)
        .await
        .unwrap();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    client.shutdown().await.unwrap(); // half-close: no further writes from the client

    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"QUEUED-REPLY");

    relay.close().await.unwrap();
}

#[tokio::test]
async fn udp_sessions_preserve_order_and_never_cross_talk() {
    let (upstream_addr, log) = spawn_udp_echo_logger().await;
    let provider: Arc<dyn NetworkProvider> = Arc::new(OsNetworkProvider::new());
    let relay = UdpRelay::bind(provider, 0, upstream_addr.to_string())
        .await
        .unwrap();

    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    for msg in ["1", "2", "3"] {
        client_a
            .send_to(msg.as_bytes(), relay.local_addr())
            .await
            .unwrap();
    }
    client_b
        .send_to(b"B-HELLO", relay.local_addr())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    for expected in ["R:1", "R:2", "R:3"] {
        let (n, _) = timeout(Duration::from_secs(1), client_a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], expected.as_bytes());
    }

    let (n, _) = timeout(Duration::from_secs(1), client_b.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"R:B-HELLO");

    let entries = log.lock().await;
    let a_entries: Vec<_> = entries
        .iter()
        .filter(|(_, data)| data.as_slice() != b"B-HELLO")
        .collect();
    assert_eq!(a_entries.len(), 3);
    assert_eq!(a_entries[0].1.as_slice(), b"1");
    assert_eq!(a_entries[1].1.as_slice(), b"2");
    assert_eq!(a_entries[2].1.as_slice(), b"3");

    let a_port = a_entries[0].0;
    assert!(
        a_entries.iter().all(|(src, _)| *src == a_port),
        "all of client A's datagrams must arrive upstream from the same session"
    );

    let b_entry = entries
        .iter()
        .find(|(_, data)| data.as_slice() == b"B-HELLO")
        .unwrap();
    assert_ne!(
        b_entry.0, a_port,
        "client B's session must not share client A's upstream-facing source port"
    );

    relay.close().await.unwrap();
}

#[tokio::test]
async fn udp_session_reuses_socket_then_evicts_after_idle() {
    let (upstream_addr, log) = spawn_udp_echo_logger().await;
    let provider: Arc<dyn NetworkProvider> = Arc::new(OsNetworkProvider::new());
    let timeouts = UdpTimeouts {
        idle_timeout: Duration::from_millis(120),
    };
    let relay = UdpRelay::bind_with_timeouts(provider, 0, upstream_addr.to_string(), timeouts)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(b"one", relay.local_addr()).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    client.send_to(b"two", relay.local_addr()).await.unwrap();
    sleep(Duration::from_millis(350)).await; // well past idle_timeout: session must be evicted
    client.send_to(b"three", relay.local_addr()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let entries = log.lock().await;
    assert_eq!(entries.len(), 3);
    let ports: Vec<u16> = entries.iter().map(|(src, _)| src.port()).collect();
    assert_eq!(
        ports[0], ports[1],
        "messages within the idle window must reuse the same upstream-facing session"
    );
    assert_ne!(
        ports[1], ports[2],
        "a message after the idle window must start a fresh session with a new source port"
    );

    relay.close().await.unwrap();
}

#[tokio::test]
async fn tcp_shutdown_is_bounded_by_forced_close_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                break;
            };
            // Hold the connection open without reading or writing; only the forced-close
            // deadline can end this session.
            tokio::spawn(async move {
                let _conn = conn;
                sleep(Duration::from_secs(3600)).await;
            });
        }
    });

    let provider: Arc<dyn NetworkProvider> = Arc::new(OsNetworkProvider::new());
    let timeouts = TcpTimeouts {
        dial_deadline: Duration::from_secs(2),
        force_close_deadline: Duration::from_millis(250),
    };
    let relay = TcpRelay::bind_with_timeouts(provider, 0, upstream_addr.to_string(), timeouts)
        .await
        .unwrap();

    let client = TcpStream::connect(relay.local_addr()).await.unwrap();

    let start = Instant::now();
    relay.close().await.unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(1),
        "shutdown took {elapsed:?}, expected it bounded by the forced-close deadline"
    );

    drop(client);
}

#[tokio::test]
async fn udp_relay_close_is_idempotent() {
    let (upstream_addr, _log) = spawn_udp_echo_logger().await;
    let provider: Arc<dyn NetworkProvider> = Arc::new(OsNetworkProvider::new());
    let relay = UdpRelay::bind(provider, 0, upstream_addr.to_string())
        .await
        .unwrap();

    relay.close().await.unwrap();
    relay.close().await.unwrap();
}

/// Wraps the real OS provider but fails a chosen listen port outright, standing in for a
/// permission-denied or already-in-use bind without depending on privileged ports or timing.
struct FlakyProvider {
    inner: OsNetworkProvider,
    fail_listen_port: u16,
}

#[async_trait]
impl NetworkProvider for FlakyProvider {
    async fn listen_tcp(&self, port: u16) -> Result<TcpListener> {
        if port == self.fail_listen_port {
            bail!("synthetic bind failure for port {port}");
        }
        self.inner.listen_tcp(port).await
    }

    async fn listen_udp(&self, port: u16) -> Result<UdpSocket> {
        self.inner.listen_udp(port).await
    }

    async fn dial_tcp(&self, addr: &str, deadline: Instant) -> Result<TcpStream> {
        self.inner.dial_tcp(addr, deadline).await
    }

    async fn dial_udp(&self, addr: &str) -> Result<UdpSocket> {
        self.inner.dial_udp(addr).await
    }
}

#[tokio::test]
async fn supervisor_rolls_back_already_started_relays_on_bind_failure() {
    const SENTINEL_FAIL_PORT: u16 = 1; // intercepted by FlakyProvider; never really dialed

    let provider: Arc<dyn NetworkProvider> = Arc::new(FlakyProvider {
        inner: OsNetworkProvider::new(),
        fail_listen_port: SENTINEL_FAIL_PORT,
    });

    let channels = vec![
        ChannelDescriptor {
            protocol: Protocol::Tcp,
            listen_port: 0,
            target_host: "127.0.0.1".to_string(),
            target_port: 1,
        },
        ChannelDescriptor {
            protocol: Protocol::Tcp,
            listen_port: SENTINEL_FAIL_PORT,
            target_host: "127.0.0.1".to_string(),
            target_port: 1,
        },
    ];

    let err = ProxySupervisor::start(provider, channels)
        .await
        .expect_err("the second channel's bind failure must abort the whole startup");
    assert!(err.to_string().contains("bind"));
}
