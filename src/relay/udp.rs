//! Connectionless UDP relay with per-source session tracking, idle eviction, and a single
//! downstream socket shared by every session's response path.
//!
//! The session table is touched only by the main loop (`session_loop`); every other task talks
//! to it exclusively through channels, which is what lets eviction and lookup stay lock-free.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::provider::NetworkProvider;
use crate::relay::{
    CHANNEL_CAPACITY, ShutdownRx, UDP_READ_BUFFER, UdpTimeouts, shutdown_channel, trigger_shutdown,
};

/// One UDP channel: a bound downstream socket, its reader/writer pump, and the per-source
/// session table that the main loop owns.
pub struct UdpRelay {
    listen_port: u16,
    local_addr: SocketAddr,
    shutdown_tx: crate::relay::ShutdownTx,
    main_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl UdpRelay {
    pub async fn bind(
        provider: Arc<dyn NetworkProvider>,
        listen_port: u16,
        target: String,
    ) -> Result<Self> {
        Self::bind_with_timeouts(provider, listen_port, target, UdpTimeouts::default()).await
    }

    /// Like [`bind`](Self::bind), but with an explicit idle timeout — used by tests exercising
    /// session eviction without waiting 90 real seconds.
    pub async fn bind_with_timeouts(
        provider: Arc<dyn NetworkProvider>,
        listen_port: u16,
        target: String,
        timeouts: UdpTimeouts,
    ) -> Result<Self> {
        let socket = provider
            .listen_udp(listen_port)
            .await
            .with_context(|| format!("failed to bind udp port {listen_port}"))?;
        let local_addr = socket
            .local_addr()
            .context("bound udp socket has no local address")?;
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        info!(listen_port, %target, "udp relay listening");
        let main_task = tokio::spawn(session_loop(
            Arc::new(socket),
            listen_port,
            provider,
            target,
            shutdown_rx,
            timeouts,
        ));
        Ok(Self {
            listen_port,
            local_addr,
            shutdown_tx,
            main_task: Mutex::new(Some(main_task)),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The socket's actual bound address — use this instead of [`listen_port`](Self::listen_port)
    /// when the relay was started with port `0` and the OS picked the port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Triggers quit; the main loop drains and destroys every session before returning.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        trigger_shutdown(&self.shutdown_tx);
        let handle = self.main_task.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(result) => result?,
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => return Err(join_err.into()),
            }
        }
        Ok(())
    }
}

/// A downstream-source-address → upstream-connection forwarding record.
struct UdpSession {
    to_upstream_tx: mpsc::Sender<Vec<u8>>,
    last_used: Arc<StdMutex<Instant>>,
    quit_tx: watch::Sender<bool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl UdpSession {
    /// Triggers the session's own quit signal and waits for its two tasks to exit.
    async fn shut_down(self) {
        let _ = self.quit_tx.send(true);
        let _ = self.reader_task.await;
        let _ = self.writer_task.await;
    }
}

#[instrument(skip_all, fields(listen_port, %target))]
async fn session_loop(
    downstream: Arc<UdpSocket>,
    listen_port: u16,
    provider: Arc<dyn NetworkProvider>,
    target: String,
    mut shutdown_rx: ShutdownRx,
    timeouts: UdpTimeouts,
) -> Result<()> {
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(CHANNEL_CAPACITY);
    let (reply_tx, reply_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(CHANNEL_CAPACITY);

    let reader_task = tokio::spawn(downstream_reader(
        downstream.clone(),
        inbound_tx,
        shutdown_rx.clone(),
    ));
    let writer_task = tokio::spawn(downstream_writer(downstream, reply_rx, shutdown_rx.clone()));

    let mut sessions: HashMap<SocketAddr, UdpSession> = HashMap::new();
    let mut gc = interval(timeouts.idle_timeout);
    gc.tick().await; // first tick fires immediately; skip it so gc starts one full period out

    loop {
        tokio::select! {
            biased;
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    info!(listen_port, "shutdown received; stopping udp session loop");
                    break;
                }
            }
            _ = gc.tick() => {
                prune_idle_sessions(&mut sessions, timeouts.idle_timeout);
            }
            maybe_packet = inbound_rx.recv() => {
                let Some((data, src)) = maybe_packet else { break };
                handle_inbound_packet(
                    &mut sessions,
                    src,
                    data,
                    &provider,
                    &target,
                    &reply_tx,
                    &shutdown_rx,
                )
                .await;
            }
        }
    }

    for (_, session) in sessions.drain() {
        session.shut_down().await;
    }

    let _ = reader_task.await;
    let _ = writer_task.await;
    Ok(())
}

async fn handle_inbound_packet(
    sessions: &mut HashMap<SocketAddr, UdpSession>,
    src: SocketAddr,
    data: Vec<u8>,
    provider: &Arc<dyn NetworkProvider>,
    target: &str,
    reply_tx: &mpsc::Sender<(Vec<u8>, SocketAddr)>,
    shutdown_rx: &ShutdownRx,
) {
    if !sessions.contains_key(&src) {
        match create_session(src, target.to_string(), provider.clone(), reply_tx.clone(), shutdown_rx.clone()).await {
            Ok(session) => {
                sessions.insert(src, session);
            }
            Err(err) => {
                warn!(client = %src, %target, error = %err, "failed to create udp session; dropping datagram");
                return;
            }
        }
    }

    let session = sessions.get(&src).expect("session just ensured to exist");
    *session.last_used.lock().unwrap() = Instant::now();
    if session.to_upstream_tx.send(data).await.is_err() {
        warn!(client = %src, "udp session writer gone; dropping session");
        if let Some(session) = sessions.remove(&src) {
            session.shut_down().await;
        }
    }
}

fn prune_idle_sessions(sessions: &mut HashMap<SocketAddr, UdpSession>, idle_timeout: std::time::Duration) {
    let now = Instant::now();
    let stale: Vec<SocketAddr> = sessions
        .iter()
        .filter(|(_, session)| now.duration_since(*session.last_used.lock().unwrap()) > idle_timeout)
        .map(|(addr, _)| *addr)
        .collect();

    for addr in stale {
        if let Some(session) = sessions.remove(&addr) {
            debug!(client = %addr, "evicting idle udp session");
            // Don't block the gc tick on the session's tasks actually exiting.
            tokio::spawn(session.shut_down());
        }
    }
}

async fn create_session(
    src: SocketAddr,
    target: String,
    provider: Arc<dyn NetworkProvider>,
    reply_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    relay_shutdown_rx: ShutdownRx,
) -> Result<UdpSession> {
    let upstream = Arc::new(provider.dial_udp(&target).await?);
    let (quit_tx, quit_rx) = watch::channel(false);
    let last_used = Arc::new(StdMutex::new(Instant::now()));
    let (to_upstream_tx, to_upstream_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    let reader_task = tokio::spawn(session_reader(
        upstream.clone(),
        src,
        reply_tx,
        relay_shutdown_rx.clone(),
        quit_rx.clone(),
        last_used.clone(),
    ));
    let writer_task = tokio::spawn(session_writer(
        upstream,
        to_upstream_rx,
        relay_shutdown_rx,
        quit_rx,
        last_used.clone(),
    ));

    Ok(UdpSession {
        to_upstream_tx,
        last_used,
        quit_tx,
        reader_task,
        writer_task,
    })
}

/// Reads datagrams off the downstream listen socket and hands them to the main loop.
async fn downstream_reader(
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    mut shutdown_rx: ShutdownRx,
) {
    let mut buf = vec![0u8; UDP_READ_BUFFER];
    loop {
        tokio::select! {
            biased;
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, src)) if n > 0 => {
                        if inbound_tx.send((buf[..n].to_vec(), src)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "downstream udp read failed");
                    }
                }
            }
        }
    }
}

/// Dequeues replies destined for downstream clients and writes them to the shared socket. This
/// is the only writer of the downstream socket.
async fn downstream_writer(
    socket: Arc<UdpSocket>,
    mut reply_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    mut shutdown_rx: ShutdownRx,
) {
    loop {
        tokio::select! {
            biased;
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            maybe_reply = reply_rx.recv() => {
                let Some((data, dest)) = maybe_reply else { break };
                match socket.send_to(&data, dest).await {
                    Ok(n) if n != data.len() => {
                        warn!(client = %dest, sent = n, expected = data.len(), "short write to downstream");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(client = %dest, error = %err, "downstream udp write failed");
                    }
                }
            }
        }
    }
}

/// Reads responses off one session's upstream socket and forwards them to the downstream
/// writer, tagged with the frozen source address they should return to.
async fn session_reader(
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    reply_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    mut relay_shutdown_rx: ShutdownRx,
    mut quit_rx: watch::Receiver<bool>,
    last_used: Arc<StdMutex<Instant>>,
) {
    let mut buf = vec![0u8; UDP_READ_BUFFER];
    loop {
        tokio::select! {
            biased;
            res = relay_shutdown_rx.changed() => {
                if res.is_err() || *relay_shutdown_rx.borrow() {
                    break;
                }
            }
            res = quit_rx.changed() => {
                if res.is_err() || *quit_rx.borrow() {
                    break;
                }
            }
            recv = socket.recv(&mut buf) => {
                match recv {
                    Ok(n) if n > 0 => {
                        *last_used.lock().unwrap() = Instant::now();
                        if reply_tx.send((buf[..n].to_vec(), src)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(client = %src, error = %err, "upstream udp read failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Consumes packets bound for upstream and writes them to this session's connected socket.
async fn session_writer(
    socket: Arc<UdpSocket>,
    mut to_upstream_rx: mpsc::Receiver<Vec<u8>>,
    mut relay_shutdown_rx: ShutdownRx,
    mut quit_rx: watch::Receiver<bool>,
    last_used: Arc<StdMutex<Instant>>,
) {
    loop {
        tokio::select! {
            biased;
            res = relay_shutdown_rx.changed() => {
                if res.is_err() || *relay_shutdown_rx.borrow() {
                    break;
                }
            }
            res = quit_rx.changed() => {
                if res.is_err() || *quit_rx.borrow() {
                    break;
                }
            }
            maybe_packet = to_upstream_rx.recv() => {
                let Some(data) = maybe_packet else { break };
                *last_used.lock().unwrap() = Instant::now();
                match socket.send(&data).await {
                    Ok(n) if n != data.len() => {
                        warn!(sent = n, expected = data.len(), "short write to upstream");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "upstream udp write failed");
                        break;
                    }
                }
            }
        }
    }
}
