//! Bidirectional TCP stream relay.
//!
//! Each accepted downstream connection gets a freshly dialed upstream and a pair of copier
//! tasks. The first copier to finish (EOF or error in either direction) signals the session,
//! which then arms a forced-close deadline so a half-closed or wedged peer cannot pin the
//! session open indefinitely.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::provider::NetworkProvider;
use crate::relay::{ShutdownRx, TcpTimeouts, is_shutting_down, shutdown_channel, trigger_shutdown};

/// One TCP channel: a bound listener plus the in-flight sessions it has spawned.
pub struct TcpRelay {
    listen_port: u16,
    local_addr: std::net::SocketAddr,
    shutdown_tx: crate::relay::ShutdownTx,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl TcpRelay {
    /// Binds the listener and starts serving immediately. Binding failure is returned to the
    /// caller (the supervisor), which aborts startup and unwinds any relays already started.
    pub async fn bind(
        provider: Arc<dyn NetworkProvider>,
        listen_port: u16,
        target: String,
    ) -> Result<Self> {
        Self::bind_with_timeouts(provider, listen_port, target, TcpTimeouts::default()).await
    }

    /// Like [`bind`](Self::bind), but with explicit dial/force-close timeouts — used by tests
    /// that need eviction-style behavior to happen in milliseconds.
    pub async fn bind_with_timeouts(
        provider: Arc<dyn NetworkProvider>,
        listen_port: u16,
        target: String,
        timeouts: TcpTimeouts,
    ) -> Result<Self> {
        let listener = provider
            .listen_tcp(listen_port)
            .await
            .with_context(|| format!("failed to bind tcp port {listen_port}"))?;
        let local_addr = listener
            .local_addr()
            .context("bound tcp listener has no local address")?;
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        info!(listen_port, %target, "tcp relay listening");
        let accept_task = tokio::spawn(accept_loop(
            listener,
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
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The listener's actual bound address — use this instead of [`listen_port`](Self::listen_port)
    /// when the relay was started with port `0` and the OS picked the port.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Triggers quit, closes the listener, and waits for every in-flight session to finish.
    /// Idempotent: a second call observes no accept task left to join and returns immediately.
    pub async fn close(&self) -> Result<()> {
        trigger_shutdown(&self.shutdown_tx);
        let handle = self.accept_task.lock().await.take();
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

#[instrument(skip_all, fields(listen_port, %target))]
async fn accept_loop(
    listener: tokio::net::TcpListener,
    listen_port: u16,
    provider: Arc<dyn NetworkProvider>,
    target: String,
    mut shutdown_rx: ShutdownRx,
    timeouts: TcpTimeouts,
) -> Result<()> {
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    info!(listen_port, "shutdown received; stopping tcp accept loop");
                    break;
                }
            }
            accept_res = listener.accept() => {
                match accept_res {
                    Ok((conn, peer)) => {
                        let provider = provider.clone();
                        let target = target.clone();
                        let session_shutdown = shutdown_rx.clone();
                        sessions.spawn(async move {
                            run_session(conn, peer, provider, target, session_shutdown, timeouts).await;
                        });
                    }
                    Err(err) => {
                        if is_shutting_down(&shutdown_rx) {
                            break;
                        }
                        warn!(listen_port, error = %err, "accept error");
                    }
                }
            }
        }
    }
    drop(listener);

    while sessions.join_next().await.is_some() {}
    Ok(())
}

async fn run_session(
    mut downstream: TcpStream,
    peer: std::net::SocketAddr,
    provider: Arc<dyn NetworkProvider>,
    target: String,
    mut shutdown_rx: ShutdownRx,
    timeouts: TcpTimeouts,
) {
    downstream.set_nodelay(true).ok();

    let upstream = match provider
        .dial_tcp(&target, Instant::now() + timeouts.dial_deadline)
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%peer, %target, error = %err, "tcp session dial failed");
            return;
        }
    };

    let (downstream_read, downstream_write) = downstream.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    // Non-blocking "one side is done" signal: a capacity-1 channel whose `try_send` is dropped
    // if nobody is receiving yet, matching the source's unbuffered-channel-with-default-branch
    // pattern rather than blocking the faster copier on the slower one.
    let (closer_tx, mut closer_rx) = mpsc::channel::<()>(1);

    let task_a = tokio::spawn(copy_direction(downstream_read, upstream_write, closer_tx.clone()));
    let task_b = tokio::spawn(copy_direction(upstream_read, downstream_write, closer_tx));

    tokio::select! {
        biased;
        res = shutdown_rx.changed() => {
            let _ = res;
        }
        _ = closer_rx.recv() => {}
    }

    let abort_a = task_a.abort_handle();
    let abort_b = task_b.abort_handle();
    let drain = timeout(timeouts.force_close_deadline, async {
        let _ = task_a.await;
        let _ = task_b.await;
    })
    .await;

    if drain.is_err() {
        warn!(%peer, %target, "tcp session exceeded forced-close deadline; aborting");
        abort_a.abort();
        abort_b.abort();
    }

    debug!(%peer, %target, "tcp session closed");
}

/// Copies bytes from `reader` to `writer` until EOF or error, then notifies `closer` that this
/// direction has finished so the session can start its drain-or-force-close phase.
async fn copy_direction(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    closer: mpsc::Sender<()>,
) {
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = closer.try_send(());
}
