use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::QueryLog;

/// A fixed number of UDP sockets connected to the upstream resolver.
///
/// Borrowing never waits: when no idle socket is left a new one is dialed, and sockets
/// returned to a full (or closed) pool are dropped.
pub struct ConnectionPool {
    upstream: SocketAddr,
    idle_tx: mpsc::Sender<UdpSocket>,
    idle_rx: Mutex<mpsc::Receiver<UdpSocket>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub async fn new(upstream: SocketAddr, capacity: usize, logger: Arc<dyn QueryLog>) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(capacity.max(1));

        for _ in 0..capacity {
            match dial(upstream).await {
                Ok(socket) => {
                    // Can't be full yet
                    let _ = idle_tx.try_send(socket);
                }
                Err(e) => logger.error(format_args!("Failed to create a pooled connection: {:#}", e)),
            }
        }

        ConnectionPool {
            upstream,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Takes an idle socket, or dials a new one if there's none.
    pub async fn borrow(&self) -> anyhow::Result<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("connection pool is closed");
        }

        let idle = self
            .idle_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv();

        let socket = match idle {
            Ok(socket) => socket,
            Err(TryRecvError::Empty) => {
                tracing::trace!("Connection pool is empty, dialing a new socket");
                dial(self.upstream).await?
            }
            Err(TryRecvError::Disconnected) => anyhow::bail!("connection pool is closed"),
        };

        Ok(PooledConnection {
            socket: Some(socket),
            pool: self.idle_tx.clone(),
        })
    }

    /// Number of sockets waiting to be borrowed.
    pub fn idle(&self) -> usize {
        self.idle_tx.max_capacity() - self.idle_tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.idle_tx.max_capacity()
    }

    /// Drops every idle socket. Sockets that are currently borrowed are dropped once
    /// they're returned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let mut idle_rx = self.idle_rx.lock().unwrap_or_else(PoisonError::into_inner);
        idle_rx.close();
        while idle_rx.try_recv().is_ok() {}
    }
}

/// A socket borrowed from a [`ConnectionPool`], returned to it on drop.
pub struct PooledConnection {
    socket: Option<UdpSocket>,
    pool: mpsc::Sender<UdpSocket>,
}

impl Deref for PooledConnection {
    type Target = UdpSocket;

    fn deref(&self) -> &Self::Target {
        // Only taken in `drop`
        self.socket.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            // The socket is closed if the pool is full or closed
            if self.pool.try_send(socket).is_err() {
                tracing::trace!("Discarded a connection");
            }
        }
    }
}

/// Binds an ephemeral socket and connects it to `upstream`.
async fn dial(upstream: SocketAddr) -> anyhow::Result<UdpSocket> {
    let local_addr: SocketAddr = match upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(local_addr)
        .await
        .context("unable to bind a UDP socket")?;
    socket
        .connect(upstream)
        .await
        .with_context(|| format!("error while connecting to the upstream resolver {}", upstream))?;

    Ok(socket)
}
