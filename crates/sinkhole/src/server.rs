use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::{Forwarder, QueryLog};

/// Kernel send/receive buffer size requested for the listen socket
pub const SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;

pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Size of the receive buffer, i.e. the largest query accepted
    pub buffer_size: usize,
    /// Queries handled concurrently before the read loop stops reading
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running(SocketAddr),
    Stopping,
    Stopped,
}

pub struct UdpServer {
    config: ServerConfig,
    forwarder: Arc<Forwarder>,
    logger: Arc<dyn QueryLog>,
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
}

impl UdpServer {
    pub fn new(config: ServerConfig, forwarder: Arc<Forwarder>, logger: Arc<dyn QueryLog>) -> Self {
        UdpServer {
            config,
            forwarder,
            logger,
            state: watch::Sender::new(ServerState::Created),
            shutdown: watch::Sender::new(false),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Serves queries until [`UdpServer::stop`] is called.
    ///
    /// Can only be called once. Returns once every query in flight has been answered and the
    /// forwarder's connections have been closed.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.state() != ServerState::Created {
            anyhow::bail!("server has already been started");
        }

        let bound = bind(self.config.listen_addr, self.logger.as_ref()).and_then(|socket| {
            let local_addr = socket.local_addr().context("error while reading the bound address")?;
            Ok((Arc::new(socket), local_addr))
        });
        let (socket, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.forwarder.close();
                self.state.send_replace(ServerState::Stopped);
                return Err(e);
            }
        };

        let mut shutdown = self.shutdown.subscribe();
        let started = self.state.send_if_modified(|state| {
            if *state == ServerState::Created {
                *state = ServerState::Running(local_addr);
                true
            } else {
                false
            }
        });
        if !started {
            anyhow::bail!("server was stopped or started concurrently");
        }
        self.logger.info(format_args!("Listening on {}", local_addr));

        let in_flight = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut handlers = JoinSet::new();
        let mut recv = vec![0; self.config.buffer_size];
        loop {
            let (len, client) = tokio::select! {
                _ = shutdown.changed() => break,
                result = socket.recv_from(&mut recv) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        self.logger.error(format_args!("Failed to read a query: {}", e));
                        continue;
                    }
                },
                Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = result {
                        self.logger.error(format_args!("Query handler failed to execute: {}", e));
                    }
                    continue;
                }
            };
            // The receive buffer is reused for the next datagram
            let query = recv[..len].to_vec();

            // Blocks the loop while saturated
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Never closed
                    Err(_) => break,
                },
            };

            let forwarder = self.forwarder.clone();
            let logger = self.logger.clone();
            let socket = socket.clone();
            handlers.spawn(
                async move {
                    let _permit = permit;
                    match forwarder.forward(&query, client).await {
                        Ok(response) => {
                            if let Err(e) = socket.send_to(&response, client).await {
                                logger.error(format_args!("Failed to send a response to {}: {}", client, e));
                            }
                        }
                        Err(e) => logger.error(format_args!("Failed to handle a query from {}: {:#}", client, e)),
                    }
                }
                .instrument(tracing::trace_span!("query", %client)),
            );
        }

        tracing::debug!(in_flight = handlers.len(), "Stopped reading, waiting for handlers");
        drop(socket);
        while let Some(result) = handlers.join_next().await {
            if let Err(e) = result {
                self.logger.error(format_args!("Query handler failed to execute: {}", e));
            }
        }

        self.forwarder.close();
        self.state.send_replace(ServerState::Stopped);
        self.logger.info(format_args!("Server on {} stopped", local_addr));

        Ok(())
    }

    /// Stops the read loop and waits for the server to drain. Safe to call more than once.
    pub async fn stop(&self) {
        let mut never_started = false;
        self.state.send_if_modified(|state| match state {
            ServerState::Created => {
                *state = ServerState::Stopped;
                never_started = true;
                true
            }
            ServerState::Running(_) => {
                *state = ServerState::Stopping;
                true
            }
            ServerState::Stopping | ServerState::Stopped => false,
        });
        // A running server closes the forwarder itself once it has drained
        if never_started {
            self.forwarder.close();
        }
        self.shutdown.send_replace(true);

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == ServerState::Stopped).await;
    }

    /// Waits for [`UdpServer::start`] to bind and returns the address it's listening on.
    pub async fn wait_until_running(&self) -> anyhow::Result<SocketAddr> {
        let mut state = self.state.subscribe();
        let current = *state
            .wait_for(|state| *state != ServerState::Created)
            .await
            .context("server state is unavailable")?;

        match current {
            ServerState::Running(local_addr) => Ok(local_addr),
            state => anyhow::bail!("server isn't running ({:?})", state),
        }
    }
}

fn bind(addr: SocketAddr, logger: &dyn QueryLog) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("error while creating a UDP socket")?;

    // Large buffers keep bursts from being dropped by the kernel
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        logger.error(format_args!("Failed to set the receive buffer size: {}", e));
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        logger.error(format_args!("Failed to set the send buffer size: {}", e));
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("error while binding to {}", addr))?;
    socket
        .set_nonblocking(true)
        .context("error while making the socket non-blocking")?;

    UdpSocket::from_std(socket.into()).context("error while registering the UDP socket")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{build_query, FakeUpstream, RecordingQueryLog};
    use crate::{Denylist, ForwarderConfig, ResponseCache};

    struct Harness {
        server: Arc<UdpServer>,
        cache: Arc<ResponseCache>,
        upstream: FakeUpstream,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
        addr: SocketAddr,
    }

    async fn harness() -> Harness {
        let upstream = FakeUpstream::start().await;
        let logger = Arc::new(RecordingQueryLog::default());
        let denylist = Arc::new(Denylist::from_lines(["*.doubleclick.net"]));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60)));
        let forwarder = Forwarder::new(
            ForwarderConfig {
                upstream: upstream.addr,
                pool_size: 4,
                timeout: Duration::from_secs(2),
                buffer_size: 4096,
            },
            denylist,
            cache.clone(),
            logger.clone(),
        )
        .await;

        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            buffer_size: 4096,
            max_in_flight: 16,
        };
        let server = Arc::new(UdpServer::new(config, Arc::new(forwarder), logger));

        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });
        let addr = server.wait_until_running().await.expect("server should be running");

        Harness {
            server,
            cache,
            upstream,
            handle,
            addr,
        }
    }

    async fn exchange(client: &UdpSocket, server: SocketAddr, query: &[u8]) -> Vec<u8> {
        client.send_to(query, server).await.unwrap();
        let mut buf = vec![0; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("should have received a response")
            .unwrap();
        buf.truncate(len);
        buf
    }

    #[tokio::test]
    async fn blocked_query_gets_nxdomain() {
        let harness = harness().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let query = build_query("pagead.doubleclick.net", 0x1234);
        let response = exchange(&client, harness.addr, &query).await;

        assert_eq!(&response[..4], &[0x12, 0x34, 0x81, 0x83]);
        assert_eq!(&response[4..], &query[4..]);
        assert_eq!(harness.upstream.received(), 0);
        assert!(harness.cache.is_empty().await);

        harness.server.stop().await;
        harness.handle.await.unwrap().expect("server shouldn't have failed");
    }

    #[tokio::test]
    async fn repeated_question_is_served_from_cache() {
        let harness = harness().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let first = exchange(&client, harness.addr, &build_query("example.com", 0x1234)).await;
        let second = exchange(&client, harness.addr, &build_query("example.com", 0xabcd)).await;

        assert_eq!(&first[..2], &[0x12, 0x34]);
        assert_eq!(&second[..2], &[0xab, 0xcd]);
        assert_eq!(&first[2..], &second[2..]);
        assert_eq!(harness.upstream.received(), 1);
        assert_eq!(harness.cache.len().await, 1);

        harness.server.stop().await;
        harness.handle.await.unwrap().expect("server shouldn't have failed");
    }

    #[tokio::test]
    async fn concurrent_clients() {
        let harness = harness().await;

        let mut clients = JoinSet::new();
        for id in 0..32u16 {
            let addr = harness.addr;
            clients.spawn(async move {
                let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                let response = exchange(&client, addr, &build_query(&format!("host{}.example.com", id), id)).await;
                assert_eq!(&response[..2], &id.to_be_bytes());
            });
        }
        while let Some(result) = clients.join_next().await {
            result.expect("client shouldn't have panicked");
        }
        assert_eq!(harness.upstream.received(), 32);

        harness.server.stop().await;
        harness.handle.await.unwrap().expect("server shouldn't have failed");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let harness = harness().await;

        harness.server.stop().await;
        assert_eq!(harness.server.state(), ServerState::Stopped);
        harness.server.stop().await;
        assert_eq!(harness.server.state(), ServerState::Stopped);

        harness.handle.await.unwrap().expect("server shouldn't have failed");
        // Can't be restarted
        assert!(harness.server.start().await.is_err());
    }

    async fn idle_server(upstream: SocketAddr, listen_addr: SocketAddr) -> (UdpServer, Arc<Forwarder>) {
        let logger = Arc::new(RecordingQueryLog::default());
        let forwarder = Forwarder::new(
            ForwarderConfig {
                upstream,
                pool_size: 2,
                timeout: Duration::from_secs(1),
                buffer_size: 512,
            },
            Arc::new(Denylist::new()),
            Arc::new(ResponseCache::new(Duration::from_secs(60))),
            logger.clone(),
        )
        .await;
        let forwarder = Arc::new(forwarder);
        let config = ServerConfig {
            listen_addr,
            buffer_size: 512,
            max_in_flight: 1,
        };
        (UdpServer::new(config, forwarder.clone(), logger), forwarder)
    }

    #[tokio::test]
    async fn stop_before_start() {
        let upstream = FakeUpstream::start().await;
        let (server, forwarder) = idle_server(upstream.addr, "127.0.0.1:0".parse().unwrap()).await;
        assert_eq!(forwarder.pool().idle(), 2);

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(forwarder.pool().idle(), 0);
        assert!(server.start().await.is_err());
        assert!(server.wait_until_running().await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_releases_connections() {
        let upstream = FakeUpstream::start().await;
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (server, forwarder) = idle_server(upstream.addr, taken.local_addr().unwrap()).await;

        assert!(server.start().await.is_err());
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(forwarder.pool().idle(), 0);
        assert!(forwarder.pool().borrow().await.is_err());
    }

    #[tokio::test]
    async fn in_flight_queries_are_bounded() {
        let upstream = FakeUpstream::with_delay(Some(Duration::from_millis(100))).await;
        let logger = Arc::new(RecordingQueryLog::default());
        let forwarder = Forwarder::new(
            ForwarderConfig {
                upstream: upstream.addr,
                pool_size: 8,
                timeout: Duration::from_secs(5),
                buffer_size: 512,
            },
            Arc::new(Denylist::new()),
            Arc::new(ResponseCache::new(Duration::from_secs(60))),
            logger.clone(),
        )
        .await;
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            buffer_size: 512,
            max_in_flight: 2,
        };
        let server = Arc::new(UdpServer::new(config, Arc::new(forwarder), logger));
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });
        let addr = server.wait_until_running().await.expect("server should be running");

        let mut clients = JoinSet::new();
        for id in 0..8u16 {
            clients.spawn(async move {
                let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                client
                    .send_to(&build_query(&format!("host{}.example.com", id), id), addr)
                    .await
                    .unwrap();
                let mut buf = vec![0; 512];
                let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                    .await
                    .expect("should have received a response")
                    .unwrap();
                assert_eq!(&buf[..2], &id.to_be_bytes());
                assert!(len > 12);
            });
        }
        while let Some(result) = clients.join_next().await {
            result.expect("client shouldn't have panicked");
        }

        assert_eq!(upstream.received(), 8);
        assert!(upstream.peak_in_flight() <= 2, "peak was {}", upstream.peak_in_flight());
        assert!(upstream.peak_in_flight() >= 1);

        server.stop().await;
        handle.await.unwrap().expect("server shouldn't have failed");
    }
}
