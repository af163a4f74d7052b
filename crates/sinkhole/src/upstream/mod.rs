pub mod pool;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use sinkhole_common::{hash_to_hex, ResponseSource};
use sinkhole_lib::{cache_key_material, extract_qname_lossy, nxdomain_response, transaction_id, with_transaction_id};
use tokio::time::{timeout_at, Instant};

use crate::{Denylist, QueryLog, ResponseCache};
pub use pool::{ConnectionPool, PooledConnection};

pub struct ForwarderConfig {
    pub upstream: SocketAddr,
    pub pool_size: usize,
    /// Deadline for a single upstream round trip
    pub timeout: Duration,
    /// Size of the buffer upstream responses are read into
    pub buffer_size: usize,
}

#[derive(Default)]
struct Counters {
    queries: AtomicU64,
    blocked: AtomicU64,
    cache_hits: AtomicU64,
    forwarded: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderStats {
    pub queries: u64,
    pub blocked: u64,
    pub cache_hits: u64,
    pub forwarded: u64,
    pub failures: u64,
}

/// Answers a query from the denylist, the cache or the upstream resolver, in that order.
pub struct Forwarder {
    upstream: SocketAddr,
    timeout: Duration,
    buffer_size: usize,
    pool: ConnectionPool,
    denylist: Arc<Denylist>,
    cache: Arc<ResponseCache>,
    logger: Arc<dyn QueryLog>,
    counters: Counters,
}

impl Forwarder {
    pub async fn new(
        config: ForwarderConfig,
        denylist: Arc<Denylist>,
        cache: Arc<ResponseCache>,
        logger: Arc<dyn QueryLog>,
    ) -> Self {
        let pool = ConnectionPool::new(config.upstream, config.pool_size, logger.clone()).await;
        tracing::debug!(upstream = %config.upstream, idle = pool.idle(), "Connection pool ready");

        Forwarder {
            upstream: config.upstream,
            timeout: config.timeout,
            buffer_size: config.buffer_size,
            pool,
            denylist,
            cache,
            logger,
            counters: Default::default(),
        }
    }

    /// Produces the response for a raw `query` sent by `client`.
    ///
    /// Blocked domains get an NXDOMAIN built from the query itself. Everything else is served
    /// from the cache (with the transaction ID rewritten) or forwarded upstream. Errors only
    /// come from the upstream round trip.
    pub async fn forward(&self, query: &[u8], client: SocketAddr) -> anyhow::Result<Vec<u8>> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let domain = extract_qname_lossy(query);
        self.logger.query(client.ip(), &domain);

        if self.denylist.is_blocked(&domain) {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            self.logger.blocked(client.ip(), &domain);
            tracing::trace!(%domain, source = %ResponseSource::Denylist, "Answered");
            return Ok(nxdomain_response(query));
        }

        // Queries without a full header are passed through uncached
        let cache_key = cache_key(query);
        if let Some(key) = cache_key.as_deref() {
            if let Some(cached) = self.cache.get(key).await {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.logger.cache_hit(&domain);
                tracing::trace!(%domain, source = %ResponseSource::Cache, "Answered");
                return Ok(with_transaction_id(&cached, query));
            }
        }

        let response = match self.exchange(query).await {
            Ok(response) => response,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e).with_context(|| format!("failed to resolve {} with {}", domain, self.upstream));
            }
        };
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%domain, source = %ResponseSource::Upstream, "Answered");

        if let Some(key) = cache_key {
            self.cache.set(key, &response).await;
        }

        Ok(response)
    }

    /// One round trip over a pooled connection, bounded by the configured timeout.
    async fn exchange(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let connection = self.pool.borrow().await.context("no upstream connection available")?;
        let deadline = Instant::now() + self.timeout;

        timeout_at(deadline, connection.send(query))
            .await
            .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))
            .context("error while forwarding the query")?;

        let expected_id = transaction_id(query);
        let mut buf = vec![0; self.buffer_size];
        loop {
            let len = timeout_at(deadline, connection.recv(&mut buf))
                .await
                .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))
                .context("error while reading the response")?;

            // A late answer to an earlier query that timed out on this socket
            if expected_id.is_some() && transaction_id(&buf[..len]) != expected_id {
                tracing::debug!("Discarded a stale upstream response");
                continue;
            }

            buf.truncate(len);
            break Ok(buf);
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            queries: self.counters.queries.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Drops all pooled connections.
    pub fn close(&self) {
        self.pool.close();
    }
}

fn cache_key(query: &[u8]) -> Option<String> {
    cache_key_material(query).map(hash_to_hex)
}
