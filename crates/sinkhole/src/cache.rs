use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CachedResponse {
    response: Vec<u8>,
    added: Instant,
}

impl CachedResponse {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.added.elapsed() > ttl
    }
}

/// Upstream responses keyed by a digest of the query.
///
/// Entries expire by age only. Expired entries are hidden from [`ResponseCache::get`] right
/// away but stay in memory until the next [`ResponseCache::sweep`].
pub struct ResponseCache {
    internal: RwLock<HashMap<String, CachedResponse>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        ResponseCache {
            internal: Default::default(),
            ttl,
        }
    }

    /// Returns a copy of the response stored under `key`, if it's still fresh.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let cache = self.internal.read().await;
        cache
            .get(key)
            .filter(|cached| !cached.is_expired(self.ttl))
            .map(|cached| cached.response.clone())
    }

    /// Stores a copy of `response`, replacing whatever was under `key`.
    pub async fn set(&self, key: String, response: &[u8]) {
        let mut cache = self.internal.write().await;
        cache.insert(
            key,
            CachedResponse {
                response: response.to_vec(),
                added: Instant::now(),
            },
        );
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut cache = self.internal.write().await;
        let before = cache.len();
        cache.retain(|_, cached| !cached.is_expired(self.ttl));
        before - cache.len()
    }

    pub async fn len(&self) -> usize {
        self.internal.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sweeps the cache every `every` until the cache is dropped or the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<ResponseCache> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}
