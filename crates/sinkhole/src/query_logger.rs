use std::fmt;
use std::net::IpAddr;

/// Sink for the proxy's operational and per-query events.
///
/// Every component gets one at construction. Implementations must not fail and must return
/// quickly, as they are called on the query path.
pub trait QueryLog: Send + Sync {
    fn info(&self, message: fmt::Arguments<'_>);
    fn error(&self, message: fmt::Arguments<'_>);
    fn query(&self, client: IpAddr, domain: &str);
    fn blocked(&self, client: IpAddr, domain: &str);
    fn cache_hit(&self, domain: &str);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingQueryLog;

impl QueryLog for TracingQueryLog {
    fn info(&self, message: fmt::Arguments<'_>) {
        tracing::info!("{}", message);
    }

    fn error(&self, message: fmt::Arguments<'_>) {
        tracing::error!("{}", message);
    }

    fn query(&self, client: IpAddr, domain: &str) {
        tracing::debug!(%client, domain, "Query");
    }

    fn blocked(&self, client: IpAddr, domain: &str) {
        tracing::info!(%client, domain, "Blocked");
    }

    fn cache_hit(&self, domain: &str) {
        tracing::debug!(domain, "Cache hit");
    }
}
