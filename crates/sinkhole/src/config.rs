use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;

use crate::{cache, Args, ForwarderConfig, ServerConfig};

pub const DEFAULT_UPSTREAM_PORT: u16 = 53;

/// Settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub upstream: SocketAddr,
    pub blocklist_path: PathBuf,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub timeout: Duration,
    pub buffer_size: usize,
    pub pool_size: usize,
    pub max_in_flight: usize,
}

impl Config {
    pub async fn from_args(args: &Args) -> anyhow::Result<Self> {
        let upstream = resolve_upstream(&args.upstream)
            .await
            .with_context(|| format!("invalid upstream resolver {:?}", args.upstream))?;

        Ok(Config {
            listen_addr: SocketAddr::new(args.host, args.port),
            upstream,
            blocklist_path: args.blocklist_path.clone(),
            cache_ttl: Duration::from_secs(args.cache_ttl),
            sweep_interval: cache::DEFAULT_SWEEP_INTERVAL,
            timeout: Duration::from_millis(args.timeout),
            buffer_size: args.buffer_size.into(),
            pool_size: args.pool_size.into(),
            max_in_flight: args.max_in_flight,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr,
            buffer_size: self.buffer_size,
            max_in_flight: self.max_in_flight,
        }
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            upstream: self.upstream,
            pool_size: self.pool_size,
            timeout: self.timeout,
            buffer_size: self.buffer_size,
        }
    }
}

/// Turns `host`, `host:port`, an IP or a socket address into the address queries are sent to.
pub async fn resolve_upstream(upstream: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = upstream.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // Also covers bare IPv6 addresses, which contain ':'
    if let Ok(ip) = upstream.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_UPSTREAM_PORT));
    }

    let host = if upstream.contains(':') {
        upstream.to_owned()
    } else {
        format!("{}:{}", upstream, DEFAULT_UPSTREAM_PORT)
    };

    let mut resolved = tokio::net::lookup_host(&host)
        .await
        .with_context(|| format!("failed to resolve {}", host))?;
    let addr = resolved
        .next()
        .with_context(|| format!("{} didn't resolve to any address", host))?;

    Ok(addr)
}
