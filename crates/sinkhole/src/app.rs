use std::sync::Arc;

use anyhow::Context as _;

use crate::{Args, Bootstrap, Config, Denylist, Forwarder, QueryLog, ResponseCache, TracingQueryLog, UdpServer};

pub struct App;

impl App {
    /// Runs the proxy until Ctrl-C or SIGTERM.
    pub async fn run_until_completion(args: Args) -> anyhow::Result<()> {
        let config = Config::from_args(&args).await.context("invalid configuration")?;
        let logger: Arc<dyn QueryLog> = Arc::new(TracingQueryLog);

        let denylist = Denylist::load(&config.blocklist_path, &Bootstrap::default(), logger.as_ref())
            .await
            .context("failed to load the blocklist")?;
        let blocklist_entries = denylist.len();

        let cache = Arc::new(ResponseCache::new(config.cache_ttl));
        let sweeper = cache.spawn_sweeper(config.sweep_interval);

        let forwarder = Arc::new(
            Forwarder::new(
                config.forwarder_config(),
                Arc::new(denylist),
                cache.clone(),
                logger.clone(),
            )
            .await,
        );
        let server = Arc::new(UdpServer::new(config.server_config(), forwarder.clone(), logger.clone()));

        let mut serve = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });

        let local_addr = match server.wait_until_running().await {
            Ok(local_addr) => local_addr,
            Err(_) => {
                sweeper.abort();
                serve
                    .await
                    .context("server task failed to execute")?
                    .context("failed to start the DNS server")?;
                anyhow::bail!("DNS server stopped before it started");
            }
        };
        logger.info(format_args!("DNS started on: {}", local_addr));
        logger.info(format_args!("Upstream server: {}", config.upstream));
        logger.info(format_args!("Blocklist entries: {}", blocklist_entries));

        tokio::select! {
            result = shutdown_signal() => result?,
            result = &mut serve => {
                sweeper.abort();
                result.context("server task failed to execute")??;
                anyhow::bail!("DNS server stopped unexpectedly");
            }
        }

        logger.info(format_args!("Shutdown signal received, terminating server..."));
        server.stop().await;
        serve
            .await
            .context("server task failed to execute")?
            .context("DNS server failed")?;
        sweeper.abort();

        let stats = forwarder.stats();
        let cached = cache.len().await;
        tracing::info!(
            queries = stats.queries,
            blocked = stats.blocked,
            cache_hits = stats.cache_hits,
            forwarded = stats.forwarded,
            failures = stats.failures,
            cached,
            "Server stopped"
        );

        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register the SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C"),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")
}
