mod logging;
pub use logging::setup_logging;
mod query_logger;
pub use query_logger::{QueryLog, TracingQueryLog};
pub mod denylist;
pub use denylist::{Bootstrap, Denylist, Rule};
mod cache;
pub use cache::{ResponseCache, DEFAULT_SWEEP_INTERVAL};
pub mod upstream;
pub use upstream::{Forwarder, ForwarderConfig, ForwarderStats};
mod server;
pub use server::{ServerConfig, ServerState, UdpServer, SOCKET_BUFFER_SIZE};
mod cli;
pub use cli::Args;
mod config;
pub use config::{resolve_upstream, Config, DEFAULT_UPSTREAM_PORT};
mod app;
pub use app::App;

#[cfg(test)]
mod test_utils;
