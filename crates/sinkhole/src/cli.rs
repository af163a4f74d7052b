use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, name = "sinkhole", about = "Ad-blocking DNS forwarding proxy")]
pub struct Args {
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(short('p'), long, value_name = "PORT", default_value_t = 53)]
    pub port: u16,
    /// Upstream resolver, `:53` is assumed if no port is given
    #[arg(long, value_name = "HOST[:PORT]", default_value = "1.1.1.1:53")]
    pub upstream: String,
    /// Generated from public hosts lists if missing
    #[arg(long, value_name = "PATH", default_value = "blacklist.ini")]
    pub blocklist_path: PathBuf,
    #[arg(long, value_name = "SECONDS", default_value_t = 900)]
    pub cache_ttl: u64,
    /// Upstream round trip deadline
    #[arg(long, value_name = "MILLISECONDS", default_value_t = 2000)]
    pub timeout: u64,
    /// Largest query accepted and largest upstream response read
    #[arg(long, value_name = "BYTES", default_value_t = 4096, value_parser = clap::value_parser!(u16).range(512..))]
    pub buffer_size: u16,
    #[arg(long, value_name = "CONNECTIONS", default_value_t = 500, value_parser = clap::value_parser!(u16).range(1..=10000))]
    pub pool_size: u16,
    #[arg(long, value_name = "QUERIES", default_value_t = 5000)]
    pub max_in_flight: usize,
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}
