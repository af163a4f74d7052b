//! Generates an initial blocklist from public hosts files.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt as _;

use crate::QueryLog;

pub const DEFAULT_SOURCES: [&str; 2] = [
    "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts",
    "https://raw.githubusercontent.com/anudeepND/blacklist/master/adservers.txt",
];

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Used when none of the sources could be downloaded
const FALLBACK_DOMAINS: [&str; 20] = [
    "*.doubleclick.net",
    "*.googlesyndication.com",
    "*.googleadservices.com",
    "*.google-analytics.com",
    "*.googletagmanager.com",
    "*.facebook.net",
    "*.scorecardresearch.com",
    "*.advertising.com",
    "ads.youtube.com",
    "pixel.facebook.com",
    "*.adnxs.com",
    "*.adsafeprotected.com",
    "*.moatads.com",
    "*.adservice.google.com",
    "*.amazon-adsystem.com",
    "*.criteo.com",
    "*.outbrain.com",
    "*.taboola.com",
    "*.2mdn.net",
    "*.adsrvr.org",
];

pub fn fallback_domains() -> BTreeSet<String> {
    FALLBACK_DOMAINS.iter().map(|domain| domain.to_string()).collect()
}

pub struct Bootstrap {
    sources: Vec<String>,
    timeout: Duration,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Bootstrap::new(
            DEFAULT_SOURCES.iter().map(|url| url.to_string()).collect(),
            DEFAULT_FETCH_TIMEOUT,
        )
    }
}

impl Bootstrap {
    pub fn new(sources: Vec<String>, timeout: Duration) -> Self {
        Bootstrap { sources, timeout }
    }

    /// Downloads and merges every source. Never fails: errors are logged and the built-in
    /// list is returned if nothing could be gathered.
    pub async fn fetch_domains(&self, logger: &dyn QueryLog) -> BTreeSet<String> {
        let mut domains = BTreeSet::new();

        match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(client) => {
                for url in self.sources.iter() {
                    logger.info(format_args!("Downloading blocklist from {}", url));
                    match fetch(&client, url).await {
                        Ok(body) => {
                            let added = parse_hosts_list(&body, &mut domains);
                            tracing::debug!(%url, added, "Parsed a hosts file");
                        }
                        Err(e) => logger.error(format_args!("Failed to download {}: {:#}", url, e)),
                    }
                }
            }
            Err(e) => logger.error(format_args!("Failed to create an HTTP client: {:#}", e)),
        }

        if domains.is_empty() {
            logger.info(format_args!("No domains downloaded, using the built-in list"));
            domains = fallback_domains();
        }

        domains
    }

    /// Writes `domains` to `path` under a header naming the sources and the creation time.
    pub async fn persist(&self, path: &Path, domains: &BTreeSet<String>) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("error while creating parent directories for {:?}", path))?;
        }

        let mut contents = String::with_capacity(128 + domains.iter().map(|domain| domain.len() + 1).sum::<usize>());
        contents.push_str("# Auto-generated DNS blocklist\n");
        contents.push_str(&format!("# Sources: {}\n", self.sources.join(", ")));
        contents.push_str(&format!(
            "# Date of Creation: {}\n\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        for domain in domains.iter() {
            contents.push_str(domain);
            contents.push('\n');
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("error while creating {:?}", path))?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("error while writing {:?}", path))?;
        file.flush().await.with_context(|| format!("error while flushing {:?}", path))
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = client.get(url).send().await.context("request failed")?;

    let status = response.status();
    if status != StatusCode::OK {
        anyhow::bail!("HTTP {}", status);
    }

    response.text().await.context("error while reading the response body")
}

/// Collects domains from a hosts-format list (`0.0.0.0 domain`) or a plain domain list.
///
/// Returns the number of domains that weren't in `domains` yet.
pub fn parse_hosts_list(body: &str, domains: &mut BTreeSet<String>) -> usize {
    let mut added = 0;
    for line in body.lines() {
        let line = line.trim();
        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let domain = match (fields.next(), fields.next()) {
            (Some(_), Some(domain)) => domain,
            (Some(domain), None) => domain,
            _ => continue,
        };

        if !domain.contains('.') || domain.contains("localhost") {
            continue;
        }

        if domains.insert(domain.to_lowercase()) {
            added += 1;
        }
    }
    added
}
