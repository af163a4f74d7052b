mod bootstrap;

use std::collections::HashSet;
use std::io;
use std::path::Path;

use anyhow::Context as _;
pub use bootstrap::{fallback_domains, parse_hosts_list, Bootstrap, DEFAULT_SOURCES};

use crate::QueryLog;

/// A single line of the blocklist.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Rule {
    /// `ads.example.com`
    Exact(String),
    /// `*.example.com`: the domain itself and every subdomain
    Suffix(String),
    /// `example.*`: the label itself and anything under it
    Prefix(String),
    /// `ad*.example.com`: a single wildcard anywhere else
    Infix { prefix: String, suffix: String },
}

impl Rule {
    /// Parses a blocklist line. Returns `None` for blank lines and comments.
    pub fn parse(line: &str) -> Option<Rule> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let line = line.to_lowercase();

        if !line.contains('*') {
            return Some(Rule::Exact(line));
        }

        let rule = if let Some(suffix) = line.strip_prefix("*.") {
            Rule::Suffix(suffix.to_owned())
        } else if let Some(prefix) = line.strip_suffix(".*") {
            Rule::Prefix(prefix.to_owned())
        } else {
            // Everything after the first '*' is the suffix, including any further '*'
            let (prefix, suffix) = line.split_once('*')?;
            Rule::Infix {
                prefix: prefix.to_owned(),
                suffix: suffix.to_owned(),
            }
        };

        Some(rule)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
struct InfixPattern {
    prefix: String,
    suffix: String,
}

/// Domains to answer with NXDOMAIN instead of forwarding.
///
/// Built once at startup and never mutated afterwards, so it's shared between query
/// handlers without any locking.
#[derive(Default, Debug)]
pub struct Denylist {
    exact: HashSet<String>,
    suffixes: Vec<String>,
    prefixes: Vec<String>,
    infixes: Vec<InfixPattern>,
}

impl Denylist {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut denylist = Denylist::new();
        lines
            .into_iter()
            .filter_map(Rule::parse)
            .for_each(|rule| denylist.add_rule(rule));
        denylist
    }

    /// Reads the blocklist at `path`, generating it first if it doesn't exist.
    ///
    /// Only a file that exists but can't be read is an error. Failing to generate or write
    /// the list just leaves us with whatever domains we managed to gather.
    pub async fn load(path: &Path, bootstrap: &Bootstrap, logger: &dyn QueryLog) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => Ok(Denylist::from_lines(data.lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                logger.info(format_args!(
                    "Blocklist file {:?} not found, downloading known ad domains",
                    path
                ));
                let domains = bootstrap.fetch_domains(logger).await;

                match bootstrap.persist(path, &domains).await {
                    Ok(()) => logger.info(format_args!(
                        "Blocklist {:?} created with {} domains",
                        path,
                        domains.len()
                    )),
                    Err(e) => logger.error(format_args!("Failed to create the blocklist {:?}: {:#}", path, e)),
                }

                Ok(Denylist::from_lines(domains.iter().map(String::as_str)))
            }
            Err(e) => Err(e).with_context(|| format!("error while reading the blocklist file {:?}", path)),
        }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        match rule {
            Rule::Exact(domain) => {
                self.exact.insert(domain);
            }
            Rule::Suffix(suffix) => self.suffixes.push(suffix),
            Rule::Prefix(prefix) => self.prefixes.push(prefix),
            Rule::Infix { prefix, suffix } => self.infixes.push(InfixPattern { prefix, suffix }),
        }
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        let domain = domain.strip_suffix('.').unwrap_or(&domain);

        // Look for a direct match first
        if self.exact.contains(domain) {
            return true;
        }

        let matches_suffix = |suffix: &String| {
            domain == suffix.as_str()
                || domain
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        };
        if self.suffixes.iter().any(matches_suffix) {
            return true;
        }

        let matches_prefix = |prefix: &String| {
            domain == prefix.as_str()
                || domain
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        };
        if self.prefixes.iter().any(matches_prefix) {
            return true;
        }

        // NOTE: prefix and suffix may overlap on short domains, e.g. 'a*a' matches 'a'
        self.infixes
            .iter()
            .any(|pattern| domain.starts_with(&pattern.prefix) && domain.ends_with(&pattern.suffix))
    }

    /// Number of rules across all categories.
    pub fn len(&self) -> usize {
        self.exact.len() + self.suffixes.len() + self.prefixes.len() + self.infixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
