mod util;

use std::fmt;

pub use util::hash_to_hex;

/// Where the answer to a query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Denylist,
    Cache,
    Upstream,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self {
            ResponseSource::Denylist => "denylist",
            ResponseSource::Cache => "cache",
            ResponseSource::Upstream => "upstream",
        };
        f.write_str(source)
    }
}
