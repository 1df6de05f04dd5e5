mod fs;
mod inmemory;
mod null;

use std::path::PathBuf;
use std::str::FromStr;

pub use fs::FsCache;
pub use inmemory::InMemoryCache;
pub use null::NullCache;

use crate::errors::{CacheError, ConfigError};

/// `(chart, version)` half of the cache key; the repo URL is normalized and
/// hashed separately (§6 persistent path format).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChartRef {
    pub chart: String,
    pub version: String,
}

impl ChartRef {
    pub fn new(chart: impl Into<String>, version: impl Into<String>) -> Self {
        ChartRef {
            chart: chart.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ChartRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chart, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo: String,
    pub chart_ref: ChartRef,
}

/// Opaque handle returned by `get_or_lock` on a cache miss. Must be passed to
/// `set_unlock` exactly once; a `None` token is a no-op.
pub enum CacheToken {
    InMemory(CacheKey),
    Fs(std::fs::File, PathBuf),
    Null,
}

pub trait ChartCache: Send + Sync {
    fn get_or_lock(&self, repo: &str, chart_ref: &ChartRef) -> Result<(PathBuf, Option<CacheToken>), CacheError>;
    fn set_unlock(&self, token: Option<CacheToken>) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CacheType {
    None,
    Inmemory,
    Fs,
}

impl FromStr for CacheType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CacheType::None),
            "inmemory" => Ok(CacheType::Inmemory),
            "fs" => Ok(CacheType::Fs),
            other => Err(ConfigError::InvalidValue {
                field: "cache",
                value: other.to_string(),
                valid: "none, inmemory, fs",
            }),
        }
    }
}

pub fn new_cache(cache_type: CacheType, cache_dir: &std::path::Path) -> Result<Box<dyn ChartCache>, CacheError> {
    match cache_type {
        CacheType::None => Ok(Box::new(NullCache::new())),
        CacheType::Inmemory => Ok(Box::new(InMemoryCache::new())),
        CacheType::Fs => Ok(Box::new(FsCache::new(cache_dir)?)),
    }
}

/// FNV-1a, 32-bit, exactly as specified for the persistent cache filename
/// format (`<hash>%<chart>:<version>.tgz`).
pub fn fnv1a32(data: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    let mut hash = OFFSET_BASIS;
    for byte in data.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Trims a trailing slash, lowercases the scheme and host, so `https://x/`
/// and `https://X` hash identically. Falls back to the trimmed input
/// verbatim for anything `url` can't parse as an absolute URL (e.g. a bare
/// OCI reference with no authority).
pub fn normalize_repo_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    let Ok(mut parsed) = url::Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    let _ = parsed.set_scheme(&scheme);
    if let Some(host) = parsed.host_str() {
        let host = host.to_ascii_lowercase();
        let _ = parsed.set_host(Some(&host));
    }

    let mut normalized = parsed.to_string();
    if parsed.path() == "/" && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

pub fn basename(repo: &str, chart_ref: &ChartRef) -> String {
    format!("{:08x}%{}", fnv1a32(&normalize_repo_url(repo)), chart_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_slash_and_lowercases_host() {
        assert_eq!(normalize_repo_url("https://X/"), normalize_repo_url("https://x"));
        assert_eq!(normalize_repo_url("HTTPS://Example.com/path/"), "https://example.com/path");
    }

    #[test]
    fn fnv1a32_is_stable_known_vector() {
        // "" hashes to the FNV-1a 32-bit offset basis.
        assert_eq!(fnv1a32(""), 0x811c9dc5);
    }

    #[test]
    fn basename_matches_persistent_path_format() {
        let name = basename("https://charts.example.com", &ChartRef::new("nginx", "1.2.3"));
        assert!(name.contains('%'));
        assert!(name.ends_with("nginx:1.2.3"));
        assert_eq!(name.len(), 8 + 1 + "nginx:1.2.3".len());
    }
}
