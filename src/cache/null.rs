use std::path::PathBuf;

use rand::Rng;

use crate::cache::{basename, CacheToken, ChartCache, ChartRef};
use crate::errors::CacheError;

/// No-op tier: every call mints a fresh random path and never coordinates
/// with other callers. Used when caching is disabled (`--cache=none`). A
/// freshly minted path never has anything at it, so, unlike the other two
/// tiers, every call is a miss: `get_or_lock` always hands back a token so
/// the caller always re-fetches.
#[derive(Default)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        NullCache
    }
}

impl ChartCache for NullCache {
    fn get_or_lock(&self, repo: &str, chart_ref: &ChartRef) -> Result<(PathBuf, Option<CacheToken>), CacheError> {
        let suffix: u64 = rand::rng().random();
        let path = std::env::temp_dir().join(format!("{}-{:016x}.tgz", basename(repo, chart_ref), suffix));
        Ok((path, Some(CacheToken::Null)))
    }

    fn set_unlock(&self, _token: Option<CacheToken>) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_call_mints_a_distinct_path_and_requires_a_fetch() {
        let cache = NullCache::new();
        let chart_ref = ChartRef::new("nginx", "1.0.0");
        let (path1, token1) = cache.get_or_lock("https://example.com", &chart_ref).unwrap();
        let (path2, token2) = cache.get_or_lock("https://example.com", &chart_ref).unwrap();
        assert!(token1.is_some(), "a fresh path is always a miss, never a hit");
        assert!(token2.is_some());
        assert_ne!(path1, path2);
    }
}
