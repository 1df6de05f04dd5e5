use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use rand::Rng;

use crate::cache::{basename, CacheKey, CacheToken, ChartCache, ChartRef};
use crate::errors::CacheError;

enum Slot {
    /// The path has already been minted for this key; the writer holding the
    /// token has not yet finished producing the artifact there.
    Pending(PathBuf),
    Ready(PathBuf),
}

/// Single-flight in-memory tier. A missing key's first requester installs a
/// `Pending` sentinel carrying the artifact path *at install time*; any
/// waiter that arrives while the entry is pending observes the exact same
/// path once it transitions to `Ready` — the path is never re-minted on
/// unlock.
pub struct InMemoryCache {
    entries: Mutex<HashMap<CacheKey, Slot>>,
    ready: Condvar,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        InMemoryCache {
            entries: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    fn mint_path(key: &CacheKey) -> PathBuf {
        let suffix: u64 = rand::rng().random();
        std::env::temp_dir().join(format!("{}-{:016x}.tgz", basename(&key.repo, &key.chart_ref), suffix))
    }
}

impl ChartCache for InMemoryCache {
    fn get_or_lock(&self, repo: &str, chart_ref: &ChartRef) -> Result<(PathBuf, Option<CacheToken>), CacheError> {
        let key = CacheKey {
            repo: repo.to_string(),
            chart_ref: chart_ref.clone(),
        };

        let mut guard = self.entries.lock().expect("in-memory cache mutex poisoned");
        loop {
            match guard.get(&key) {
                None => {
                    let path = Self::mint_path(&key);
                    guard.insert(key.clone(), Slot::Pending(path.clone()));
                    return Ok((path, Some(CacheToken::InMemory(key))));
                }
                Some(Slot::Ready(path)) => return Ok((path.clone(), None)),
                Some(Slot::Pending(_)) => {
                    guard = self.ready.wait(guard).expect("in-memory cache condvar poisoned");
                }
            }
        }
    }

    fn set_unlock(&self, token: Option<CacheToken>) -> Result<(), CacheError> {
        let key = match token {
            None => return Ok(()),
            Some(CacheToken::InMemory(key)) => key,
            Some(CacheToken::Fs(..)) => unreachable!("fs token passed to in-memory cache"),
            Some(CacheToken::Null) => unreachable!("null token passed to in-memory cache"),
        };

        let mut guard = self.entries.lock().expect("in-memory cache mutex poisoned");
        let path = match guard.get(&key) {
            Some(Slot::Pending(path)) => path.clone(),
            Some(Slot::Ready(path)) => path.clone(),
            None => return Ok(()),
        };
        guard.insert(key, Slot::Ready(path));
        drop(guard);
        self.ready.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_caller_reuses_first_callers_path() {
        let cache = Arc::new(InMemoryCache::new());
        let chart_ref = ChartRef::new("nginx", "1.0.0");

        let (path1, token1) = cache.get_or_lock("https://example.com", &chart_ref).unwrap();
        assert!(token1.is_some(), "first caller must get a write token");

        let cache2 = cache.clone();
        let chart_ref2 = chart_ref.clone();
        let waiter = thread::spawn(move || cache2.get_or_lock("https://example.com", &chart_ref2).unwrap());

        thread::sleep(Duration::from_millis(50));
        cache.set_unlock(token1).unwrap();

        let (path2, token2) = waiter.join().unwrap();
        assert!(token2.is_none(), "waiter must not receive a write token");
        assert_eq!(path1, path2, "waiter must observe the path minted at first lock, not a re-minted one");
    }

    #[test]
    fn concurrent_requests_for_same_key_fetch_once() {
        let cache = Arc::new(InMemoryCache::new());
        let chart_ref = ChartRef::new("nginx", "2.0.0");
        let fetch_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let chart_ref = chart_ref.clone();
                let fetch_count = fetch_count.clone();
                thread::spawn(move || {
                    let (_path, token) = cache.get_or_lock("https://example.com", &chart_ref).unwrap();
                    if token.is_some() {
                        fetch_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        cache.set_unlock(token).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(fetch_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
