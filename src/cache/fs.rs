use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::cache::{basename, CacheToken, ChartCache, ChartRef};
use crate::errors::CacheError;

/// One byte written to the lockfile once the artifact is complete. Matches
/// the persistent on-disk contract exactly (§6).
const READY: u8 = 0xFE;

/// Filesystem tier: a sibling `<name>.lock` file per artifact, held with an
/// OS advisory exclusive lock (`flock`) for the duration of a write. Cleans
/// up safely on abnormal exit because the OS releases the lock when the
/// holding process dies, regardless of whether `set_unlock` ran.
pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    pub fn new(dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(FsCache { dir: dir.to_path_buf() })
    }
}

impl ChartCache for FsCache {
    fn get_or_lock(&self, repo: &str, chart_ref: &ChartRef) -> Result<(PathBuf, Option<CacheToken>), CacheError> {
        let base = basename(repo, chart_ref);
        let path = self.dir.join(format!("{base}.tgz"));
        let lock_path = self.dir.join(format!("{base}.tgz.lock"));

        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|source| CacheError::Lock {
                path: lock_path.display().to_string(),
                source,
            })?;

        FileExt::lock_exclusive(&lock_file).map_err(|source| CacheError::Lock {
            path: lock_path.display().to_string(),
            source,
        })?;

        let mut buf = Vec::new();
        lock_file.read_to_end(&mut buf).map_err(|source| CacheError::Io {
            path: lock_path.display().to_string(),
            source,
        })?;

        if buf.first() == Some(&READY) {
            let _ = FileExt::unlock(&lock_file);
            return Ok((path, None));
        }

        if !buf.is_empty() {
            let _ = FileExt::unlock(&lock_file);
            return Err(CacheError::CorruptLock(lock_path.display().to_string()));
        }

        Ok((path, Some(CacheToken::Fs(lock_file, lock_path))))
    }

    fn set_unlock(&self, token: Option<CacheToken>) -> Result<(), CacheError> {
        let (mut file, lock_path) = match token {
            None => return Ok(()),
            Some(CacheToken::Fs(file, lock_path)) => (file, lock_path),
            Some(CacheToken::InMemory(_)) => unreachable!("in-memory token passed to fs cache"),
            Some(CacheToken::Null) => unreachable!("null token passed to fs cache"),
        };

        file.seek(SeekFrom::Start(0)).map_err(|source| CacheError::Io {
            path: lock_path.display().to_string(),
            source,
        })?;
        file.write_all(&[READY]).map_err(|source| CacheError::Io {
            path: lock_path.display().to_string(),
            source,
        })?;
        file.flush().map_err(|source| CacheError::Io {
            path: lock_path.display().to_string(),
            source,
        })?;
        let _ = FileExt::unlock(&file);
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
    fn first_caller_gets_write_token_second_waits_for_ready() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FsCache::new(dir.path()).unwrap());
        let chart_ref = ChartRef::new("nginx", "1.0.0");

        let (path1, token1) = cache.get_or_lock("https://example.com", &chart_ref).unwrap();
        assert!(token1.is_some());

        let cache2 = cache.clone();
        let chart_ref2 = chart_ref.clone();
        let waiter = thread::spawn(move || cache2.get_or_lock("https://example.com", &chart_ref2).unwrap());

        thread::sleep(Duration::from_millis(50));
        std::fs::write(&path1, b"fake chart bytes").unwrap();
        cache.set_unlock(token1).unwrap();

        let (path2, token2) = waiter.join().unwrap();
        assert!(token2.is_none());
        assert_eq!(path1, path2);
    }

    #[test]
    fn corrupt_lock_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path()).unwrap();
        let chart_ref = ChartRef::new("nginx", "1.0.0");
        let base = crate::cache::basename("https://example.com", &chart_ref);
        std::fs::write(dir.path().join(format!("{base}.tgz.lock")), b"garbage").unwrap();

        let result = cache.get_or_lock("https://example.com", &chart_ref);
        assert!(matches!(result, Err(CacheError::CorruptLock(_))));
    }
}
