use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::cache::normalize_repo_url;
use crate::cmd::command::{CommandKiller, ExecutableCommand, ExternalCommand};
use crate::errors::HelmBuildError;
use crate::model::{HelmRepository, Secret};
use crate::worker::CancellationContext;

const OCI_LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Username/password/CA pulled from the `HelmRepository`'s referenced
/// `Secret`, if any.
#[derive(Debug, Clone, Default)]
pub struct RepoAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

impl RepoAuth {
    pub fn from_secret(secret: &Secret) -> Self {
        RepoAuth {
            username: secret.string_data.get("username").cloned(),
            password: secret.string_data.get("password").cloned(),
            ca_cert: secret.string_data.get("caFile").cloned(),
        }
    }
}

/// A repository client bound to one normalized URL: either a classic HTTP
/// chart index, or an OCI registry (optionally already logged in).
pub enum ChartDownloader {
    Http { url: String, auth: RepoAuth },
    Oci { url: String },
}

impl ChartDownloader {
    /// Builds the downloader, performing the OCI login handshake once (under
    /// its own 1-minute timeout, independent of the shared fail-fast
    /// context) when the repository is OCI and credentials are available.
    pub fn build(helm_binary: &str, repo: &HelmRepository, auth: RepoAuth) -> Result<ChartDownloader, HelmBuildError> {
        let normalized = normalize_repo_url(&repo.spec.url);

        if !repo.is_oci() {
            return Ok(ChartDownloader::Http { url: normalized, auth });
        }

        // `aws|azure|gcp` providers resolve credentials through the cloud
        // SDK's own default chain (here: `helm`'s credential helper plugins,
        // already configured in the caller's environment) rather than a
        // referenced Secret, so an explicit `registry login` is skipped.
        let is_cloud_provider = matches!(repo.spec.provider.as_deref(), Some("aws") | Some("azure") | Some("gcp"));

        if !is_cloud_provider {
            if let (Some(username), Some(password)) = (auth.username.as_deref(), auth.password.as_deref()) {
                let registry_host = normalized.trim_start_matches("oci://");
                let mut cmd = ExternalCommand::new(helm_binary, &["registry", "login", registry_host, "--username", username, "--password", password], &[]);
                let is_canceled = || false;
                let killer = CommandKiller::from(OCI_LOGIN_TIMEOUT, &is_canceled);
                cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &killer)?;
            }
        }

        Ok(ChartDownloader::Oci { url: normalized })
    }

    /// Pulls `chart:version` into `dest_dir`, returning the path to the
    /// downloaded `.tgz`. Shells out to `helm pull`.
    pub fn pull(
        &self,
        helm_binary: &str,
        chart: &str,
        version: &str,
        dest_dir: &Path,
        ctx: &CancellationContext,
    ) -> Result<PathBuf, HelmBuildError> {
        let is_canceled = || ctx.is_cancelled();
        let killer = CommandKiller::from(Duration::from_secs(5 * 60), &is_canceled);
        let dest = dest_dir.to_string_lossy().to_string();

        match self {
            ChartDownloader::Http { url, auth } => {
                let mut args: Vec<String> = vec![
                    "pull".to_string(),
                    chart.to_string(),
                    "--repo".to_string(),
                    url.clone(),
                    "--version".to_string(),
                    version.to_string(),
                    "--destination".to_string(),
                    dest.clone(),
                ];

                if let Some(username) = auth.username.as_deref() {
                    args.push("--username".to_string());
                    args.push(username.to_string());
                }
                if let Some(password) = auth.password.as_deref() {
                    args.push("--password".to_string());
                    args.push(password.to_string());
                }

                // `helm pull --ca-file` takes a path, not inline PEM bytes, so
                // the referenced Secret's CA material is staged to a temp
                // file for the duration of this one invocation.
                let _ca_dir;
                if let Some(ca_cert) = auth.ca_cert.as_deref() {
                    let dir = TempDir::new()?;
                    let ca_path = dir.path().join("ca.crt");
                    std::fs::write(&ca_path, ca_cert)?;
                    args.push("--ca-file".to_string());
                    args.push(ca_path.to_string_lossy().into_owned());
                    _ca_dir = Some(dir);
                } else {
                    _ca_dir = None;
                }

                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                let mut cmd = ExternalCommand::new(helm_binary, &arg_refs, &[]);
                cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &killer)?;
            }
            ChartDownloader::Oci { url } => {
                let reference = format!("{}/{}", url.trim_end_matches('/'), chart);
                let mut cmd = ExternalCommand::new(
                    helm_binary,
                    &["pull", &reference, "--version", version, "--destination", &dest],
                    &[],
                );
                cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &killer)?;
            }
        }

        find_tarball(dest_dir, chart, version)
    }
}

fn find_tarball(dir: &Path, chart: &str, version: &str) -> Result<PathBuf, HelmBuildError> {
    let expected_prefix = format!("{chart}-{version}");
    let entries = std::fs::read_dir(dir).map_err(HelmBuildError::Io)?;
    for entry in entries {
        let entry = entry.map_err(HelmBuildError::Io)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&expected_prefix) && name.ends_with(".tgz") {
            return Ok(entry.path());
        }
    }
    Err(HelmBuildError::Render(format!(
        "`helm pull` did not produce an artifact matching {expected_prefix}*.tgz in {}",
        dir.display()
    )))
}

enum Slot {
    Pending,
    Ready(Arc<ChartDownloader>),
}

/// Single-flight cache of `ChartDownloader`s keyed by normalized repository
/// URL, so that many releases sharing a repository pay the login handshake
/// once.
#[derive(Default)]
pub struct RepositoryCache {
    entries: Mutex<HashMap<String, Slot>>,
    ready: Condvar,
}

impl RepositoryCache {
    pub fn new() -> Self {
        RepositoryCache {
            entries: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    /// Returns the cached downloader for `url`, building it via `build` if
    /// this is the first request for that key. Concurrent requests for the
    /// same key block until the first finishes.
    pub fn get_or_build<F>(&self, url: &str, build: F) -> Result<Arc<ChartDownloader>, HelmBuildError>
    where
        F: FnOnce() -> Result<ChartDownloader, HelmBuildError>,
    {
        let key = normalize_repo_url(url);

        {
            let mut guard = self.entries.lock().expect("repository cache mutex poisoned");
            loop {
                match guard.get(&key) {
                    Some(Slot::Ready(downloader)) => return Ok(downloader.clone()),
                    Some(Slot::Pending) => {
                        guard = self.ready.wait(guard).expect("repository cache condvar poisoned");
                    }
                    None => {
                        guard.insert(key.clone(), Slot::Pending);
                        break;
                    }
                }
            }
        }

        let result = build();

        let mut guard = self.entries.lock().expect("repository cache mutex poisoned");
        match &result {
            Ok(downloader) => {
                guard.insert(key, Slot::Ready(Arc::new(clone_downloader(downloader))));
            }
            Err(_) => {
                guard.remove(&key);
            }
        }
        drop(guard);
        self.ready.notify_all();

        result.map(Arc::new)
    }
}

fn clone_downloader(downloader: &ChartDownloader) -> ChartDownloader {
    match downloader {
        ChartDownloader::Http { url, auth } => ChartDownloader::Http {
            url: url.clone(),
            auth: auth.clone(),
        },
        ChartDownloader::Oci { url } => ChartDownloader::Oci { url: url.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn repo_auth_reads_username_password_and_ca_from_secret() {
        let secret = Secret {
            metadata: crate::model::HelmReleaseMetadata {
                name: "repo-creds".to_string(),
                namespace: "flux-system".to_string(),
            },
            data: Default::default(),
            string_data: btreemap! {
                "username".to_string() => "admin".to_string(),
                "password".to_string() => "hunter2".to_string(),
                "caFile".to_string() => "-----BEGIN CERTIFICATE-----".to_string(),
            },
        };

        let auth = RepoAuth::from_secret(&secret);
        assert_eq!(auth.username.as_deref(), Some("admin"));
        assert_eq!(auth.password.as_deref(), Some("hunter2"));
        assert_eq!(auth.ca_cert.as_deref(), Some("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn repo_auth_from_secret_missing_fields_is_none() {
        let secret = Secret {
            metadata: crate::model::HelmReleaseMetadata {
                name: "partial".to_string(),
                namespace: "flux-system".to_string(),
            },
            data: Default::default(),
            string_data: btreemap! { "username".to_string() => "admin".to_string() },
        };

        let auth = RepoAuth::from_secret(&secret);
        assert_eq!(auth.username.as_deref(), Some("admin"));
        assert!(auth.password.is_none());
        assert!(auth.ca_cert.is_none());
    }

    #[test]
    fn concurrent_requests_for_same_url_build_once() {
        let cache = Arc::new(RepositoryCache::new());
        let build_count = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                let build_count = build_count.clone();
                thread::spawn(move || {
                    cache
                        .get_or_build("https://charts.example.com", || {
                            build_count.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(StdDuration::from_millis(20));
                            Ok(ChartDownloader::Http {
                                url: "https://charts.example.com".to_string(),
                                auth: RepoAuth::default(),
                            })
                        })
                        .unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn normalized_urls_share_the_same_entry() {
        let cache = RepositoryCache::new();
        let build_count = Arc::new(AtomicUsize::new(0));

        let bc = build_count.clone();
        cache
            .get_or_build("https://Example.com/", || {
                bc.fetch_add(1, Ordering::SeqCst);
                Ok(ChartDownloader::Http {
                    url: "https://example.com".to_string(),
                    auth: RepoAuth::default(),
                })
            })
            .unwrap();

        let bc = build_count.clone();
        cache
            .get_or_build("https://example.com", || {
                bc.fetch_add(1, Ordering::SeqCst);
                Ok(ChartDownloader::Http {
                    url: "https://example.com".to_string(),
                    auth: RepoAuth::default(),
                })
            })
            .unwrap();

        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }
}
