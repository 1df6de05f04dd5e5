use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tempfile::TempDir;
use walkdir::WalkDir;

use crate::cmd::command::{CommandKiller, ExecutableCommand, ExternalCommand};
use crate::errors::OverlayError;
use crate::model::Resource;
use crate::worker::CancellationContext;

const KUSTOMIZATION_NAMES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// The underlying `kustomize` engine is assumed non-reentrant; every call
/// into it — synthesis and build alike — is serialized through this
/// process-wide mutex.
fn overlay_mutex() -> &'static Mutex<()> {
    static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    MUTEX.get_or_init(|| Mutex::new(()))
}

pub struct OverlayBuilder {
    kustomize_binary: String,
}

impl OverlayBuilder {
    pub fn new(kustomize_binary: impl Into<String>) -> Self {
        OverlayBuilder {
            kustomize_binary: kustomize_binary.into(),
        }
    }

    /// Given a filesystem path, produces the resource list plus the
    /// serialized YAML that was used to build it.
    pub fn build(&self, path: &str, ctx: &CancellationContext) -> Result<(Vec<Resource>, String), OverlayError> {
        let (staged_dir, _guard) = self.stage(path)?;
        let target_dir = staged_dir.as_ref();

        let _synth_guard;
        let compose_path = if find_kustomization_file(target_dir).is_some() {
            target_dir.to_path_buf()
        } else {
            _synth_guard = synthesize_kustomization(target_dir)?;
            target_dir.to_path_buf()
        };

        let yaml = {
            let _lock = overlay_mutex().lock().expect("overlay mutex poisoned");
            self.run_kustomize_build(&compose_path, ctx)?
        };

        let resources = parse_resources(&yaml, path)?;
        Ok((resources, yaml))
    }

    fn run_kustomize_build(&self, dir: &Path, ctx: &CancellationContext) -> Result<String, OverlayError> {
        let dir_str = dir.to_string_lossy().to_string();
        let mut cmd = ExternalCommand::new(&self.kustomize_binary, &["build", &dir_str], &[]);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let is_canceled = || ctx.is_cancelled();
        let killer = CommandKiller::from(Duration::from_secs(10 * 60), &is_canceled);

        cmd.exec_with_abort(
            &mut |line| {
                stdout.push_str(&line);
                stdout.push('\n');
            },
            &mut |line| {
                stderr.push_str(&line);
                stderr.push('\n');
            },
            &killer,
        )
        .map_err(|source| OverlayError::Compose {
            path: dir_str.clone(),
            source,
        })?;

        Ok(stdout)
    }

    /// Resolves special paths (`-`/`/dev/stdin`, a plain file) into a
    /// directory `kustomize` can be pointed at, returning that directory
    /// plus a guard that removes any temp dir it created.
    fn stage(&self, path: &str) -> Result<(StagedDir, TempDirGuard), OverlayError> {
        if path == "-" || path == "/dev/stdin" {
            let tmp = TempDir::new().map_err(|source| OverlayError::Stage {
                path: path.to_string(),
                source,
            })?;
            let mut input = Vec::new();
            std::io::stdin()
                .read_to_end(&mut input)
                .map_err(|source| OverlayError::Read {
                    path: path.to_string(),
                    source,
                })?;
            std::fs::write(tmp.path().join("stdin.yaml"), input).map_err(|source| OverlayError::Stage {
                path: path.to_string(),
                source,
            })?;
            return Ok((StagedDir::Temp(tmp), TempDirGuard));
        }

        let meta = std::fs::metadata(path).map_err(|source| OverlayError::Read {
            path: path.to_string(),
            source,
        })?;

        if meta.is_dir() {
            return Ok((StagedDir::Existing(PathBuf::from(path)), TempDirGuard));
        }

        // Plain file: wrap it in a temp directory via a symlink so kustomize
        // sees a directory containing exactly one file.
        let tmp = TempDir::new().map_err(|source| OverlayError::Stage {
            path: path.to_string(),
            source,
        })?;
        let absolute = std::fs::canonicalize(path).map_err(|source| OverlayError::Stage {
            path: path.to_string(),
            source,
        })?;
        let link_name = absolute
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("overlay.yaml"));
        symlink(&absolute, tmp.path().join(link_name)).map_err(|source| OverlayError::Stage {
            path: path.to_string(),
            source,
        })?;

        Ok((StagedDir::Temp(tmp), TempDirGuard))
    }
}

#[cfg(unix)]
fn symlink(original: &Path, link: PathBuf) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(original: &Path, link: PathBuf) -> std::io::Result<()> {
    std::fs::copy(original, link).map(|_| ())
}

enum StagedDir {
    Existing(PathBuf),
    Temp(TempDir),
}

impl AsRef<Path> for StagedDir {
    fn as_ref(&self) -> &Path {
        match self {
            StagedDir::Existing(path) => path.as_path(),
            StagedDir::Temp(tmp) => tmp.path(),
        }
    }
}

/// Keeps the staged temp dir alive for the duration of `build`; dropped at
/// the end of the call, removing it.
struct TempDirGuard;

fn find_kustomization_file(dir: &Path) -> Option<PathBuf> {
    KUSTOMIZATION_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Writes a synthesized `kustomization.yaml` into `dir` listing every
/// accepted file/subdirectory, removing it again once the returned guard
/// drops.
fn synthesize_kustomization(dir: &Path) -> Result<scopeguard::ScopeGuard<PathBuf, impl FnOnce(PathBuf)>, OverlayError> {
    let mut resource_paths = Vec::new();

    let mut it = WalkDir::new(dir).min_depth(1).into_iter();
    while let Some(entry) = it.next() {
        let entry = entry.map_err(|err| OverlayError::Walk {
            path: dir.display().to_string(),
            source: err.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")),
        })?;

        if entry.file_type().is_dir() {
            if find_kustomization_file(entry.path()).is_some() {
                resource_paths.push(relative(dir, entry.path()));
                // Accept this subdirectory as a whole and don't descend any
                // further into it, however deeply nested its own
                // kustomization files are.
                it.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        let contents = match std::fs::read(entry.path()) {
            Ok(contents) => contents,
            Err(_) => continue,
        };

        if parse_resources(&String::from_utf8_lossy(&contents), &entry.path().display().to_string()).is_ok() {
            resource_paths.push(relative(dir, entry.path()));
        }
    }

    if resource_paths.is_empty() {
        return Err(OverlayError::Empty(dir.display().to_string()));
    }

    let kustomization_path = dir.join("kustomization.yaml");
    let doc = serde_yaml::to_string(&serde_yaml::Mapping::from_iter([(
        serde_yaml::Value::String("resources".to_string()),
        serde_yaml::Value::Sequence(resource_paths.iter().map(|p| serde_yaml::Value::String(p.clone())).collect()),
    )]))
    .map_err(|source| OverlayError::Stage {
        path: dir.display().to_string(),
        source: std::io::Error::other(source),
    })?;

    std::fs::write(&kustomization_path, doc).map_err(|source| OverlayError::Stage {
        path: dir.display().to_string(),
        source,
    })?;

    Ok(scopeguard::guard(kustomization_path, |path| {
        let _ = std::fs::remove_file(path);
    }))
}

fn relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).to_string_lossy().to_string()
}

pub(crate) fn parse_resources(yaml: &str, source_path: &str) -> Result<Vec<Resource>, OverlayError> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document).map_err(|_| OverlayError::Empty(source_path.to_string()))?;
        if value.is_null() {
            continue;
        }
        let resource = Resource::from_value(value).map_err(|_| OverlayError::Empty(source_path.to_string()))?;
        resources.push(resource);
    }
    Ok(resources)
}

use serde::Deserialize;
