use std::path::PathBuf;

use clap::Parser;

use crate::cache::CacheType;
use crate::errors::ConfigError;
use crate::logger::{LogEncoding, LogLevel};

const DEFAULT_OUTPUT: &str = "/dev/stdout";
const DEFAULT_KUBE_VERSION: &str = "1.31.0";

/// Flags and env overrides for one run of the build engine. Every flag in
/// §6 has a matching uppercase, `_`-separated env var via clap's `env`
/// attribute; `PATHS` is handled separately since it backs a positional arg.
#[derive(Parser, Debug)]
#[command(
    name = "flux-build",
    version,
    about = "Materializes Kubernetes manifests from overlay directories, rendering referenced Helm releases"
)]
pub struct Cli {
    /// One or more overlay paths. Falls back to the PATHS env var
    /// (comma-separated) when empty.
    #[arg(value_name = "PATH")]
    pub paths: Vec<String>,

    /// Output file ("/dev/stdout" writes to standard output).
    #[arg(short, long, env = "OUTPUT", default_value = DEFAULT_OUTPUT)]
    pub output: String,

    /// Helm render parallelism. Defaults to the host's CPU count.
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// Cancel remaining work on the first error.
    #[arg(long, env = "FAIL_FAST")]
    pub fail_fast: bool,

    /// Suppress the nonzero exit status on error (diagnostics still print).
    #[arg(long, env = "ALLOW_FAILURE")]
    pub allow_failure: bool,

    /// Emit rendered Helm hook manifests alongside normal templates.
    #[arg(long, env = "INCLUDE_HELM_HOOKS")]
    pub include_helm_hooks: bool,

    /// Capabilities.KubeVersion passed to `helm template`.
    #[arg(long, env = "KUBE_VERSION", default_value = DEFAULT_KUBE_VERSION)]
    pub kube_version: String,

    /// Comma-separated Capabilities.APIVersions passed to `helm template`.
    #[arg(long, env = "API_VERSIONS")]
    pub api_versions: Option<String>,

    /// Chart artifact cache tier: none, inmemory, or fs.
    #[arg(long, env = "CACHE", default_value = "inmemory")]
    pub cache: String,

    /// Persistent cache root, used only when `--cache=fs`.
    #[arg(long, env = "CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Minimum log level emitted.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log line encoding: json or console.
    #[arg(long, env = "LOG_ENCODING", default_value = "json")]
    pub log_encoding: String,
}

/// The validated, defaulted form of `Cli`: everything downstream consumes
/// this, never the raw flag strings.
pub struct ResolvedConfig {
    pub paths: Vec<String>,
    pub output: String,
    pub workers: usize,
    pub fail_fast: bool,
    pub allow_failure: bool,
    pub include_helm_hooks: bool,
    pub kube_version: String,
    pub api_versions: Vec<String>,
    pub cache_type: CacheType,
    pub cache_dir: PathBuf,
    pub log_level: LogLevel,
    pub log_encoding: LogEncoding,
}

impl Cli {
    /// Parses `std::env::args`, then validates/defaults into a
    /// `ResolvedConfig`. Never panics or calls `process::exit` on invalid
    /// input: every failure, clap's own included, surfaces as
    /// `ConfigError`, matching §7's "configuration" error kind.
    pub fn resolve() -> Result<ResolvedConfig, ConfigError> {
        let cli = match Cli::try_parse() {
            Ok(cli) => cli,
            // `--help`/`--version` are not configuration failures: let clap
            // print them and exit 0 as usual.
            Err(err) if !err.use_stderr() => err.exit(),
            Err(err) => return Err(ConfigError::Parse(err.to_string())),
        };
        cli.into_resolved()
    }

    fn into_resolved(self) -> Result<ResolvedConfig, ConfigError> {
        let paths = resolve_paths(self.paths)?;
        let workers = self.workers.unwrap_or_else(num_cpus::get).max(1);
        let api_versions = self
            .api_versions
            .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let cache_type: CacheType = self.cache.parse()?;
        let cache_dir = self.cache_dir.unwrap_or_else(default_cache_dir);
        let log_level: LogLevel = self.log_level.parse()?;
        let log_encoding: LogEncoding = self.log_encoding.parse()?;

        Ok(ResolvedConfig {
            paths,
            output: self.output,
            workers,
            fail_fast: self.fail_fast,
            allow_failure: self.allow_failure,
            include_helm_hooks: self.include_helm_hooks,
            kube_version: self.kube_version,
            api_versions,
            cache_type,
            cache_dir,
            log_level,
            log_encoding,
        })
    }
}

fn resolve_paths(positional: Vec<String>) -> Result<Vec<String>, ConfigError> {
    if !positional.is_empty() {
        return Ok(positional);
    }

    let from_env = std::env::var("PATHS").unwrap_or_default();
    let paths: Vec<String> = from_env.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();

    if paths.is_empty() {
        Err(ConfigError::NoPaths)
    } else {
        Ok(paths)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("flux-build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_paths_and_empty_env_is_a_config_error() {
        std::env::remove_var("PATHS");
        let err = resolve_paths(vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::NoPaths));
    }

    #[test]
    fn paths_env_fallback_is_comma_split() {
        std::env::set_var("PATHS_TEST_FIXTURE", "unused");
        let saved = std::env::var("PATHS").ok();
        std::env::set_var("PATHS", "./a, ./b ,./c");
        let resolved = resolve_paths(vec![]).unwrap();
        assert_eq!(resolved, vec!["./a", "./b", "./c"]);
        match saved {
            Some(value) => std::env::set_var("PATHS", value),
            None => std::env::remove_var("PATHS"),
        }
    }

    #[test]
    fn positional_paths_take_priority_over_env() {
        std::env::set_var("PATHS", "./ignored");
        let resolved = resolve_paths(vec!["./explicit".to_string()]).unwrap();
        assert_eq!(resolved, vec!["./explicit"]);
        std::env::remove_var("PATHS");
    }
}
