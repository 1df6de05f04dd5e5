use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tempfile::TempDir;

use crate::cache::{ChartCache, ChartRef};
use crate::cmd::command::{CommandKiller, ExecutableCommand, ExternalCommand};
use crate::crdpolicy;
use crate::errors::HelmBuildError;
use crate::index::ResourceIndex;
use crate::model::{HelmRelease, HelmRepository, ReferenceKey, Resource, Secret, HELM_REPOSITORY_GROUP};
use crate::overlay::{self, OverlayBuilder};
use crate::postrender;
use crate::repository::{ChartDownloader, RepoAuth, RepositoryCache};
use crate::values::compose_values;
use crate::worker::CancellationContext;

/// Matches the Qovery-engine CLI's own default, carried over as the default
/// Helm render timeout.
pub const DEFAULT_HELM_TIMEOUT_SECONDS: u32 = 300;
const DEFAULT_CRD_POLICY: &str = "Create";

pub struct HelmBuildOpts {
    pub helm_binary: String,
    pub kustomize_binary: String,
    pub kube_version: String,
    pub api_versions: Vec<String>,
    pub include_helm_hooks: bool,
}

pub struct HelmBuilder {
    opts: HelmBuildOpts,
    cache: Arc<dyn ChartCache>,
    repo_cache: RepositoryCache,
    cache_hits: AtomicUsize,
    cache_fetches: AtomicUsize,
}

impl HelmBuilder {
    pub fn new(opts: HelmBuildOpts, cache: Arc<dyn ChartCache>) -> Self {
        HelmBuilder {
            opts,
            cache,
            repo_cache: RepositoryCache::new(),
            cache_hits: AtomicUsize::new(0),
            cache_fetches: AtomicUsize::new(0),
        }
    }

    /// `(cache hits, cache fetches)` observed so far, for the run summary.
    pub fn cache_stats(&self) -> (usize, usize) {
        (self.cache_hits.load(Ordering::Relaxed), self.cache_fetches.load(Ordering::Relaxed))
    }

    /// Renders one HelmRelease resource end to end: resolves its chart
    /// source, fetches the chart, composes values, renders via `helm
    /// template`, applies the post-render chain, and re-composes the result
    /// through the overlay engine.
    pub fn build(&self, release_resource: &Resource, index: &ResourceIndex, ctx: &CancellationContext) -> Result<(Vec<Resource>, String), HelmBuildError> {
        let substituted = envsubst(&release_resource.to_yaml_string()?)?;
        let release: HelmRelease = serde_yaml::from_str(&substituted)?;

        let source_namespace = release.source_namespace();
        let source_ref = release
            .spec
            .chart
            .as_ref()
            .map(|c| c.spec.source_ref.clone())
            .ok_or_else(|| HelmBuildError::UnsupportedSourceKind("<missing chart>".to_string()))?;

        let lookup_key = ReferenceKey::new(HELM_REPOSITORY_GROUP, source_ref.kind.clone(), source_namespace.clone(), source_ref.name.clone());
        let source = index.lookup(&lookup_key).ok_or_else(|| HelmBuildError::SourceNotFound {
            kind: source_ref.kind.clone(),
            name: source_ref.name.clone(),
            namespace: source_namespace.clone(),
            release: release.metadata.name.clone(),
        })?;

        if source_ref.kind != "HelmRepository" {
            return Err(HelmBuildError::UnsupportedSourceKind(source_ref.kind.clone()));
        }

        let repo: HelmRepository = serde_yaml::from_value(source.body.clone())?;
        let auth = self.resolve_repo_auth(&repo, index)?;

        let helm_binary = self.opts.helm_binary.clone();
        let downloader = self.repo_cache.get_or_build(&repo.spec.url, || ChartDownloader::build(&helm_binary, &repo, auth))?;

        let chart_spec = release.spec.chart.as_ref().expect("checked above");
        let chart_ref = ChartRef::new(chart_spec.spec.chart.clone(), chart_spec.spec.version.clone());
        let (chart_path, token) = self.cache.get_or_lock(&repo.spec.url, &chart_ref)?;

        if token.is_some() {
            self.cache_fetches.fetch_add(1, Ordering::Relaxed);
            let dest_dir = chart_path.parent().map(|p| p.to_path_buf()).unwrap_or_else(std::env::temp_dir);
            std::fs::create_dir_all(&dest_dir)?;
            let downloaded = downloader.pull(&self.opts.helm_binary, &chart_spec.spec.chart, &chart_spec.spec.version, &dest_dir, ctx)?;
            if downloaded != chart_path {
                std::fs::rename(&downloaded, &chart_path)?;
            }
        } else {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.cache.set_unlock(token)?;

        let values = compose_values(&release, index)?;
        let manifest = self.render(&release, &chart_path, &values, ctx)?;

        let mut resources = overlay::parse_resources(&manifest, "helm-release")
            .map_err(|source| HelmBuildError::PostRender(source.to_string()))?;

        let target_namespace = release.target_namespace().to_string();
        postrender::inject_namespace(&mut resources, &target_namespace);

        // Post-render ordering (§4.7 step 6): namespace injection above,
        // then any user-declared Kustomize patches/images applied by
        // re-composing this same staging directory through the overlay
        // engine, then origin labels last, on the overlay engine's actual
        // output (not the pre-patch resources).
        let staging = TempDir::new()?;
        write_staged_resources(&resources, staging.path())?;
        self.apply_user_kustomize(&release, staging.path(), resources.len())?;

        let overlay_builder = OverlayBuilder::new(&self.opts.kustomize_binary);
        let (mut final_resources, _) = overlay_builder
            .build(&staging.path().to_string_lossy(), ctx)
            .map_err(|source| HelmBuildError::PostRender(source.to_string()))?;

        postrender::inject_origin_labels(&mut final_resources, release.namespace(), &release.metadata.name);
        let final_yaml = write_resources(&final_resources)?;

        Ok((final_resources, final_yaml))
    }

    fn resolve_repo_auth(&self, repo: &HelmRepository, index: &ResourceIndex) -> Result<RepoAuth, HelmBuildError> {
        let Some(secret_ref) = &repo.spec.secret_ref else {
            return Ok(RepoAuth::default());
        };
        let key = ReferenceKey::new(String::new(), "Secret", repo_namespace(repo), secret_ref.name.clone());
        let secret_resource = index
            .lookup(&key)
            .ok_or_else(|| HelmBuildError::SourceNotFound {
                kind: "Secret".to_string(),
                name: secret_ref.name.clone(),
                namespace: repo_namespace(repo),
                release: String::new(),
            })?;
        let secret: Secret = serde_yaml::from_value(secret_resource.body.clone())?;
        Ok(RepoAuth::from_secret(&secret))
    }

    fn render(&self, release: &HelmRelease, chart_path: &Path, values: &serde_yaml::Value, ctx: &CancellationContext) -> Result<String, HelmBuildError> {
        let values_file = TempDir::new()?;
        let values_path = values_file.path().join("values.yaml");
        std::fs::write(&values_path, serde_yaml::to_string(values)?)?;

        let timeout_secs = release
            .spec
            .timeout
            .as_deref()
            .map(parse_duration_secs)
            .unwrap_or(DEFAULT_HELM_TIMEOUT_SECONDS);

        let policy = crdpolicy::validate(release.effective_crd_policy().as_deref(), DEFAULT_CRD_POLICY)?;

        let namespace = release.target_namespace().to_string();
        let release_name = release.metadata.name.clone();
        let chart_path_str = chart_path.to_string_lossy().to_string();
        let values_path_str = values_path.to_string_lossy().to_string();
        let timeout_str = format!("{timeout_secs}s");

        let mut args: Vec<&str> = vec![
            "template",
            &release_name,
            &chart_path_str,
            "--namespace",
            &namespace,
            "--kube-version",
            &self.opts.kube_version,
            "--values",
            &values_path_str,
            "--timeout",
            &timeout_str,
        ];

        if policy == "Skip" {
            // omit --include-crds
        } else {
            args.push("--include-crds");
        }

        // `helm template` renders hook manifests alongside the main templates
        // unless `--no-hooks` is passed. A release that opts out of hooks
        // entirely always suppresses them; otherwise hooks are suppressed by
        // default and only kept when `--include-helm-hooks` is set (§4.7
        // step 7, §6).
        if release.spec.disable_hooks || !self.opts.include_helm_hooks {
            args.push("--no-hooks");
        }

        let mut api_version_args = Vec::new();
        for version in &self.opts.api_versions {
            api_version_args.push("--api-versions".to_string());
            api_version_args.push(version.clone());
        }
        let api_version_refs: Vec<&str> = api_version_args.iter().map(|s| s.as_str()).collect();
        args.extend(api_version_refs);

        let mut cmd = ExternalCommand::new(&self.opts.helm_binary, &args, &[]);
        let is_canceled = || ctx.is_cancelled();
        let killer = CommandKiller::from(Duration::from_secs(timeout_secs as u64 + 30), &is_canceled);

        let mut stdout = String::new();
        let mut stderr = String::new();
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
        .map_err(|source| HelmBuildError::Render(format!("helm template failed: {source} ({stderr})")))?;

        Ok(stdout)
    }

    /// Writes the declared `patches`/`images` from the release's user
    /// Kustomize post-renderers into `staging_dir/kustomization.yaml`,
    /// referencing the `resource_N.yaml` files `write_staged_resources`
    /// already wrote there. A no-op when the release declares none: the
    /// overlay engine then synthesizes its own `kustomization.yaml` from the
    /// bare `resource_N.yaml` files.
    fn apply_user_kustomize(&self, release: &HelmRelease, staging_dir: &Path, resource_count: usize) -> Result<(), HelmBuildError> {
        let has_user_renderers = release.spec.post_renderers.iter().any(|pr| pr.kustomize.is_some());
        if !has_user_renderers {
            return Ok(());
        }

        let mut patches = Vec::new();
        let mut images = Vec::new();
        for pr in &release.spec.post_renderers {
            if let Some(kustomize) = &pr.kustomize {
                patches.extend(kustomize.patches.clone());
                images.extend(kustomize.images.clone());
            }
        }

        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(
            serde_yaml::Value::String("resources".to_string()),
            serde_yaml::Value::Sequence((0..resource_count).map(|i| serde_yaml::Value::String(format!("resource_{i}.yaml"))).collect()),
        );
        if !patches.is_empty() {
            mapping.insert(serde_yaml::Value::String("patches".to_string()), serde_yaml::Value::Sequence(patches));
        }
        if !images.is_empty() {
            mapping.insert(serde_yaml::Value::String("images".to_string()), serde_yaml::Value::Sequence(images));
        }

        let doc = serde_yaml::to_string(&mapping)?;
        std::fs::write(staging_dir.join("kustomization.yaml"), doc)?;
        Ok(())
    }
}

fn repo_namespace(repo: &HelmRepository) -> String {
    if repo.metadata.namespace.is_empty() {
        "default".to_string()
    } else {
        repo.metadata.namespace.clone()
    }
}

/// Writes one `resource_N.yaml` file per resource into `dir`, in order, so a
/// `kustomization.yaml` written alongside them (user-declared or
/// synthesized) can reference them by a stable name.
fn write_staged_resources(resources: &[Resource], dir: &Path) -> Result<(), HelmBuildError> {
    for (i, resource) in resources.iter().enumerate() {
        std::fs::write(dir.join(format!("resource_{i}.yaml")), resource.to_yaml_string()?)?;
    }
    Ok(())
}

fn write_resources(resources: &[Resource]) -> Result<String, HelmBuildError> {
    let mut out = String::new();
    for resource in resources {
        out.push_str("---\n");
        out.push_str(&resource.to_yaml_string()?);
    }
    Ok(out)
}

/// Shell-style `${VAR}` / `${VAR:-default}` substitution over a YAML
/// document's text form.
pub fn envsubst(input: &str) -> Result<String, HelmBuildError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("static regex is valid");
    let mut error = None;

    let result = re
        .replace_all(input, |caps: &regex::Captures| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) => value,
                Err(_) => match caps.get(3) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        error = Some(HelmBuildError::Render(format!("environment variable `{var}` is not set and has no default")));
                        String::new()
                    }
                },
            }
        })
        .to_string();

    match error {
        Some(err) => Err(err),
        None => Ok(result),
    }
}

/// Parses a duration string (`"300s"`, `"5m"`, bare seconds) into whole
/// seconds, falling back to the default on anything unparseable.
fn parse_duration_secs(raw: &str) -> u32 {
    let trimmed = raw.trim();
    if let Some(secs) = trimmed.strip_suffix('s') {
        if let Ok(n) = secs.parse::<u32>() {
            return n;
        }
    }
    if let Some(mins) = trimmed.strip_suffix('m') {
        if let Ok(n) = mins.parse::<u32>() {
            return n * 60;
        }
    }
    if let Some(hours) = trimmed.strip_suffix('h') {
        if let Ok(n) = hours.parse::<u32>() {
            return n * 3600;
        }
    }
    trimmed.parse::<u32>().unwrap_or(DEFAULT_HELM_TIMEOUT_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envsubst_uses_default_when_var_unset() {
        std::env::remove_var("FLUX_BUILD_TEST_UNSET_VAR");
        let result = envsubst("value: ${FLUX_BUILD_TEST_UNSET_VAR:-fallback}").unwrap();
        assert_eq!(result, "value: fallback");
    }

    #[test]
    fn envsubst_uses_env_value_when_set() {
        std::env::set_var("FLUX_BUILD_TEST_VAR", "hello");
        let result = envsubst("value: ${FLUX_BUILD_TEST_VAR}").unwrap();
        assert_eq!(result, "value: hello");
        std::env::remove_var("FLUX_BUILD_TEST_VAR");
    }

    #[test]
    fn envsubst_errors_on_missing_var_without_default() {
        std::env::remove_var("FLUX_BUILD_TEST_MISSING_VAR");
        let result = envsubst("value: ${FLUX_BUILD_TEST_MISSING_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn parse_duration_accepts_seconds_minutes_hours() {
        assert_eq!(parse_duration_secs("30s"), 30);
        assert_eq!(parse_duration_secs("5m"), 300);
        assert_eq!(parse_duration_secs("1h"), 3600);
        assert_eq!(parse_duration_secs("bogus"), DEFAULT_HELM_TIMEOUT_SECONDS);
    }
}
