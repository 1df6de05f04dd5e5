use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cache;
use crate::cli::ResolvedConfig;
use crate::errors::BuildError;
use crate::helmbuild::{HelmBuildOpts, HelmBuilder};
use crate::index::ResourceIndex;
use crate::model::{Resource, HELM_RELEASE_KIND};
use crate::output::OutputWriter;
use crate::overlay::OverlayBuilder;
use crate::worker::WorkerPool;

const HELM_BINARY: &str = "helm";
const KUSTOMIZE_BINARY: &str = "kustomize";

/// Runs the four-stage pipeline (overlay fan-out, serial index, helm
/// fan-out, serial output) for one invocation of the engine, and returns
/// once every document has been written and every pool torn down.
pub fn run(config: &ResolvedConfig) -> Result<(), BuildError> {
    let output = Arc::new(OutputWriter::open(&config.output)?);
    let documents_emitted = Arc::new(AtomicUsize::new(0));

    let overlay_pool = WorkerPool::new(config.paths.len().max(1), config.fail_fast);
    let ctx = overlay_pool.cancellation();
    let index_pool = Arc::new(WorkerPool::with_context(1, config.fail_fast, ctx.clone()));
    let output_pool = Arc::new(WorkerPool::with_context(1, config.fail_fast, ctx.clone()));

    let overlay_builder = Arc::new(OverlayBuilder::new(KUSTOMIZE_BINARY));
    let index = Arc::new(Mutex::new(ResourceIndex::new()));

    debug!(paths = config.paths.len(), "starting overlay stage");

    for path in config.paths.iter().cloned() {
        let overlay_builder = overlay_builder.clone();
        let index = index.clone();
        let index_pool = index_pool.clone();
        let output = output.clone();
        let output_pool = output_pool.clone();
        let documents_emitted = documents_emitted.clone();

        overlay_pool.push(Box::new(move |ctx| {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let (resources, yaml) = overlay_builder.build(&path, ctx).map_err(BuildError::Overlay)?;

            index_pool.push(Box::new(move |_ctx| {
                index.lock().expect("index mutex poisoned").push(resources).map_err(BuildError::Index)
            }));

            output_pool.push(Box::new(move |_ctx| {
                output.write_block(&yaml).map_err(BuildError::Output)?;
                documents_emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));

            Ok(())
        }));
    }

    let overlay_err = overlay_pool.wait();

    // Every overlay task has finished (and, with it, every `index_pool` /
    // `output_pool` clone it held) — draining `index_pool` now is safe and
    // establishes the happens-before edge required before any helm worker
    // may read the index.
    let index_pool = unwrap_pool(index_pool);
    let index_err = index_pool.wait();

    let index = Arc::try_unwrap(index)
        .unwrap_or_else(|_| panic!("reference index still shared after index stage drained"))
        .into_inner()
        .expect("index mutex poisoned");

    debug!(resources = index.len(), "index stage complete, starting helm stage");

    let releases: Vec<Resource> = index.values().filter(|r| r.kind == HELM_RELEASE_KIND).cloned().collect();
    // Read-only from here on: no lock needed for stage-3 lookups.
    let index = Arc::new(index);

    let cache = Arc::<dyn cache::ChartCache>::from(cache::new_cache(config.cache_type, &config.cache_dir).map_err(BuildError::Cache)?);
    let helm_opts = HelmBuildOpts {
        helm_binary: HELM_BINARY.to_string(),
        kustomize_binary: KUSTOMIZE_BINARY.to_string(),
        kube_version: config.kube_version.clone(),
        api_versions: config.api_versions.clone(),
        include_helm_hooks: config.include_helm_hooks,
    };
    let builder = Arc::new(HelmBuilder::new(helm_opts, cache));

    let helm_pool = WorkerPool::with_context(config.workers, config.fail_fast, ctx.clone());

    for release_resource in releases {
        let builder = builder.clone();
        let index = index.clone();
        let output = output.clone();
        let output_pool = output_pool.clone();
        let documents_emitted = documents_emitted.clone();

        helm_pool.push(Box::new(move |ctx| {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let (_resources, yaml) = builder.build(&release_resource, &index, ctx).map_err(BuildError::HelmBuild)?;

            output_pool.push(Box::new(move |_ctx| {
                output.write_block(&yaml).map_err(BuildError::Output)?;
                documents_emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));

            Ok(())
        }));
    }

    let helm_err = helm_pool.wait();
    let (cache_hits, cache_fetches) = builder.cache_stats();

    let output_pool = unwrap_pool(output_pool);
    let output_err = output_pool.wait();
    output.flush().map_err(BuildError::Output)?;

    let mut errors: Vec<BuildError> = [overlay_err, index_err, helm_err, output_err].into_iter().flatten().collect();

    if errors.is_empty() {
        info!(
            documents = documents_emitted.load(Ordering::Relaxed),
            cache_hits, cache_fetches, "build complete"
        );
        Ok(())
    } else if errors.len() == 1 {
        Err(errors.pop().expect("checked len == 1"))
    } else {
        let most_recent = errors.pop().expect("checked non-empty");
        Err(BuildError::Pool(errors.len() + 1, Box::new(most_recent)))
    }
}

/// Every task that could hold a clone of this pool has already completed by
/// the time this is called; the only remaining strong reference is the
/// caller's own, so the unwrap always succeeds.
fn unwrap_pool(pool: Arc<WorkerPool>) -> WorkerPool {
    Arc::try_unwrap(pool).unwrap_or_else(|_| panic!("pool still referenced by an in-flight task"))
}
