use std::sync::Arc;

use tracing::info;

use crate::artifact::{artifact_name, ArtifactStore};
use crate::codec::ImageFetcher;
use crate::config::{BackendKind, WorkerConfig};
use crate::dispatch::{HttpDaemonClient, ProcessRunner};
use crate::error::WorkerResult;
use crate::orchestrator::{CliOrchestrator, DaemonOrchestrator, JobHandler};
use crate::readiness::start_backend;
use crate::runtime;

/// Builds the job handler for the configured backend.
///
/// For the daemon backend this blocks through host probing, artifact
/// provisioning and the readiness gate; a returned error means the worker
/// must not serve requests.
pub fn build_handler(config: &WorkerConfig) -> WorkerResult<Arc<dyn JobHandler>> {
    let fetcher = ImageFetcher::new(config.fetch.timeout())?;

    match config.backend {
        BackendKind::Daemon => {
            let daemon = &config.daemon;
            info!("initializing daemon upscaling worker");

            let version = runtime::detect_runtime_version();
            let arch = runtime::detect_accelerator();
            runtime::log_host_probes(&version, &arch);

            let name = artifact_name(&daemon.model_name, &version, &arch);
            let store = ArtifactStore::new(&daemon.artifact_base_url, &daemon.artifact_cache_dir);
            let artifact = store.resolve(&name)?;

            let backend = start_backend(daemon, &artifact)?;
            let client = HttpDaemonClient::connect(backend, daemon.dispatch_timeout())?;
            info!("daemon backend is warmed up and ready");

            Ok(Arc::new(DaemonOrchestrator::new(fetcher, client, daemon)))
        }
        BackendKind::Cli => {
            info!(
                primary = %config.cli.primary_path.display(),
                override_env = %config.cli.binary_env_var,
                "initializing CLI upscaling worker"
            );
            Ok(Arc::new(CliOrchestrator::new(
                fetcher,
                ProcessRunner,
                config.cli.clone(),
            )))
        }
    }
}
