//! Per-request entry points. Every job resolves to exactly one envelope:
//! errors and panics alike are turned into a failure envelope here and never
//! reach the job runtime.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info};

use crate::cleanup::TempArtifacts;
use crate::codec::{self, ImageFetcher};
use crate::config::{CliConfig, DaemonConfig};
use crate::dispatch::cli::{self, CliOptions, CliRunner};
use crate::dispatch::DaemonDispatch;
use crate::error::{WorkerError, WorkerResult};
use crate::job::{FailureEnvelope, JobInput, JobRecord, OutputFormat, ResponseEnvelope, SuccessEnvelope};
use crate::logging::panic_payload_to_string;
use crate::runtime;

pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &JobRecord) -> ResponseEnvelope;
}

/// Runs `work` and folds every outcome, including a panic, into one envelope.
pub fn run_guarded<F>(job: &JobRecord, work: F) -> ResponseEnvelope
where
    F: FnOnce() -> WorkerResult<SuccessEnvelope>,
{
    let job_id = job.display_id();
    let outcome = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
        Err(WorkerError::unexpected(format!(
            "unexpected error: {}",
            panic_payload_to_string(payload.as_ref())
        )))
    });

    match outcome {
        Ok(success) => {
            info!(job_id, output_format = %success.output_format, "upscaling completed successfully");
            ResponseEnvelope::Success(success)
        }
        Err(err) => {
            error!(job_id, error_type = err.kind(), error = %err, "job failed");
            ResponseEnvelope::Failure(FailureEnvelope::from(&err))
        }
    }
}

/// Request flow in front of the long-lived daemon.
pub struct DaemonOrchestrator<D> {
    fetcher: ImageFetcher,
    dispatch: D,
    model: String,
    scale_factor: u32,
    max_input_dimension: u32,
    default_format: OutputFormat,
}

impl<D: DaemonDispatch> DaemonOrchestrator<D> {
    pub fn new(fetcher: ImageFetcher, dispatch: D, config: &DaemonConfig) -> Self {
        Self {
            fetcher,
            dispatch,
            model: config.model_name.clone(),
            scale_factor: config.scale_factor,
            max_input_dimension: config.max_input_dimension,
            default_format: config.default_output_format,
        }
    }

    fn process(&self, job: &JobRecord) -> WorkerResult<SuccessEnvelope> {
        let input = JobInput::parse(&job.input)?;
        let requested = input.output_format.unwrap_or(self.default_format);
        if requested == OutputFormat::Webp {
            return Err(WorkerError::input(
                "output_format 'webp' is not supported by this backend; use 'png' or 'jpg'",
            ));
        }
        let source = input.image_source()?;

        let bytes = self.fetcher.fetch(&source)?;
        let input_dims = codec::decode_dimensions(&bytes)?;
        let limit = self.max_input_dimension;
        if input_dims.exceeds(limit) {
            return Err(WorkerError::Policy(format!(
                "Image dimensions ({input_dims}) exceed the maximum allowed size of {limit}x{limit}."
            )));
        }

        debug!(job_id = job.display_id(), %input_dims, format = %requested, "upscaling via daemon");
        let output = self.dispatch.upscale(&bytes, requested)?;

        Ok(SuccessEnvelope::with_resolutions(
            codec::encode_to_inline(&output.bytes),
            self.model.clone(),
            input_dims,
            input_dims.scaled(self.scale_factor),
            output.format,
        ))
    }
}

impl<D: DaemonDispatch> JobHandler for DaemonOrchestrator<D> {
    fn handle(&self, job: &JobRecord) -> ResponseEnvelope {
        info!(job_id = job.display_id(), model = %self.model, "starting job");
        run_guarded(job, || self.process(job))
    }
}

/// Request flow for one CLI invocation per job on scratch files.
pub struct CliOrchestrator<R> {
    fetcher: ImageFetcher,
    runner: R,
    config: CliConfig,
}

impl<R: CliRunner> CliOrchestrator<R> {
    pub fn new(fetcher: ImageFetcher, runner: R, config: CliConfig) -> Self {
        Self {
            fetcher,
            runner,
            config,
        }
    }

    fn process(&self, job: &JobRecord) -> WorkerResult<SuccessEnvelope> {
        let input = JobInput::parse(&job.input)?;
        let options = CliOptions::from_input(&input, &self.config)?;
        let source = input.image_source()?;
        info!(
            job_id = job.display_id(),
            model = %options.model,
            scale = options.scale,
            "starting job"
        );

        // Dropped on every exit from this function, removing both files.
        let mut artifacts = TempArtifacts::new(self.config.resolved_temp_dir());

        let bytes = self.fetcher.fetch(&source)?;
        let extension = codec::input_extension(&source, &bytes)?;
        if let Some(limit) = self.config.max_input_dimension {
            let dims = codec::decode_dimensions(&bytes)?;
            if dims.exceeds(limit) {
                return Err(WorkerError::Policy(format!(
                    "Image dimensions ({dims}) exceed the maximum allowed size of {limit}x{limit}."
                )));
            }
        }

        let input_path = artifacts.reserve(extension);
        codec::materialize_to_storage(&bytes, &input_path)?;
        let output_path = artifacts.reserve(options.format.extension());

        let executable = runtime::resolve_executable(
            &self.config.binary_env_var,
            &self.config.primary_path,
            &self.config.fallback_path,
        );
        cli::dispatch(&self.runner, &executable.path, &input_path, &output_path, &options)?;

        info!(job_id = job.display_id(), "process completed successfully, encoding output");
        let encoded = codec::encode_file_to_inline(&output_path)?;

        debug!(job_id = job.display_id(), files = artifacts.paths().len(), "entering cleanup phase");
        Ok(SuccessEnvelope::with_scale(
            encoded,
            options.model,
            options.scale,
            options.format,
        ))
    }
}

impl<R: CliRunner> JobHandler for CliOrchestrator<R> {
    fn handle(&self, job: &JobRecord) -> ResponseEnvelope {
        run_guarded(job, || self.process(job))
    }
}
