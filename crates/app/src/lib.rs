use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use esrgan_worker_core::bootstrap::build_handler;
use esrgan_worker_core::config::{config_path, data_dir, initialize_data_dir, BackendKind, WorkerConfig};
use esrgan_worker_core::job::JobRecord;
use esrgan_worker_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use esrgan_worker_core::orchestrator::JobHandler;
use esrgan_worker_core::server::{job_router, JobApiState};

#[derive(Parser)]
#[command(
    name = "esrgan-worker",
    about = "Real-ESRGAN image upscaling job worker"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum, global = true, help = "Override the configured backend")]
    backend: Option<BackendArg>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise the backend and serve the job API (default).
    Serve(ServeArgs),
    /// Process one job record and print its result as JSON.
    RunJob(RunJobArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Args)]
struct RunJobArgs {
    #[arg(help = "Path to a job record JSON file, or '-' for stdin")]
    job: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Daemon,
    Cli,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Daemon => BackendKind::Daemon,
            BackendArg::Cli => BackendKind::Cli,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    let mut config = load_config(&resolved_data_dir);
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }
    log_startup_metadata(&config, &resolved_data_dir);

    match cli.command {
        Some(Commands::RunJob(args)) => run_job(config, &args.job).await,
        Some(Commands::Serve(args)) => run_server(config, args).await,
        None => run_server(config, ServeArgs::default()).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> WorkerConfig {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "failed to initialize data directory");
    }
    match WorkerConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to load config file, using defaults");
            WorkerConfig::default()
        }
    }
}

fn log_startup_metadata(config: &WorkerConfig, data_dir: &Path) {
    info!(
        pid = std::process::id(),
        backend = %config.backend,
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "runtime startup metadata"
    );
}

/// Provisioning and the readiness gate block, so they run off the async
/// executor. An error here is fatal for the worker.
async fn initialize_handler(config: WorkerConfig) -> Result<Arc<dyn JobHandler>> {
    let handler = tokio::task::spawn_blocking(move || build_handler(&config))
        .await
        .context("worker initialization task failed")?
        .context("worker initialization failed")?;
    Ok(handler)
}

/// The daemon handler owns the backend child process and a blocking HTTP
/// client; both are torn down off the async executor.
async fn release_handler(handler: Arc<dyn JobHandler>) {
    let _ = tokio::task::spawn_blocking(move || drop(handler)).await;
}

fn listen_addr(
    config: &WorkerConfig,
    args: &ServeArgs,
    env_port: Option<String>,
) -> String {
    let port = args
        .port
        .or_else(|| env_port.and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = args
        .host
        .clone()
        .unwrap_or_else(|| config.server.host.clone());
    format!("{host}:{port}")
}

async fn run_server(config: WorkerConfig, args: ServeArgs) -> Result<()> {
    let addr = listen_addr(&config, &args, std::env::var("PORT").ok());
    let max_concurrent_jobs = config.server.max_concurrent_jobs;
    let max_body_bytes = config.server.max_body_bytes;

    let handler = initialize_handler(config).await?;
    let app = job_router(
        JobApiState::new(Arc::clone(&handler), max_concurrent_jobs)
            .with_max_body_bytes(max_body_bytes),
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, max_concurrent_jobs, "serving job API");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    release_handler(handler).await;
    served.context("job API server failed")?;
    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn read_job_record(source: &str) -> Result<JobRecord> {
    let raw = if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read job record from stdin")?;
        raw
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read job record: {source}"))?
    };
    parse_job_record(&raw)
}

fn parse_job_record(raw: &str) -> Result<JobRecord> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("job record is not valid JSON")?;
    if !value.is_object() {
        bail!("job record must be a JSON object");
    }
    Ok(JobRecord::from_value(value))
}

async fn run_job(config: WorkerConfig, source: &str) -> Result<()> {
    let job = read_job_record(source)?;
    let handler = initialize_handler(config).await?;

    let envelope = tokio::task::spawn_blocking(move || {
        let envelope = handler.handle(&job);
        drop(handler);
        envelope
    })
    .await
    .context("job task failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).context("failed to serialize job result")?
    );
    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["esrgan-worker"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from([
            "esrgan-worker",
            "run-job",
            "job.json",
            "-vv",
            "--backend",
            "cli",
            "--data-dir",
            "/tmp/worker",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.backend, Some(BackendArg::Cli));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/worker")));
        match cli.command {
            Some(Commands::RunJob(args)) => assert_eq!(args.job, "job.json"),
            _ => panic!("expected run-job"),
        }
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["esrgan-worker", "--backend", "tensorrt"]).is_err());
    }

    #[test]
    fn backend_arg_maps_onto_config_kind() {
        assert_eq!(BackendKind::from(BackendArg::Daemon), BackendKind::Daemon);
        assert_eq!(BackendKind::from(BackendArg::Cli), BackendKind::Cli);
    }
}



#[cfg(test)]
mod log_filter_tests {
    use super::*;

    #[test]
    fn composed_filters_parse_as_env_filters() {
        let options = LoggingInitOptions::default();
        let filters = logging::compose_logging_filters(&options);
        assert!(tracing_subscriber::EnvFilter::try_new(&filters.console_filter).is_ok());
        assert!(tracing_subscriber::EnvFilter::try_new(&filters.file_filter).is_ok());
    }
}
