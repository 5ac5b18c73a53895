use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::Command;

use tracing::{error, info};

use crate::config::CliConfig;
use crate::diagnostics;
use crate::error::{DispatchFailure, WorkerError, WorkerResult};
use crate::job::{JobInput, OutputFormat};

/// Validated invocation options for one CLI run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub model: String,
    pub scale: u32,
    pub format: OutputFormat,
    pub tta: bool,
    pub tile_size: Option<u32>,
    pub threads: Option<String>,
    pub gpu_id: Option<u32>,
}

impl CliOptions {
    pub fn from_input(input: &JobInput, config: &CliConfig) -> WorkerResult<Self> {
        let model = input
            .model_name
            .as_deref()
            .map(str::trim)
            .unwrap_or(config.default_model.as_str());
        if model.is_empty() {
            return Err(WorkerError::input("model_name must not be empty"));
        }

        let scale = input.scale.unwrap_or(config.default_scale);
        if scale == 0 {
            return Err(WorkerError::input("scale must be a positive integer"));
        }
        if input.tile_size == Some(0) {
            return Err(WorkerError::input("tile_size must be a positive integer"));
        }

        let threads = input
            .threads
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(threads) = threads {
            validate_threads(threads)?;
        }

        Ok(Self {
            model: model.to_string(),
            scale,
            format: input.output_format.unwrap_or(config.default_output_format),
            tta: input.tta,
            tile_size: input.tile_size,
            threads: threads.map(str::to_string),
            gpu_id: input.gpu_id,
        })
    }

    /// Optional flags are only emitted when set.
    pub fn to_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-o".into(),
            output.into(),
            "-n".into(),
            self.model.clone().into(),
            "-s".into(),
            self.scale.to_string().into(),
            "-f".into(),
            self.format.extension().into(),
        ];

        if self.tta {
            args.push("-x".into());
        }
        if let Some(tile_size) = self.tile_size {
            args.push("-t".into());
            args.push(tile_size.to_string().into());
        }
        if let Some(threads) = &self.threads {
            args.push("-j".into());
            args.push(threads.clone().into());
        }
        if let Some(gpu_id) = self.gpu_id {
            args.push("-g".into());
            args.push(gpu_id.to_string().into());
        }
        args
    }
}

/// `load:proc:save`, where each part is a count or a comma list of counts
/// (one per GPU).
fn validate_threads(threads: &str) -> WorkerResult<()> {
    let parts: Vec<&str> = threads.split(':').collect();
    let valid = parts.len() == 3
        && parts.iter().all(|part| {
            !part.is_empty()
                && part
                    .split(',')
                    .all(|count| !count.is_empty() && count.chars().all(|ch| ch.is_ascii_digit()))
        });

    if valid {
        Ok(())
    } else {
        Err(WorkerError::input(format!(
            "threads must look like load:proc:save (e.g. 2:2:2), got '{threads}'"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutput {
    pub success: bool,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait CliRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<CliOutput>;
}

/// Runs the binary to completion and captures its output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CliRunner for ProcessRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<CliOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CliOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub fn dispatch<R: CliRunner + ?Sized>(
    runner: &R,
    program: &Path,
    input: &Path,
    output: &Path,
    options: &CliOptions,
) -> Result<CliOutput, DispatchFailure> {
    let args = options.to_args(input, output);
    info!(
        program = %program.display(),
        args = %render_args(&args),
        "executing upscaler command"
    );

    match runner.run(program, &args) {
        Ok(result) if result.success => Ok(result),
        Ok(result) => {
            let code = result
                .exit_code
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            error!(return_code = %code, stderr = %result.stderr, "upscaler binary failed");
            Err(DispatchFailure::Cli {
                message: format!("Real-ESRGAN failed with return code {code}"),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                diagnostics: Box::new(diagnostics::collect(program)),
            })
        }
        Err(err) => {
            error!(program = %program.display(), error = %err, "upscaler binary could not be started");
            Err(DispatchFailure::Cli {
                message: format!("failed to start upscaler {}: {err}", program.display()),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                diagnostics: Box::new(diagnostics::collect(program)),
            })
        }
    }
}

fn render_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
