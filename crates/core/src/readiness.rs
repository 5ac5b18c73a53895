//! Startup of the daemon backend and the readiness gate in front of it.
//!
//! The gate runs once per worker lifetime. [`ReadyBackend`] can only be
//! obtained from a gate that reached [`GateState::Ready`], so holding one is
//! proof that the backend answered its liveness endpoint.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::{WorkerError, WorkerResult};

const HEALTH_PATH: &str = "/health";

pub trait LivenessProbe {
    /// One attempt; `true` only for a success status. Transport errors count
    /// as a failed attempt.
    fn probe(&self) -> bool;
}

pub struct HttpLivenessProbe {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpLivenessProbe {
    pub fn new(base_url: &str, timeout: Duration) -> WorkerResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                WorkerError::Readiness(format!("failed to build liveness HTTP client: {err}"))
            })?;
        Ok(Self {
            client,
            url: format!("{}{HEALTH_PATH}", base_url.trim_end_matches('/')),
        })
    }
}

impl LivenessProbe for HttpLivenessProbe {
    fn probe(&self) -> bool {
        match self.client.get(&self.url).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(url = %self.url, error = %err, "liveness probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Starting,
    Polling { attempt: u32 },
    Ready { attempts: u32 },
    Failed { attempts: u32 },
}

pub struct ReadinessGate<P> {
    probe: P,
    max_attempts: u32,
    interval: Duration,
    state: GateState,
}

impl<P: LivenessProbe> ReadinessGate<P> {
    pub fn new(probe: P, max_attempts: u32, interval: Duration) -> Self {
        Self {
            probe,
            max_attempts,
            interval,
            state: GateState::Starting,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Polls until the first healthy answer or until the attempts run out.
    /// A finished gate is not polled again.
    pub fn run(&mut self) -> GateState {
        if matches!(self.state, GateState::Ready { .. } | GateState::Failed { .. }) {
            return self.state;
        }

        for attempt in 1..=self.max_attempts {
            self.state = GateState::Polling { attempt };
            if self.probe.probe() {
                self.state = GateState::Ready { attempts: attempt };
                return self.state;
            }
            debug!(attempt, max_attempts = self.max_attempts, "backend not ready yet");
            if attempt < self.max_attempts {
                thread::sleep(self.interval);
            }
        }

        self.state = GateState::Failed {
            attempts: self.max_attempts,
        };
        self.state
    }

    /// Runs the gate and, on success, hands out the ready backend.
    pub fn open(
        mut self,
        base_url: impl Into<String>,
        process: Option<BackendProcess>,
    ) -> WorkerResult<ReadyBackend> {
        match self.run() {
            GateState::Ready { attempts } => {
                let base_url = base_url.into();
                info!(%base_url, attempts, "backend is ready");
                Ok(ReadyBackend {
                    base_url,
                    _process: process,
                })
            }
            state => Err(WorkerError::Readiness(format!(
                "backend did not become healthy after {} attempts ({state:?})",
                self.max_attempts
            ))),
        }
    }
}

/// The daemon child process. Killed when dropped.
#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    program: PathBuf,
}

impl BackendProcess {
    pub fn launch(program: &Path, args: &[String]) -> WorkerResult<Self> {
        info!(program = %program.display(), ?args, "starting backend process");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                WorkerError::Readiness(format!(
                    "failed to start backend {}: {err}",
                    program.display()
                ))
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, OutputStream::Stderr);
        }

        Ok(Self {
            child,
            program: program.to_path_buf(),
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            warn!(program = %self.program.display(), %status, "backend process had already exited");
            return;
        }
        if let Err(err) = self.child.kill() {
            warn!(program = %self.program.display(), error = %err, "failed to stop backend process");
        }
        let _ = self.child.wait();
    }
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

fn forward_lines<R: Read + Send + 'static>(reader: R, stream: OutputStream) {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else { break };
            match stream {
                OutputStream::Stdout => info!(target: "backend_stdout", "{line}"),
                OutputStream::Stderr => info!(target: "backend_stderr", "{line}"),
            }
        }
    });
}

/// A backend that passed the readiness gate. Holds the supervised process
/// for as long as the worker lives.
#[derive(Debug)]
pub struct ReadyBackend {
    base_url: String,
    _process: Option<BackendProcess>,
}

impl ReadyBackend {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

pub fn daemon_args(config: &DaemonConfig, artifact: &Path) -> Vec<String> {
    vec![
        "server".to_string(),
        "start".to_string(),
        "-p".to_string(),
        config.port.to_string(),
        "--engine".to_string(),
        artifact.display().to_string(),
        "--gpu-id".to_string(),
        config.gpu_id.to_string(),
    ]
}

/// Launches the daemon with the provisioned artifact and blocks until it is
/// ready or the gate gives up.
pub fn start_backend(config: &DaemonConfig, artifact: &Path) -> WorkerResult<ReadyBackend> {
    let process = BackendProcess::launch(&config.binary_path, &daemon_args(config, artifact))?;
    debug!(pid = process.id(), "backend process spawned");

    let base_url = config.base_url();
    let probe = HttpLivenessProbe::new(&base_url, config.readiness_probe_timeout())?;
    ReadinessGate::new(
        probe,
        config.readiness_attempts,
        config.readiness_interval(),
    )
    .open(base_url, Some(process))
}
