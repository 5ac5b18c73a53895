//! Hands one image to the backend and brings back what it produced.

pub mod cli;
pub mod daemon;

pub use cli::{CliOptions, CliOutput, CliRunner, ProcessRunner};
pub use daemon::{DaemonDispatch, DaemonOutput, HttpDaemonClient};
