//! Request orchestration in front of an out-of-process Real-ESRGAN backend.
//!
//! Two backends are supported: a long-lived local daemon reached over HTTP
//! (provisioned and health-gated once at startup), and a command-line tool
//! invoked once per request on scratch files.

pub mod artifact;
pub mod bootstrap;
pub mod cleanup;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod readiness;
pub mod runtime;
pub mod server;
