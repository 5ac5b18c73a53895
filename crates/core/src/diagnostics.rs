//! Environment snapshot attached to CLI backend failures.
//!
//! A non-zero exit from the upscaler binary is almost always a host problem
//! (missing shared libraries, no Vulkan ICD, GPU not exposed to the container)
//! rather than bad input, so the failure envelope carries enough context to
//! tell those apart without shelling into the worker.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::info;

pub const ICD_DIRS: [&str; 2] = ["/usr/share/vulkan/icd.d/", "/etc/vulkan/icd.d/"];
pub const AUDITED_ENV_VARS: [&str; 3] = [
    "LD_LIBRARY_PATH",
    "NVIDIA_DRIVER_CAPABILITIES",
    "NVIDIA_VISIBLE_DEVICES",
];

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DiagnosticBundle {
    /// `ldd` output for the binary, or the reason it could not be run.
    pub linkage: String,
    pub models_dir: PathBuf,
    pub models_dir_exists: bool,
    pub binary_dir: DirectoryListing,
    pub icd_dirs: Vec<DirectoryListing>,
    /// Unset variables map to `None`.
    pub environment: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DirectoryListing {
    pub path: PathBuf,
    pub exists: bool,
    pub entries: Vec<String>,
}

impl DirectoryListing {
    pub fn read(path: &Path) -> Self {
        let entries = fs::read_dir(path).ok().map(|dir| {
            let mut names: Vec<String> = dir
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        });

        Self {
            path: path.to_path_buf(),
            exists: entries.is_some(),
            entries: entries.unwrap_or_default(),
        }
    }
}

/// Collects the standard bundle for `binary`.
pub fn collect(binary: &Path) -> DiagnosticBundle {
    let icd_dirs: Vec<PathBuf> = ICD_DIRS.iter().map(PathBuf::from).collect();
    collect_with(binary, &icd_dirs, &AUDITED_ENV_VARS)
}

pub fn collect_with(binary: &Path, icd_dirs: &[PathBuf], env_vars: &[&str]) -> DiagnosticBundle {
    let binary_dir = binary_directory(binary);
    let models_dir = binary_dir.join("models");

    let bundle = DiagnosticBundle {
        linkage: shared_library_report(binary),
        models_dir_exists: models_dir.exists(),
        models_dir,
        binary_dir: DirectoryListing::read(&binary_dir),
        icd_dirs: icd_dirs.iter().map(|dir| DirectoryListing::read(dir)).collect(),
        environment: env_vars
            .iter()
            .map(|name| ((*name).to_string(), env::var(name).ok()))
            .collect(),
    };

    log_bundle(&bundle);
    bundle
}

fn binary_directory(binary: &Path) -> PathBuf {
    let absolute = if binary.is_absolute() {
        binary.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(binary))
            .unwrap_or_else(|_| binary.to_path_buf())
    };
    absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn shared_library_report(binary: &Path) -> String {
    match Command::new("ldd").arg(binary).output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                stdout.into_owned()
            } else {
                format!("{stdout}{stderr}")
            }
        }
        Err(err) => format!("failed to run ldd: {err}"),
    }
}

fn log_bundle(bundle: &DiagnosticBundle) {
    info!(target: "diagnostics", output = %bundle.linkage, "ldd output");
    info!(
        target: "diagnostics",
        path = %bundle.models_dir.display(),
        exists = bundle.models_dir_exists,
        "models directory"
    );
    info!(
        target: "diagnostics",
        path = %bundle.binary_dir.path.display(),
        entries = ?bundle.binary_dir.entries,
        "binary directory contents"
    );
    for icd in &bundle.icd_dirs {
        if icd.exists {
            info!(target: "diagnostics", path = %icd.path.display(), entries = ?icd.entries, "ICD directory contents");
        } else {
            info!(target: "diagnostics", path = %icd.path.display(), "ICD directory does not exist");
        }
    }
    for (name, value) in &bundle.environment {
        info!(target: "diagnostics", variable = %name, value = ?value, "environment");
    }
}
