//! Engine artifact provisioning for the daemon backend.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use url::Url;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::redacted_url_for_display;
use crate::runtime::Probe;

const DOWNLOAD_CHUNK_SIZE: usize = 8192;
const PARTIAL_SUFFIX: &str = "part";

/// `realesrgan-x4plus-sm89-trt10.3.engine`; unknown probes keep the `unknown` tag.
pub fn artifact_name(model: &str, version: &Probe, arch: &Probe) -> String {
    format!("{model}-{}-trt{}.engine", arch.tag(), version.tag())
}

/// A remote artifact store mirrored into a local cache directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_url: String,
    cache_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    /// Returns the cached artifact, downloading it first when absent. An
    /// existing file is trusted as-is.
    pub fn resolve(&self, name: &str) -> WorkerResult<PathBuf> {
        let final_path = self.local_path(name);
        if final_path.is_file() {
            info!(path = %final_path.display(), "engine artifact already cached");
            return Ok(final_path);
        }

        let url = self.artifact_url(name)?;
        info!(url = %redacted_url_for_display(&url), "downloading engine artifact");
        download_to(&url, &final_path)?;
        info!(path = %final_path.display(), "engine artifact downloaded");
        Ok(final_path)
    }

    fn artifact_url(&self, name: &str) -> WorkerResult<Url> {
        let joined = format!("{}/{name}", self.base_url.trim_end_matches('/'));
        Url::parse(&joined).map_err(|err| {
            WorkerError::Provision(format!("invalid artifact URL '{joined}': {err}"))
        })
    }
}

fn download_to(url: &Url, final_path: &Path) -> WorkerResult<()> {
    let redacted = redacted_url_for_display(url);
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .map_err(|err| provision_error("failed to build HTTP client", err))?;

    let mut response = client
        .get(url.as_str())
        .send()
        .map_err(|err| provision_error(&format!("failed to start download from {redacted}"), err))?;

    let status = response.status();
    if !status.is_success() {
        return Err(WorkerError::Provision(format!(
            "artifact request returned HTTP {} for {redacted}",
            status.as_u16()
        )));
    }

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            provision_error(&format!("failed to create artifact cache dir {}", parent.display()), err)
        })?;
    }

    let tmp_path = partial_path(final_path);
    let mut tmp_file = fs::File::create(&tmp_path).map_err(|err| {
        provision_error(&format!("failed to create temp file {}", tmp_path.display()), err)
    })?;
    let mut tmp_guard = PartialFileGuard::new(&tmp_path);

    let mut buffer = [0u8; DOWNLOAD_CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let read = response.read(&mut buffer).map_err(|err| {
            provision_error(&format!("failed while reading artifact body from {redacted}"), err)
        })?;
        if read == 0 {
            break;
        }
        tmp_file.write_all(&buffer[..read]).map_err(|err| {
            provision_error(&format!("failed to write {}", tmp_path.display()), err)
        })?;
        written += read as u64;
    }

    tmp_file
        .sync_all()
        .map_err(|err| provision_error(&format!("failed to fsync {}", tmp_path.display()), err))?;
    drop(tmp_file);

    fs::rename(&tmp_path, final_path).map_err(|err| {
        provision_error(
            &format!(
                "failed to move {} -> {}",
                tmp_path.display(),
                final_path.display()
            ),
            err,
        )
    })?;
    tmp_guard.disarm();

    debug!(bytes = written, path = %final_path.display(), "artifact written");
    Ok(())
}

fn provision_error(context: &str, err: impl std::fmt::Display) -> WorkerError {
    WorkerError::Provision(format!("{context}: {err}"))
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{PARTIAL_SUFFIX}"));
    final_path.with_file_name(name)
}

/// Removes a half-written download unless disarmed after the final rename.
struct PartialFileGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> PartialFileGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFileGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(self.path);
        }
    }
}
