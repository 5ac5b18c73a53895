use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{debug, info, warn};

const TRT_PACKAGE: &str = "libnvinfer-bin";
const UNKNOWN_TAG: &str = "unknown";

/// Outcome of a best-effort host probe. Probes never abort startup; a probe
/// that fails contributes the `unknown` tag to whatever is derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Detected(String),
    Unknown,
}

impl Probe {
    pub fn tag(&self) -> &str {
        match self {
            Self::Detected(tag) => tag,
            Self::Unknown => UNKNOWN_TAG,
        }
    }

    fn from_option(value: Option<String>) -> Self {
        value.map_or(Self::Unknown, Self::Detected)
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Keeps `major.minor` of a Debian package version such as `10.3.0.26-1+cuda12.5`.
pub fn parse_trt_version(raw: &str) -> Option<String> {
    let first_line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let mut parts = first_line.split('.');
    let major = parts.next()?.trim();
    let minor = parts.next()?.trim();
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some(format!("{major}.{minor}"))
}

/// Finds the version column of the first installed `libnvinfer<N>` row in `dpkg -l` output.
pub fn parse_dpkg_list(raw: &str) -> Option<String> {
    raw.lines().find_map(|line| {
        let mut columns = line.split_whitespace();
        if columns.next()? != "ii" {
            return None;
        }
        let package = columns.next()?;
        let package = package.split(':').next().unwrap_or(package);
        let suffix = package.strip_prefix("libnvinfer")?;
        if suffix.is_empty() || !suffix.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        columns.next().map(str::to_string)
    })
}

/// `8.9` from `nvidia-smi --query-gpu=compute_cap` becomes `sm89`.
pub fn parse_compute_capability(raw: &str) -> Option<String> {
    let first = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let digits: String = first.chars().filter(|ch| *ch != '.').collect();
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(format!("sm{digits}"))
}

pub fn detect_runtime_version() -> Probe {
    let from_query = run_probe("dpkg-query", &["-W", "-f", "${Version}", TRT_PACKAGE])
        .and_then(|out| parse_trt_version(&out));

    let version = from_query.or_else(|| {
        run_probe("dpkg", &["-l"])
            .and_then(|out| parse_dpkg_list(&out))
            .and_then(|raw| parse_trt_version(&raw))
    });

    let probe = Probe::from_option(version);
    if probe == Probe::Unknown {
        warn!("could not detect TensorRT version");
    }
    probe
}

pub fn detect_accelerator() -> Probe {
    let arch = run_probe(
        "nvidia-smi",
        &["--query-gpu=compute_cap", "--format=csv,noheader"],
    )
    .and_then(|out| parse_compute_capability(&out));

    let probe = Probe::from_option(arch);
    if probe == Probe::Unknown {
        warn!("could not detect GPU architecture");
    }
    probe
}

fn run_probe(program: &str, args: &[&str]) -> Option<String> {
    match ProcessCommand::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!stdout.is_empty()).then_some(stdout)
        }
        Ok(output) => {
            debug!(program, status = ?output.status.code(), "probe exited unsuccessfully");
            None
        }
        Err(err) => {
            debug!(program, error = %err, "probe could not be started");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableSource {
    Override,
    Primary,
    Fallback,
    /// Nothing exists on disk; the path is attempted anyway so the failure
    /// surfaces at dispatch with diagnostics attached.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableResolution {
    pub path: PathBuf,
    pub source: ExecutableSource,
}

/// Override, then primary, then fallback; the first that exists wins.
pub fn resolve_executable_with(
    override_path: Option<&Path>,
    primary: &Path,
    fallback: &Path,
) -> ExecutableResolution {
    let candidates = [
        (override_path, ExecutableSource::Override),
        (Some(primary), ExecutableSource::Primary),
        (Some(fallback), ExecutableSource::Fallback),
    ];

    for (candidate, source) in candidates {
        if let Some(path) = candidate.filter(|path| path.exists()) {
            return ExecutableResolution {
                path: path.to_path_buf(),
                source,
            };
        }
    }

    ExecutableResolution {
        path: override_path.unwrap_or(primary).to_path_buf(),
        source: ExecutableSource::Unresolved,
    }
}

/// Reads the override location from `override_env_var` and resolves.
pub fn resolve_executable(
    override_env_var: &str,
    primary: &Path,
    fallback: &Path,
) -> ExecutableResolution {
    let override_path = env::var_os(override_env_var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    let resolution = resolve_executable_with(override_path.as_deref(), primary, fallback);

    match resolution.source {
        ExecutableSource::Unresolved => warn!(
            path = %resolution.path.display(),
            env_var = override_env_var,
            "upscaler binary not found; attempting configured path anyway"
        ),
        source => debug!(path = %resolution.path.display(), ?source, "using upscaler binary"),
    }
    resolution
}

/// Logs what the probes found; called once during daemon startup.
pub fn log_host_probes(version: &Probe, arch: &Probe) {
    info!(trt = %version, arch = %arch, "detected host runtime");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trt_version_keeps_major_minor() {
        assert_eq!(
            parse_trt_version("10.3.0.26-1+cuda12.5"),
            Some("10.3".to_string())
        );
        assert_eq!(parse_trt_version("8.6.1\n"), Some("8.6".to_string()));
        assert_eq!(parse_trt_version("10"), None);
        assert_eq!(parse_trt_version("   "), None);
    }

    #[test]
    fn dpkg_list_picks_first_installed_libnvinfer() {
        let listing = "\
ii  libcudnn9       9.1.0.70-1     amd64  cuDNN runtime
rc  libnvinfer9     9.0.0-1        amd64  removed
ii  libnvinfer-bin  10.3.0.26-1    amd64  TensorRT binaries
ii  libnvinfer10    10.3.0.26-1+cuda12.5  amd64  TensorRT runtime
ii  libnvinfer8     8.6.1-1        amd64  TensorRT runtime
";
        let raw = parse_dpkg_list(listing).expect("libnvinfer row");
        assert_eq!(raw, "10.3.0.26-1+cuda12.5");
        assert_eq!(parse_trt_version(&raw), Some("10.3".to_string()));
    }

    #[test]
    fn compute_capability_becomes_sm_tag() {
        assert_eq!(parse_compute_capability("8.9\n8.9\n"), Some("sm89".to_string()));
        assert_eq!(parse_compute_capability("12.0"), Some("sm120".to_string()));
        assert_eq!(parse_compute_capability("No devices were found"), None);
        assert_eq!(parse_compute_capability(""), None);
    }

    #[test]
    fn unknown_probe_renders_sentinel_tag() {
        assert_eq!(Probe::Unknown.tag(), "unknown");
        assert_eq!(Probe::Detected("sm86".into()).to_string(), "sm86");
    }

    #[test]
    fn resolution_prefers_override_then_primary_then_fallback() {
        let temp = tempfile::tempdir().unwrap();
        let override_path = temp.path().join("override");
        let primary = temp.path().join("primary");
        let fallback = temp.path().join("fallback");
        std::fs::write(&primary, b"").unwrap();
        std::fs::write(&fallback, b"").unwrap();

        let resolved = resolve_executable_with(Some(&override_path), &primary, &fallback);
        assert_eq!(resolved.path, primary);
        assert_eq!(resolved.source, ExecutableSource::Primary);

        std::fs::write(&override_path, b"").unwrap();
        let resolved = resolve_executable_with(Some(&override_path), &primary, &fallback);
        assert_eq!(resolved.source, ExecutableSource::Override);

        std::fs::remove_file(&primary).unwrap();
        let resolved = resolve_executable_with(None, &primary, &fallback);
        assert_eq!(resolved.path, fallback);
        assert_eq!(resolved.source, ExecutableSource::Fallback);
    }

    #[test]
    fn unresolved_executable_keeps_configured_path() {
        let temp = tempfile::tempdir().unwrap();
        let primary = temp.path().join("missing-primary");
        let fallback = temp.path().join("missing-fallback");

        let resolved = resolve_executable_with(None, &primary, &fallback);
        assert_eq!(resolved.path, primary);
        assert_eq!(resolved.source, ExecutableSource::Unresolved);
    }
}
