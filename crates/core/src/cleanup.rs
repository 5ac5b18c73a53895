use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// Scratch files owned by a single request.
///
/// Paths are handed out with random names and removed when the guard drops,
/// which covers early returns, backend failures and unwinding panics alike.
#[derive(Debug)]
pub struct TempArtifacts {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            paths: Vec::new(),
        }
    }

    /// Returns a fresh path with the given extension and tracks it for removal.
    /// Nothing is created on disk.
    pub fn reserve(&mut self, extension: &str) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        let path = self.dir.join(format!("{}.{extension}", Uuid::new_v4()));
        self.paths.push(path.clone());
        path
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in &self.paths {
            remove_if_exists(path);
        }
    }
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temporary file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temporary file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_paths_are_unique_and_carry_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifacts = TempArtifacts::new(dir.path());

        let first = artifacts.reserve("png");
        let second = artifacts.reserve(".png");

        assert_ne!(first, second);
        assert_eq!(first.extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(second.extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(first.parent(), Some(dir.path()));
        assert_eq!(artifacts.paths().len(), 2);
        assert!(!first.exists());
    }

    #[test]
    fn drop_removes_written_files_and_ignores_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let written;
        let never_written;
        {
            let mut artifacts = TempArtifacts::new(dir.path());
            written = artifacts.reserve("jpg");
            never_written = artifacts.reserve("png");
            fs::write(&written, b"bytes").unwrap();
            assert!(written.exists());
        }

        assert!(!written.exists());
        assert!(!never_written.exists());
    }

    #[test]
    fn cleanup_runs_during_unwinding() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let mut artifacts = TempArtifacts::new(&dir_path);
            let path = artifacts.reserve("png");
            fs::write(&path, b"bytes").unwrap();
            panic!("backend blew up");
        });

        assert!(result.is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
