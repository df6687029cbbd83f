use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use log::warn;
use tempfile::Builder;
use tokio::time::sleep;

use crate::config::defs::{PipelineError, OUTPUT_RETRIES, OUTPUT_RETRY_DELAY_MS, TEMP_PREFIX};
use crate::config::params::Parameters;

/// How long to wait for job output files that may lag on a network filesystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileRetry {
    pub tries: usize,
    pub delay: Duration,
}

impl Default for FileRetry {
    fn default() -> Self {
        FileRetry {
            tries: OUTPUT_RETRIES,
            delay: Duration::from_millis(OUTPUT_RETRY_DELAY_MS),
        }
    }
}

/// Joins `path` onto `cwd` unless it is absolute, then removes `.` and `..`
/// components without touching the filesystem.
pub fn absolute_path(cwd: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() { path.to_path_buf() } else { cwd.join(path) };
    let mut normalised = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_os_str()),
        }
    }
    normalised
}

/// The temporary directory for this process (`tmpdir`) or the one shared
/// with cluster nodes (`shared_tmpdir`).
pub fn temp_root(params: &Parameters, shared: bool) -> PathBuf {
    let key = if shared { "shared_tmpdir" } else { "tmpdir" };
    params
        .get_str(key)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// Creates a temporary file in `dir`. The caller deletes it.
///
/// # Arguments
///
/// * `dir` - Directory to create the file in.
///
/// # Returns
///
/// The open file and its path.
pub fn temp_file(dir: &Path) -> Result<(File, PathBuf), PipelineError> {
    Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| PipelineError::IOError(format!("Failed to create temp file in {}: {}", dir.display(), e)))?
        .keep()
        .map_err(|e| PipelineError::IOError(format!("Failed to keep temp file: {}", e)))
}

/// Creates an empty temporary file in `dir` and returns its name.
pub fn temp_filename(dir: &Path) -> Result<PathBuf, PipelineError> {
    let (_, path) = temp_file(dir)?;
    Ok(path)
}

/// Creates a temporary directory in `dir`. The caller deletes it.
pub fn temp_dir(dir: &Path) -> Result<PathBuf, PipelineError> {
    let tmp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(dir)
        .map_err(|e| PipelineError::IOError(format!("Failed to create temp dir in {}: {}", dir.display(), e)))?;
    Ok(tmp.keep())
}

/// Read, write and execute for user and group.
pub fn set_job_permissions(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o770))
}

/// Removes a file, logging rather than failing if it cannot be removed.
pub fn remove_or_warn(path: &Path, what: &str) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Could not remove {} {}: {}", what, path.display(), e);
    }
}

/// Reads a job's stdout and stderr, waiting for the files to appear.
/// Missing files are logged and read as empty. Both files are removed.
pub async fn get_stdout_stderr(stdout_path: &Path, stderr_path: &Path, retry: &FileRetry) -> (String, String) {
    for _ in 0..retry.tries {
        if stderr_path.exists() {
            break;
        }
        sleep(retry.delay).await;
    }

    let stdout = tokio::fs::read_to_string(stdout_path).await.unwrap_or_else(|e| {
        warn!("could not open stdout {}: {}", stdout_path.display(), e);
        String::new()
    });
    let stderr = tokio::fs::read_to_string(stderr_path).await.unwrap_or_else(|e| {
        warn!("could not open stderr {}: {}", stderr_path.display(), e);
        String::new()
    });

    for path in [stdout_path, stderr_path] {
        if path.exists() {
            remove_or_warn(path, "job output");
        }
    }
    (stdout, stderr)
}
