/// Functions for running built statements as local child processes

use std::path::Path;
use std::process::{Output, Stdio};

use log::debug;
use tokio::process::Command;

use crate::config::defs::{PipelineError, BASH_TAG};
use crate::utils::statement::{expand_statement, shell_quote};

const DEFAULT_SHELL: &str = "/bin/bash";

/// Rewraps a statement using process substitution `<(...)` so it runs under
/// the user's `$SHELL`, which must be a bash (any path containing `bash`).
pub fn wrap_process_substitution(statement: &str, shell: Option<&str>) -> Result<String, PipelineError> {
    if !statement.contains("<(") {
        return Ok(statement.to_string());
    }
    let shell = shell.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SHELL);
    if !shell.contains(BASH_TAG) {
        return Err(PipelineError::Configuration(format!(
            "require bash for advanced shell syntax: <() but got {}",
            shell
        )));
    }
    Ok(format!("{} -c {}", shell, shell_quote(statement)))
}

/// Runs `statement` with `bash -c` in `cwd` and captures its output.
///
/// # Arguments
///
/// * `statement` - Built statement.
/// * `cwd` - Working directory of the child.
/// * `ignore_pipe_errors` - Skip the pipe-error wrapper.
///
/// # Returns
///
/// The finished process output. A nonzero exit is not an error here.
pub async fn run_local_statement(
    statement: &str,
    cwd: &Path,
    ignore_pipe_errors: bool,
) -> Result<Output, PipelineError> {
    let shell = std::env::var("SHELL").ok();
    let wrapped = wrap_process_substitution(statement, shell.as_deref())?;
    let expanded = expand_statement(&wrapped, ignore_pipe_errors);
    run_bash(&expanded, cwd).await
}

/// Runs `statement` verbatim with `bash -c` in `cwd`.
pub async fn run_bash(statement: &str, cwd: &Path) -> Result<Output, PipelineError> {
    debug!("running in {}: {}", cwd.display(), statement);
    Command::new(BASH_TAG)
        .arg("-c")
        .arg(statement)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::IOError(format!("Failed to spawn {}: {}", BASH_TAG, e)))
}
