// src/cluster/job.rs: job scripts, resource requests and result collection

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::cluster::{ClusterSession, JobId, JobTemplate, SessionError};
use crate::config::defs::{ExecutionFailure, PipelineError, DEFAULT_JOB_NAME, SHELL_LOG};
use crate::config::params::TaskOptions;
use crate::utils::file::{get_stdout_stderr, remove_or_warn, set_job_permissions, temp_file, FileRetry};
use crate::utils::statement::expand_statement;
use crate::utils::system::human2bytes;

/// A generated job script and where its output goes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobScript {
    pub path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl JobScript {
    /// A template running this script with the given resource request.
    pub fn template(&self, job_name: &str, working_directory: &Path, native_specification: &str) -> JobTemplate {
        JobTemplate {
            job_name: job_name.to_string(),
            remote_command: self.path.clone(),
            working_directory: working_directory.to_path_buf(),
            native_specification: native_specification.to_string(),
            output_path: self.stdout_path.clone(),
            error_path: self.stderr_path.clone(),
            environment: Vec::new(),
        }
    }
}

/// Scheduler-safe job name: basename of `outfile`, colons replaced, and an
/// underscore prepended unless it starts with a letter.
pub fn job_name(options: &TaskOptions) -> String {
    let outfile = options.get_str("outfile").filter(|o| !o.is_empty());
    let base = outfile
        .as_deref()
        .and_then(|o| Path::new(o).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_JOB_NAME.to_string());
    let name = base.replace(':', "_");
    match name.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => name,
        _ => format!("_{}", name),
    }
}

fn required(options: &TaskOptions, key: &str) -> Result<String, PipelineError> {
    options
        .get_str(key)
        .ok_or_else(|| PipelineError::Configuration(format!("need `{}` to be set", key)))
}

/// Resource request passed to the scheduler:
/// `-V -q <queue> -p <priority> -N <name> <options> -l <resource>=<memory>`
/// followed by `-pe <environment> <threads> -R y` when `job_threads` is set.
pub fn native_specification(options: &TaskOptions, job_memory: &str, job_name: &str) -> Result<String, PipelineError> {
    let priority = options
        .get("cluster_priority")
        .and_then(|p| p.as_i64())
        .ok_or_else(|| PipelineError::Configuration("`cluster_priority` must be an integer".to_string()))?;

    let mut native = vec![
        "-V".to_string(),
        format!("-q {}", required(options, "cluster_queue")?),
        format!("-p {}", priority),
        format!("-N {}", job_name),
    ];
    let cluster_options = options.get_str("cluster_options").unwrap_or_default();
    if !cluster_options.trim().is_empty() {
        native.push(cluster_options.trim().to_string());
    }
    native.push(format!("-l {}={}", required(options, "cluster_memory_resource")?, job_memory));

    if let Some(threads) = options.get("job_threads") {
        let threads = threads
            .as_i64()
            .ok_or_else(|| PipelineError::Configuration(format!("`job_threads` must be an integer, got '{}'", threads)))?;
        native.push(format!("-pe {} {} -R y", required(options, "cluster_parallel_environment")?, threads));
    }
    Ok(native.join(" "))
}

/// Writes a job script into `dir`: diagnostics appended to `shell.log`,
/// a virtual memory limit, then the expanded statement.
///
/// # Arguments
///
/// * `dir` - Working directory, also holds `shell.log`.
/// * `statement` - Statement to run.
/// * `job_memory` - Memory request, e.g. `4G`.
/// * `job_name` - Name used to tag the diagnostics.
/// * `ignore_pipe_errors` - Skip the pipe-error wrapper.
///
/// # Returns
///
/// The script and its output paths.
pub fn build_job_script(
    dir: &Path,
    statement: &str,
    job_memory: &str,
    job_name: &str,
    ignore_pipe_errors: bool,
) -> Result<JobScript, PipelineError> {
    let shell_log = dir.join(SHELL_LOG);
    let shell_log = shell_log.display();
    let limit_kb = human2bytes(job_memory)? / 1024;

    let (mut file, path) = temp_file(dir)?;
    let script = path.display();
    let mut body = String::new();
    body.push_str("#!/bin/bash\n");
    body.push_str(&format!("echo \"{} : START -> {}\" >> {}\n", job_name, script, shell_log));
    body.push_str(&format!("set | sed 's/^/{} : /' &>> {}\n", job_name, shell_log));
    body.push_str(&format!("module list 2>&1 | sed 's/^/{}: /' &>> {}\n", job_name, shell_log));
    body.push_str(&format!("hostname | sed 's/^/{}: /' &>> {}\n", job_name, shell_log));
    body.push_str(&format!("cat /proc/meminfo | sed 's/^/{}: /' &>> {}\n", job_name, shell_log));
    body.push_str(&format!("echo \"{} : END -> {}\" >> {}\n", job_name, script, shell_log));
    body.push_str(&format!("ulimit -v {}\n", limit_kb));
    body.push_str(&expand_statement(statement, ignore_pipe_errors));
    body.push('\n');

    file.write_all(body.as_bytes())?;
    file.flush()?;
    drop(file);
    set_job_permissions(&path)?;

    let stdout_path = PathBuf::from(format!("{}.stdout", path.display()));
    let stderr_path = PathBuf::from(format!("{}.stderr", path.display()));
    Ok(JobScript { path, stdout_path, stderr_path })
}

/// How results are collected from the session.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectSettings {
    pub accounting_loss_code: i64,
    pub wait_timeout: Option<Duration>,
    pub output_retry: FileRetry,
    pub ignore_errors: bool,
}

impl CollectSettings {
    /// Lost accounting, or the configured code standing for it.
    pub fn is_accounting_loss(&self, error: &SessionError) -> bool {
        match error {
            SessionError::AccountingLost(_) => true,
            SessionError::Code { code, .. } => *code == self.accounting_loss_code,
            _ => false,
        }
    }
}

/// Waits for one job, reads its output, removes the script and reports a
/// nonzero exit unless errors are ignored. The accounting loss code from the
/// session counts as success.
pub async fn collect_single_job(
    session: &dyn ClusterSession,
    job_id: &JobId,
    statement: &str,
    script: &JobScript,
    settings: &CollectSettings,
) -> Result<(), PipelineError> {
    let waited = session.wait(job_id, settings.wait_timeout).await;
    let (_, stderr) = get_stdout_stderr(&script.stdout_path, &script.stderr_path, &settings.output_retry).await;

    if script.path.exists() {
        remove_or_warn(&script.path, "job script");
    } else {
        warn!("temporary job file {} not present for clean-up - ignored", script.path.display());
    }

    let info = match waited {
        Ok(info) => info,
        Err(e) if settings.is_accounting_loss(&e) => {
            warn!("Job {}: {} - treated as success", job_id, e);
            return Ok(());
        }
        Err(SessionError::Timeout(id)) => {
            return Err(PipelineError::Timeout(format!("job {} did not finish in time", id)));
        }
        Err(e) => return Err(PipelineError::Session(format!("job {}: {}", job_id, e))),
    };

    debug!("Job {} finished with exit status {}", job_id, info.exit_status);
    if !info.succeeded() && !settings.ignore_errors {
        return Err(PipelineError::Execution(ExecutionFailure {
            code: Some(info.exit_status),
            signal: info.signal,
            stderr,
            statement: statement.to_string(),
        }));
    }
    Ok(())
}
