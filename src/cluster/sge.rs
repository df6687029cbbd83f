// src/cluster/sge.rs: Grid Engine session driven through qsub, qstat and qacct

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use tokio::time::sleep;

use crate::cluster::{array_task_ids, ClusterSession, JobId, JobInfo, JobTemplate, SessionError};
use crate::config::defs::{ACCOUNTING_RETRIES, ACCOUNTING_RETRY_DELAY_MS, QACCT_TAG, QSTAT_TAG, QSUB_TAG};
use crate::utils::file::FileRetry;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct SgeSession {
    name: String,
    qsub: PathBuf,
    qstat: PathBuf,
    qacct: PathBuf,
    poll_interval: Duration,
    accounting_retry: FileRetry,
}

impl SgeSession {
    /// Opens a session, checking that the Grid Engine tools are on `PATH`.
    pub fn new() -> Result<Self, SessionError> {
        Self::locate(|tool| which::which(tool))
    }

    /// Opens a session with the Grid Engine tools looked up in
    /// `search_path`, a `PATH`-style list of directories.
    pub fn with_search_path(search_path: impl AsRef<OsStr>) -> Result<Self, SessionError> {
        let cwd = std::env::current_dir().map_err(|e| SessionError::Io(e.to_string()))?;
        Self::locate(|tool| which::which_in(tool, Some(search_path.as_ref()), &cwd))
    }

    fn locate<F>(find: F) -> Result<Self, SessionError>
    where
        F: Fn(&str) -> which::Result<PathBuf>,
    {
        let tool = |name: &str| {
            find(name).map_err(|e| SessionError::Io(format!("{} not found: {}. Is Grid Engine installed?", name, e)))
        };
        Ok(SgeSession {
            name: "sge".to_string(),
            qsub: tool(QSUB_TAG)?,
            qstat: tool(QSTAT_TAG)?,
            qacct: tool(QACCT_TAG)?,
            poll_interval: DEFAULT_POLL_INTERVAL,
            accounting_retry: FileRetry {
                tries: ACCOUNTING_RETRIES,
                delay: Duration::from_millis(ACCOUNTING_RETRY_DELAY_MS),
            },
        })
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How often, and how far apart, `qacct` is asked for a finished job's
    /// record before its accounting is reported lost.
    pub fn accounting_retry(mut self, retry: FileRetry) -> Self {
        self.accounting_retry = retry;
        self
    }

    fn qsub_command(&self, template: &JobTemplate) -> Command {
        let mut cmd = Command::new(&self.qsub);
        cmd.arg("-terse")
            .arg("-wd")
            .arg(&template.working_directory)
            .arg("-o")
            .arg(&template.output_path)
            .arg("-e")
            .arg(&template.error_path)
            .args(template.native_specification.split_whitespace());
        for (key, value) in &template.environment {
            cmd.arg("-v").arg(format!("{}={}", key, value));
        }
        cmd
    }

    async fn submit(&self, mut cmd: Command, template: &JobTemplate) -> Result<String, SessionError> {
        cmd.arg(&template.remote_command);
        let output = cmd
            .output()
            .await
            .map_err(|e| SessionError::Io(format!("Failed to spawn {}: {}", QSUB_TAG, e)))?;
        if !output.status.success() {
            return Err(SessionError::Code {
                code: output.status.code().unwrap_or(-1) as i64,
                message: format!("{} failed: {}", QSUB_TAG, String::from_utf8_lossy(&output.stderr).trim()),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SessionError::Io(format!("No job id in {} output", QSUB_TAG)))
    }

    /// Polls `qstat -j` until the job is no longer known to the scheduler.
    async fn poll_until_gone(&self, base_id: &str, deadline: Option<Instant>) -> Result<(), SessionError> {
        loop {
            let status = Command::new(&self.qstat)
                .arg("-j")
                .arg(base_id)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await
                .map_err(|e| SessionError::Io(format!("Failed to spawn {}: {}", QSTAT_TAG, e)))?;
            if !status.success() {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SessionError::Timeout(base_id.to_string()));
                }
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Exit status of a finished job. The record is written some time after
    /// the job leaves `qstat`, so a missing record is asked for again.
    async fn accounting(&self, job_id: &str) -> Result<JobInfo, SessionError> {
        let tries = self.accounting_retry.tries.max(1);
        for attempt in 1..=tries {
            if let Some(info) = self.query_accounting(job_id).await? {
                return Ok(info);
            }
            if attempt < tries {
                debug!("no accounting record for job {} yet ({}/{})", job_id, attempt, tries);
                sleep(self.accounting_retry.delay).await;
            }
        }
        Err(SessionError::AccountingLost(job_id.to_string()))
    }

    async fn query_accounting(&self, job_id: &str) -> Result<Option<JobInfo>, SessionError> {
        let (base, task) = split_job_id(job_id);
        let mut cmd = Command::new(&self.qacct);
        cmd.arg("-j").arg(base);
        if let Some(task) = task {
            cmd.arg("-t").arg(task);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| SessionError::Io(format!("Failed to spawn {}: {}", QACCT_TAG, e)))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_qacct(job_id, &String::from_utf8_lossy(&output.stdout)))
    }
}

/// Splits `1234.5` into the job and the array task.
fn split_job_id(job_id: &str) -> (&str, Option<&str>) {
    match job_id.split_once('.') {
        Some((base, task)) => (base, Some(task)),
        None => (job_id, None),
    }
}

/// Reads `exit_status` and `failed` from qacct output. For array jobs
/// without `-t` the last record wins.
fn parse_qacct(job_id: &str, text: &str) -> Option<JobInfo> {
    let mut exit_status = None;
    let mut failed = false;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("exit_status"), Some(value)) => exit_status = value.parse::<i32>().ok(),
            (Some("failed"), Some(value)) => failed = value != "0",
            _ => {}
        }
    }
    let exit_status = exit_status?;
    let signal = if exit_status > 128 { Some(exit_status - 128) } else { None };
    Some(JobInfo { job_id: job_id.to_string(), exit_status, signal, was_aborted: failed })
}

/// Parses `qsub -terse` output for an array job, `1234.1-10:2`.
fn parse_array_id(terse: &str) -> &str {
    terse.split('.').next().unwrap_or(terse)
}

#[async_trait]
impl ClusterSession for SgeSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_job(&self, template: &JobTemplate) -> Result<JobId, SessionError> {
        let cmd = self.qsub_command(template);
        let job_id = self.submit(cmd, template).await?;
        debug!("qsub accepted job {}", job_id);
        Ok(job_id)
    }

    async fn run_bulk_jobs(
        &self,
        template: &JobTemplate,
        start: usize,
        end: usize,
        step: usize,
    ) -> Result<Vec<JobId>, SessionError> {
        let tasks = array_task_ids(start, end, step);
        let mut cmd = self.qsub_command(template);
        cmd.arg("-t").arg(format!("{}-{}:{}", start, end, step));
        let terse = self.submit(cmd, template).await?;
        let base = parse_array_id(&terse);
        debug!("qsub accepted array job {} with {} tasks", base, tasks.len());
        Ok(tasks.into_iter().map(|t| format!("{}.{}", base, t)).collect())
    }

    async fn wait(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<JobInfo, SessionError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (base, _) = split_job_id(job_id);
        self.poll_until_gone(base, deadline).await?;
        self.accounting(job_id).await
    }

    async fn synchronize(&self, job_ids: &[JobId], timeout: Option<Duration>) -> Result<(), SessionError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut bases: Vec<&str> = job_ids.iter().map(|id| split_job_id(id).0).collect();
        bases.dedup();
        for base in bases {
            self.poll_until_gone(base, deadline).await?;
        }
        Ok(())
    }

    async fn exit(&self) -> Result<(), SessionError> {
        debug!("Closing {} session", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn tool(dir: &Path, name: &str, body: &str) -> Result<()> {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/bash\n{}\n", body))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Fake Grid Engine tools in `dir`. `qstat` reports a job while the file
    /// `running` exists; `qacct` has no record for the first `missing` calls.
    fn fake_tools(dir: &Path, missing: usize) -> Result<()> {
        tool(dir, "qsub", r#"echo "$@" > "$(dirname "$0")/qsub_args"; echo 4242"#)?;
        tool(dir, "qstat", r#"[ -e "$(dirname "$0")/running" ]"#)?;
        tool(
            dir,
            "qacct",
            &format!(
                r#"calls="$(dirname "$0")/qacct_calls"
n=$(cat "$calls" 2>/dev/null || echo 0)
echo $((n + 1)) > "$calls"
if [ "$n" -lt {} ]; then echo "error: job id $2 not found" >&2; exit 1; fi
echo "failed       0"
echo "exit_status  1""#,
                missing
            ),
        )
    }

    fn session(dir: &Path, tries: usize) -> Result<SgeSession> {
        Ok(SgeSession::with_search_path(dir)?
            .poll_interval(Duration::from_millis(10))
            .accounting_retry(FileRetry { tries, delay: Duration::from_millis(10) }))
    }

    fn qacct_calls(dir: &Path) -> Result<usize> {
        Ok(fs::read_to_string(dir.join("qacct_calls"))?.trim().parse()?)
    }

    #[tokio::test]
    async fn test_wait_retries_accounting() -> Result<()> {
        let dir = tempdir()?;
        fake_tools(dir.path(), 2)?;
        let session = session(dir.path(), 5)?;

        let info = session.wait(&"4242".to_string(), None).await?;
        assert_eq!(info.exit_status, 1);
        assert!(!info.succeeded());
        assert_eq!(qacct_calls(dir.path())?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_accounting_lost() -> Result<()> {
        let dir = tempdir()?;
        fake_tools(dir.path(), 1000)?;
        let session = session(dir.path(), 3)?;

        let result = session.wait(&"4242".to_string(), None).await;
        assert_eq!(result, Err(SessionError::AccountingLost("4242".to_string())));
        assert_eq!(qacct_calls(dir.path())?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_synchronize_polls_qstat() -> Result<()> {
        let dir = tempdir()?;
        fake_tools(dir.path(), 0)?;
        let session = session(dir.path(), 1)?;
        let ids = vec!["4242.1".to_string(), "4242.3".to_string()];

        fs::write(dir.path().join("running"), "")?;
        let pending = session.synchronize(&ids, Some(Duration::from_millis(50))).await;
        assert_eq!(pending, Err(SessionError::Timeout("4242".to_string())));

        fs::remove_file(dir.path().join("running"))?;
        session.synchronize(&ids, Some(Duration::from_millis(50))).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_run_job_passes_request() -> Result<()> {
        let dir = tempdir()?;
        fake_tools(dir.path(), 0)?;
        let session = session(dir.path(), 1)?;
        let template = JobTemplate {
            job_name: "sample1".to_string(),
            remote_command: dir.path().join("job.sh"),
            working_directory: dir.path().to_path_buf(),
            native_specification: "-V -q all.q -N sample1".to_string(),
            output_path: dir.path().join("job.sh.stdout"),
            error_path: dir.path().join("job.sh.stderr"),
            ..Default::default()
        };

        assert_eq!(session.run_job(&template).await?, "4242");
        let args = fs::read_to_string(dir.path().join("qsub_args"))?;
        assert!(args.starts_with("-terse -wd "));
        assert!(args.contains("-V -q all.q -N sample1"));
        assert!(args.trim_end().ends_with("job.sh"));

        let ids = session.run_bulk_jobs(&template, 1, 10, 2).await?;
        assert_eq!(ids, vec!["4242.1", "4242.3", "4242.5", "4242.7", "4242.9"]);
        assert!(fs::read_to_string(dir.path().join("qsub_args"))?.contains("-t 1-10:2"));
        Ok(())
    }

    #[test]
    fn test_missing_tools() -> Result<()> {
        let dir = tempdir()?;
        assert!(matches!(SgeSession::with_search_path(dir.path()), Err(SessionError::Io(_))));
        Ok(())
    }

    #[test]
    fn test_split_job_id() {
        assert_eq!(split_job_id("1234"), ("1234", None));
        assert_eq!(split_job_id("1234.7"), ("1234", Some("7")));
    }

    #[test]
    fn test_parse_qacct() {
        let text = "==============================================================\n\
                    qname        all.q\n\
                    jobname      sample1.bam\n\
                    failed       0\n\
                    exit_status  1\n";
        let info = parse_qacct("1234", text).unwrap();
        assert_eq!(info.exit_status, 1);
        assert!(!info.was_aborted);
        assert_eq!(info.signal, None);

        let killed = parse_qacct("1234", "failed  100 : assumedly after job\nexit_status  137\n").unwrap();
        assert_eq!(killed.signal, Some(9));
        assert!(killed.was_aborted);

        assert!(parse_qacct("1234", "error: job id 1234 not found\n").is_none());
    }

    #[test]
    fn test_parse_array_id() {
        assert_eq!(parse_array_id("5678.1-10:2"), "5678");
        assert_eq!(parse_array_id("5678"), "5678");
    }
}
