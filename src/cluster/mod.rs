// src/cluster/mod.rs: sessions with a distributed resource manager

pub mod dispatch;
pub mod job;
pub mod local;
pub mod sge;

use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub type JobId = String;

/// Everything a session needs to start one job, or one array of jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobTemplate {
    pub job_name: String,
    pub remote_command: PathBuf,
    pub working_directory: PathBuf,
    pub native_specification: String,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
    pub environment: Vec<(String, String)>,
}

/// Final state of a job as reported by the resource manager.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub job_id: JobId,
    pub exit_status: i32,
    pub signal: Option<i32>,
    pub was_aborted: bool,
}

impl JobInfo {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && self.signal.is_none() && !self.was_aborted
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The resource manager reported an error code.
    #[error("{message} (code {code})")]
    Code { code: i64, message: String },

    /// The job finished but the resource manager kept no record of how.
    #[error("no accounting information for job {0}")]
    AccountingLost(JobId),

    #[error("timed out waiting for job {0}")]
    Timeout(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("{0}")]
    Io(String),
}

/// A live connection to a resource manager. A single session is shared by
/// every task; callers serialise job submission around it.
#[async_trait]
pub trait ClusterSession: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Submits one job and returns without waiting for it.
    async fn run_job(&self, template: &JobTemplate) -> Result<JobId, SessionError>;

    /// Submits an array job over the one-based closed interval
    /// `start..=end` with `step` and returns one id per task.
    async fn run_bulk_jobs(
        &self,
        template: &JobTemplate,
        start: usize,
        end: usize,
        step: usize,
    ) -> Result<Vec<JobId>, SessionError>;

    /// Blocks until the job has finished. `None` waits forever.
    async fn wait(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<JobInfo, SessionError>;

    /// Blocks until every job has finished.
    async fn synchronize(&self, job_ids: &[JobId], timeout: Option<Duration>) -> Result<(), SessionError>;

    /// Ends the session. Outstanding jobs are not cancelled.
    async fn exit(&self) -> Result<(), SessionError>;
}

/// Task ids of an array job over `start..=end` in steps of `step`.
pub fn array_task_ids(start: usize, end: usize, step: usize) -> Vec<usize> {
    if step == 0 || start > end {
        return Vec::new();
    }
    (start..=end).step_by(step).collect()
}
