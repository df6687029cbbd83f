// src/cluster/local.rs: a session that runs job scripts on this machine

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};

use crate::cluster::{array_task_ids, ClusterSession, JobId, JobInfo, JobTemplate, SessionError};
use crate::config::defs::BASH_TAG;
use crate::utils::system::physical_cores;

type JobFuture = Shared<BoxFuture<'static, JobInfo>>;

/// Runs each submitted job script as a `bash` child process, at most `slots`
/// at a time. Array tasks see their index in `SGE_TASK_ID`.
pub struct LocalSession {
    name: String,
    slots: Arc<Semaphore>,
    counter: AtomicUsize,
    jobs: Mutex<HashMap<JobId, JobFuture>>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::with_slots(physical_cores())
    }

    pub fn with_slots(slots: usize) -> Self {
        LocalSession {
            name: "local".to_string(),
            slots: Arc::new(Semaphore::new(slots.max(1))),
            counter: AtomicUsize::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn_job(&self, job_id: JobId, template: &JobTemplate, task_id: Option<usize>) -> JobFuture {
        let slots = self.slots.clone();
        let template = template.clone();
        let id = job_id.clone();

        let handle = tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return aborted(id),
            };
            match run_script(&template, task_id).await {
                Ok(status) => JobInfo {
                    job_id: id,
                    exit_status: status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                    signal: status.signal(),
                    was_aborted: false,
                },
                Err(e) => {
                    warn!("Local job {} could not be started: {}", id, e);
                    aborted(id)
                }
            }
        });

        async move {
            match handle.await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Local job {} panicked or was cancelled: {}", job_id, e);
                    aborted(job_id)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn job(&self, job_id: &JobId) -> Result<JobFuture, SessionError> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id).cloned().ok_or_else(|| SessionError::UnknownJob(job_id.clone()))
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSession")
            .field("name", &self.name)
            .field("available_slots", &self.slots.available_permits())
            .finish()
    }
}

fn aborted(job_id: JobId) -> JobInfo {
    JobInfo { job_id, exit_status: -1, signal: None, was_aborted: true }
}

fn output_file(path: &std::path::Path, append: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
}

async fn run_script(template: &JobTemplate, task_id: Option<usize>) -> std::io::Result<std::process::ExitStatus> {
    let append = task_id.is_some();
    let stdout = output_file(&template.output_path, append)?;
    let stderr = output_file(&template.error_path, append)?;

    let mut cmd = Command::new(BASH_TAG);
    cmd.arg(&template.remote_command)
        .current_dir(&template.working_directory)
        .envs(template.environment.iter().cloned())
        .env("JOB_NAME", &template.job_name)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(task) = task_id {
        cmd.env("SGE_TASK_ID", task.to_string());
    }
    cmd.status().await
}

#[async_trait]
impl ClusterSession for LocalSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_job(&self, template: &JobTemplate) -> Result<JobId, SessionError> {
        let job_id = format!("local-{}", self.next_id());
        let future = self.spawn_job(job_id.clone(), template, None);
        self.jobs.lock().await.insert(job_id.clone(), future);
        debug!("Started local job {} for {}", job_id, template.remote_command.display());
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
        if tasks.is_empty() {
            return Err(SessionError::Code {
                code: 4,
                message: format!("empty task range {}-{}:{}", start, end, step),
            });
        }
        // array tasks append, so start from empty output files
        for path in [&template.output_path, &template.error_path] {
            File::create(path).map_err(|e| SessionError::Io(format!("{}: {}", path.display(), e)))?;
        }

        let base = self.next_id();
        let mut jobs = self.jobs.lock().await;
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            let job_id = format!("local-{}.{}", base, task);
            jobs.insert(job_id.clone(), self.spawn_job(job_id.clone(), template, Some(task)));
            ids.push(job_id);
        }
        debug!("Started {} local array tasks as local-{}", ids.len(), base);
        Ok(ids)
    }

    /// Once a job has been waited for it is forgotten by the session.
    async fn wait(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<JobInfo, SessionError> {
        let future = self.job(job_id).await?;
        let info = match timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| SessionError::Timeout(job_id.clone()))?,
            None => future.await,
        };
        self.jobs.lock().await.remove(job_id);
        Ok(info)
    }

    async fn synchronize(&self, job_ids: &[JobId], timeout: Option<Duration>) -> Result<(), SessionError> {
        let mut futures = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            futures.push(self.job(job_id).await?);
        }
        let all = join_all(futures);
        match timeout {
            Some(limit) => {
                tokio::time::timeout(limit, all)
                    .await
                    .map_err(|_| SessionError::Timeout(job_ids.join(",")))?;
            }
            None => {
                all.await;
            }
        }
        Ok(())
    }

    async fn exit(&self) -> Result<(), SessionError> {
        let mut jobs = self.jobs.lock().await;
        debug!("Closing local session with {} recorded jobs", jobs.len());
        jobs.clear();
        Ok(())
    }
}
