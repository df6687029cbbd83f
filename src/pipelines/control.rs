// src/pipelines/control.rs: running a set of tasks against one cluster session

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use log::{error, info, warn};
use tokio::sync::Semaphore;

use crate::cluster::local::LocalSession;
use crate::cluster::sge::SgeSession;
use crate::cluster::ClusterSession;
use crate::config::defs::{PipelineError, RunConfig, PIPELINE_INI, PIPELINE_LOG};
use crate::config::params::{ParamMap, ParamValue};
use crate::pipelines::run::{execute, RunOptions};
use crate::utils::statement::{escape_percent, shell_quote};

/// A task that did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task: String,
    pub job: Option<String>,
    pub error: String,
}

/// Runs the tasks needed for a set of targets with at most `workers`
/// tasks at a time and reports the ones that failed.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    async fn run(&self, config: Arc<RunConfig>, targets: &[String], workers: usize) -> Vec<TaskFailure>;
}

pub type TaskFn = Arc<dyn Fn(Arc<RunConfig>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Named tasks run in registration order. A target selects one task; no
/// targets selects all of them.
#[derive(Clone, Default)]
pub struct TaskList {
    tasks: Vec<(String, TaskFn)>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(mut self, name: &str, task: F) -> Self
    where
        F: Fn(Arc<RunConfig>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move |config| task(config).boxed());
        self.tasks.push((name.to_string(), task));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl std::fmt::Debug for TaskList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskList").field("tasks", &self.names()).finish()
    }
}

#[async_trait]
impl TaskEngine for TaskList {
    async fn run(&self, config: Arc<RunConfig>, targets: &[String], workers: usize) -> Vec<TaskFailure> {
        let known: HashSet<&str> = self.names().into_iter().collect();
        let mut failures: Vec<TaskFailure> = targets
            .iter()
            .filter(|t| !known.contains(t.as_str()))
            .map(|t| TaskFailure { task: t.clone(), job: None, error: format!("unknown task '{}'", t) })
            .collect();

        let slots = Arc::new(Semaphore::new(workers.max(1)));
        let selected = self
            .tasks
            .iter()
            .filter(|(name, _)| targets.is_empty() || targets.iter().any(|t| t == name));

        let handles = selected.map(|(name, task)| {
            let slots = slots.clone();
            let config = config.clone();
            let task = task.clone();
            let name = name.clone();
            async move {
                let _permit = slots.acquire_owned().await.ok();
                info!("Task {} started", name);
                let handle = tokio::spawn(task(config));
                let outcome = match handle.await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{:#}", e)),
                    Err(e) => Some(format!("task panicked: {}", e)),
                };
                match outcome {
                    Some(error) => Some(TaskFailure { task: name, job: None, error }),
                    None => {
                        info!("Task {} completed", name);
                        None
                    }
                }
            }
        });

        failures.extend(join_all(handles).await.into_iter().flatten());
        failures
    }
}

/// Which resource manager `make` connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Sge,
    Local,
}

pub fn open_session(kind: SessionKind) -> Result<Arc<dyn ClusterSession>, PipelineError> {
    match kind {
        SessionKind::Sge => {
            let session = SgeSession::new().map_err(|e| PipelineError::Session(e.to_string()))?;
            Ok(Arc::new(session))
        }
        SessionKind::Local => Ok(Arc::new(LocalSession::new())),
    }
}

#[derive(Debug, Clone)]
pub struct MakeSettings {
    pub workers: usize,
    pub without_cluster: bool,
    pub session: SessionKind,
}

impl Default for MakeSettings {
    fn default() -> Self {
        MakeSettings { workers: 1, without_cluster: false, session: SessionKind::Sge }
    }
}

/// Runs `targets` through `engine`. A session is opened unless running
/// without a cluster and is always closed afterwards. Failures are
/// summarised in the log and written in full to `pipeline.log`.
///
/// # Arguments
///
/// * `engine` - Runs the tasks.
/// * `targets` - Tasks to run; empty for all.
/// * `config` - Run configuration without a session.
/// * `settings` - Workers and session choice.
///
/// # Returns
///
/// `PipelineFailed` with the number of failed tasks.
pub async fn make(
    engine: &dyn TaskEngine,
    targets: &[String],
    config: RunConfig,
    settings: &MakeSettings,
) -> Result<(), PipelineError> {
    let local = settings.without_cluster || config.without_cluster;
    let session = if local { None } else { Some(open_session(settings.session)?) };
    let config = match &session {
        Some(session) => config.with_session(session.clone()),
        None => config.without_cluster(true),
    };
    let log_path = config.cwd.join(PIPELINE_LOG);
    let config = Arc::new(config);

    let failures = engine.run(config, targets, settings.workers).await;

    if let Some(session) = session {
        if let Err(e) = session.exit().await {
            warn!("could not close {} session: {}", session.name(), e);
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    for (n, failure) in failures.iter().enumerate() {
        let first_line = failure.error.lines().find(|l| !l.trim().is_empty() && !l.starts_with("---"));
        error!(
            "{}: Task={} Job={} Error={}",
            n + 1,
            failure.task,
            failure.job.as_deref().unwrap_or("-"),
            first_line.unwrap_or("").trim()
        );
    }
    if let Err(e) = write_failure_log(&log_path, &failures) {
        warn!("could not write {}: {}", log_path.display(), e);
    }
    error!("full traceback can be found in {}", log_path.display());
    Err(PipelineError::PipelineFailed(failures.len()))
}

fn write_failure_log(path: &Path, failures: &[TaskFailure]) -> std::io::Result<()> {
    let mut log = OpenOptions::new().create(true).append(true).open(path)?;
    for (n, failure) in failures.iter().enumerate() {
        writeln!(log, "start of error messages for task {}: {}", n + 1, failure.task)?;
        if let Some(job) = &failure.job {
            writeln!(log, "job: {}", job)?;
        }
        writeln!(log, "{}", failure.error)?;
        writeln!(log, "end of error messages")?;
    }
    Ok(())
}

/// Reads the parameters of another pipeline by running `<pipeline> dump`
/// in `workingdir`.
///
/// With `update_interface`, `interface*` values are rebased onto
/// `workingdir`; `restrict_interface` keeps only those keys; `prefix` is
/// prepended to every key.
pub async fn peek_parameters(
    config: &RunConfig,
    workingdir: &Path,
    pipeline: &str,
    prefix: Option<&str>,
    update_interface: bool,
    restrict_interface: bool,
) -> Result<ParamMap, PipelineError> {
    if !workingdir.is_dir() {
        return Err(PipelineError::Configuration(format!(
            "working directory {} does not exist",
            workingdir.display()
        )));
    }
    let statement = format!("{} dump", escape_percent(&shell_quote(pipeline)));
    let (stdout, _) = execute(config, RunOptions::new(&statement).cwd(workingdir)).await?;

    let line = stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .ok_or_else(|| PipelineError::Configuration(format!("no parameters in output of {} dump", pipeline)))?;
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
        .map_err(|e| PipelineError::Configuration(format!("could not parse output of {} dump: {}", pipeline, e)))?;

    let mut dump = ParamMap::new();
    for (key, value) in &object {
        let mut value = ParamValue::from_json(value)?;
        if update_interface && key.starts_with("interface") {
            if let ParamValue::Str(path) = &value {
                value = ParamValue::from(workingdir.join(path));
            }
        }
        if restrict_interface && !key.starts_with("interface") {
            continue;
        }
        dump.insert(format!("{}{}", prefix.unwrap_or(""), key), value);
    }
    Ok(dump)
}

/// Copies the default `pipeline.ini` from `src_dir` into `dest_dir` unless
/// one is already there.
pub fn write_config_files(src_dir: &Path, dest_dir: &Path) -> Result<Option<PathBuf>, PipelineError> {
    let src = src_dir.join(PIPELINE_INI);
    let dest = dest_dir.join(PIPELINE_INI);
    if dest.exists() {
        warn!("file `{}` already exists - skipped", dest.display());
        return Ok(None);
    }
    if !src.exists() {
        return Err(PipelineError::Configuration(format!("default config file `{}` not found", src.display())));
    }
    fs::copy(&src, &dest)?;
    info!("created new configuration file `{}`", dest.display());
    Ok(Some(dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::params::Parameters;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_task_list_runs_selected() -> Result<()> {
        let dir = tempdir()?;
        let counter = Arc::new(AtomicUsize::new(0));
        let (a, b) = (counter.clone(), counter.clone());
        let tasks = TaskList::new()
            .add("first", move |_| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .add("second", move |_| {
                let b = b.clone();
                async move {
                    b.fetch_add(10, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            });
        let config = Arc::new(RunConfig::new(dir.path().to_path_buf(), Parameters::default()));

        let failures = tasks.run(config.clone(), &["second".to_string()], 2).await;
        assert!(failures.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        let failures = tasks.run(config, &[], 1).await;
        assert!(failures.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 21);
        Ok(())
    }

    #[tokio::test]
    async fn test_make_reports_failures() -> Result<()> {
        let dir = tempdir()?;
        let tasks = TaskList::new()
            .add("good", |_| async { anyhow::Ok(()) })
            .add("bad", |_| async { Err::<(), _>(anyhow!("exploded\nwith details")) });
        let config = RunConfig::new(dir.path().to_path_buf(), Parameters::default());
        let settings = MakeSettings { without_cluster: true, ..Default::default() };

        let result = make(&tasks, &[], config, &settings).await;
        assert!(matches!(result, Err(PipelineError::PipelineFailed(1))));
        let log = fs::read_to_string(dir.path().join(PIPELINE_LOG))?;
        assert!(log.contains("task 1: bad"));
        assert!(log.contains("with details"));
        Ok(())
    }

    #[tokio::test]
    async fn test_make_with_local_session() -> Result<()> {
        let dir = tempdir()?;
        let tasks = TaskList::new().add("uses_session", |config: Arc<RunConfig>| async move {
            if config.session.is_none() {
                return Err(anyhow!("no session"));
            }
            anyhow::Ok(())
        });
        let config = RunConfig::new(dir.path().to_path_buf(), Parameters::default());
        let settings = MakeSettings { session: SessionKind::Local, ..Default::default() };
        make(&tasks, &[], config, &settings).await?;

        let unknown = make(
            &tasks,
            &["missing".to_string()],
            RunConfig::new(dir.path().to_path_buf(), Parameters::default()),
            &settings,
        )
        .await;
        assert!(matches!(unknown, Err(PipelineError::PipelineFailed(1))));
        Ok(())
    }

    #[test]
    fn test_write_config_files() -> Result<()> {
        let src = tempdir()?;
        let dest = tempdir()?;
        assert!(write_config_files(src.path(), dest.path()).is_err());

        fs::write(src.path().join(PIPELINE_INI), "[general]\nthreads=4\n")?;
        let written = write_config_files(src.path(), dest.path())?;
        assert_eq!(written, Some(dest.path().join(PIPELINE_INI)));

        fs::write(src.path().join(PIPELINE_INI), "[general]\nthreads=8\n")?;
        assert_eq!(write_config_files(src.path(), dest.path())?, None);
        assert!(fs::read_to_string(dest.path().join(PIPELINE_INI))?.contains("threads=4"));
        Ok(())
    }

    #[tokio::test]
    async fn test_peek_parameters() -> Result<()> {
        let dir = tempdir()?;
        let script = dir.path().join("pipeline.sh");
        fs::write(
            &script,
            "#!/bin/bash\necho 'some log line'\necho '{\"interface_bam\":\"out/a.bam\",\"threads\":4}'\n",
        )?;
        crate::utils::file::set_job_permissions(&script)?;
        let config = RunConfig::new(dir.path().to_path_buf(), Parameters::default());

        let all = peek_parameters(&config, dir.path(), &script.to_string_lossy(), None, false, false).await?;
        assert_eq!(all.get("interface_bam"), Some(&ParamValue::from("out/a.bam")));
        assert_eq!(all.len(), 2);

        let rebased =
            peek_parameters(&config, dir.path(), &script.to_string_lossy(), Some("up_"), true, true).await?;
        assert_eq!(rebased.len(), 1);
        assert_eq!(rebased.get("up_interface_bam"), Some(&ParamValue::from(dir.path().join("out/a.bam"))));

        let missing = peek_parameters(&config, &dir.path().join("nope"), "x", None, false, false).await;
        assert!(matches!(missing, Err(PipelineError::Configuration(_))));
        Ok(())
    }
}
