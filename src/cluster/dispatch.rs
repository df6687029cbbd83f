// src/cluster/dispatch.rs: local or cluster execution of built statements

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;

use crate::cluster::job::{
    build_job_script, collect_single_job, job_name, native_specification, CollectSettings, JobScript,
};
use crate::cluster::{ClusterSession, SessionError};
use crate::config::defs::{
    ExecutionFailure, PipelineError, RunConfig, ACCOUNTING_LOSS_CODE, DEFAULT_MEMORY, DEFAULT_MEMORY_RESOURCE,
};
use crate::config::params::{ParamValue, TaskOptions};
use crate::utils::command::run_local_statement;
use crate::utils::file::{get_stdout_stderr, remove_or_warn};
use crate::utils::system::warn_if_oversubscribed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Local,
    ClusterSingle,
    ClusterArray,
    ClusterBatch,
}

/// Cluster iff a session is live, the call does not set `to_cluster` false
/// and neither the call nor the run asks for local execution.
pub fn dispatch_mode(config: &RunConfig, options: &TaskOptions) -> DispatchMode {
    let to_cluster = options.get("to_cluster").map(ParamValue::is_truthy).unwrap_or(true);
    let local = config.without_cluster || options.is_true("without_cluster");
    if config.session.is_none() || !to_cluster || local {
        return DispatchMode::Local;
    }
    if options.contains_key("statements") {
        DispatchMode::ClusterBatch
    } else if options.contains_key("job_array") {
        DispatchMode::ClusterArray
    } else {
        DispatchMode::ClusterSingle
    }
}

/// `job_options` and `job_queue` replace `cluster_options` and `cluster_queue`.
pub fn apply_synonyms(options: &mut TaskOptions) {
    for (legacy, key) in [("job_options", "cluster_options"), ("job_queue", "cluster_queue")] {
        if let Some(value) = options.get(legacy).cloned() {
            options.insert(key, value);
        }
    }
}

/// Memory for the job: `job_memory` if given, else a deprecated
/// `-l <resource>=<amount>` inside `cluster_options` (which is removed from
/// the options), else `cluster_memory_default`.
pub fn resolve_job_memory(options: &mut TaskOptions) -> Result<String, PipelineError> {
    if let Some(memory) = options.get_str("job_memory") {
        return Ok(memory);
    }

    let resource = options
        .get_str("cluster_memory_resource")
        .unwrap_or_else(|| DEFAULT_MEMORY_RESOURCE.to_string());
    let cluster_options = options.get_str("cluster_options").unwrap_or_default();
    if !resource.is_empty() && cluster_options.contains(&resource) {
        warn!("use of {} in job options is deprecated, please set job_memory instead", resource);
        let rx = Regex::new(&format!(r"-l\s*{}\s*=\s*(\S+)", regex::escape(&resource)))
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        let memory = rx
            .captures(&cluster_options)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                PipelineError::Configuration(format!("error parsing memory requirements in '{}'", cluster_options))
            })?;
        let remaining = rx.replace(&cluster_options, "").split_whitespace().collect::<Vec<_>>().join(" ");
        options.insert("cluster_options", remaining);
        return Ok(memory);
    }

    Ok(options
        .get_str("cluster_memory_default")
        .unwrap_or_else(|| DEFAULT_MEMORY.to_string()))
}

fn collect_settings(config: &RunConfig, options: &TaskOptions) -> CollectSettings {
    let accounting_loss_code = options
        .get("cluster_accounting_loss_code")
        .and_then(|v| v.as_i64())
        .unwrap_or(ACCOUNTING_LOSS_CODE);
    let wait_timeout = options
        .get("cluster_wait_timeout")
        .and_then(|v| v.as_f64())
        .filter(|t| *t > 0.0)
        .map(Duration::from_secs_f64);
    CollectSettings {
        accounting_loss_code,
        wait_timeout,
        output_retry: config.output_retry,
        ignore_errors: options.is_true("ignore_errors"),
    }
}

fn session_error(e: SessionError) -> PipelineError {
    match e {
        SessionError::Timeout(id) => PipelineError::Timeout(format!("job {} did not finish in time", id)),
        other => PipelineError::Session(other.to_string()),
    }
}

/// Runs already built statements one after another on this machine.
pub async fn run_locally(
    config: &RunConfig,
    options: &TaskOptions,
    statements: &[String],
) -> Result<(), PipelineError> {
    warn_if_oversubscribed(
        options.get_str("job_memory").as_deref(),
        options.get("job_threads").and_then(|t| t.as_i64()),
    );
    let ignore_errors = options.is_true("ignore_errors");
    let ignore_pipe_errors = options.is_true("ignore_pipe_errors");
    let cwd = options.get_str("cwd").map(PathBuf::from).unwrap_or_else(|| config.cwd.clone());

    for statement in statements {
        debug!("running statement:\n{}", statement);
        let output = run_local_statement(statement, &cwd, ignore_pipe_errors).await?;
        if !output.status.success() {
            let failure = ExecutionFailure::from_output(&output, statement);
            if ignore_errors {
                warn!("ignoring failed statement (status {}): {}", failure.status(), statement);
            } else {
                return Err(PipelineError::Execution(failure));
            }
        }
    }
    Ok(())
}

/// Submits built statements through the session and collects the results.
pub async fn run_on_cluster(
    config: &RunConfig,
    session: &Arc<dyn ClusterSession>,
    mode: DispatchMode,
    options: &TaskOptions,
    statements: &[String],
    job_memory: &str,
) -> Result<(), PipelineError> {
    let name = job_name(options);
    let native = native_specification(options, job_memory, &name)?;
    let settings = collect_settings(config, options);
    let ignore_pipe_errors = options.is_true("ignore_pipe_errors");

    match mode {
        DispatchMode::ClusterBatch => {
            // a submission failure stops further submissions, but the jobs
            // already submitted are still waited for and cleaned up
            let mut submitted: Vec<(String, String, JobScript)> = Vec::with_capacity(statements.len());
            let mut submit_error: Option<PipelineError> = None;
            {
                let _guard = config.submit_lock.lock().await;
                for statement in statements {
                    debug!("running statement:\n{}", statement);
                    let script = match build_job_script(&config.cwd, statement, job_memory, &name, ignore_pipe_errors) {
                        Ok(script) => script,
                        Err(e) => {
                            submit_error = Some(e);
                            break;
                        }
                    };
                    let template = script.template(&name, &config.cwd, &native);
                    match session.run_job(&template).await {
                        Ok(job_id) => {
                            debug!("job has been submitted with job_id {}", job_id);
                            submitted.push((job_id, statement.clone(), script));
                        }
                        Err(e) => {
                            remove_or_warn(&script.path, "job script");
                            submit_error = Some(session_error(e));
                            break;
                        }
                    }
                }
            }
            if let Some(e) = &submit_error {
                warn!("submission failed after {} of {} jobs: {}", submitted.len(), statements.len(), e);
            }

            let ids: Vec<String> = submitted.iter().map(|(id, _, _)| id.clone()).collect();
            info!("waiting for {} jobs to finish", ids.len());
            let synced = session.synchronize(&ids, settings.wait_timeout).await;

            let mut first_error: Option<PipelineError> = None;
            for (job_id, statement, script) in &submitted {
                if let Err(e) = collect_single_job(session.as_ref(), job_id, statement, script, &settings).await {
                    warn!("job {} failed", job_id);
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = submit_error {
                return Err(e);
            }
            synced.map_err(session_error)?;
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        DispatchMode::ClusterArray => {
            let statement = single_statement(statements)?;
            let (start, end, step) = job_array(options)?;
            let script = build_job_script(&config.cwd, statement, job_memory, &name, ignore_pipe_errors)?;
            let template = script.template(&name, &config.cwd, &native);

            debug!("starting an array job: {}-{},{}", start, end, step);
            let submitted = {
                let _guard = config.submit_lock.lock().await;
                // one-based closed interval
                session.run_bulk_jobs(&template, start + 1, end, step).await
            };
            let ids = match submitted {
                Ok(ids) => ids,
                Err(e) => {
                    remove_or_warn(&script.path, "job script");
                    return Err(session_error(e));
                }
            };
            debug!("{} array jobs have been submitted as job_id {}", ids.len(), ids.first().map(String::as_str).unwrap_or(""));

            let synced = session.synchronize(&ids, settings.wait_timeout).await;
            let mut failed = None;
            if synced.is_ok() {
                for job_id in &ids {
                    match session.wait(job_id, settings.wait_timeout).await {
                        Ok(info) if !info.succeeded() => {
                            failed.get_or_insert(info);
                        }
                        Ok(_) => {}
                        Err(e) if settings.is_accounting_loss(&e) => {
                            warn!("Job {}: {} - treated as success", job_id, e);
                        }
                        Err(e) => warn!("could not get status of array task {}: {}", job_id, e),
                    }
                }
            }
            let (_, stderr) = get_stdout_stderr(&script.stdout_path, &script.stderr_path, &settings.output_retry).await;
            remove_or_warn(&script.path, "job script");
            synced.map_err(session_error)?;

            match failed {
                Some(info) if !settings.ignore_errors => Err(PipelineError::Execution(ExecutionFailure {
                    code: Some(info.exit_status),
                    signal: info.signal,
                    stderr,
                    statement: statement.to_string(),
                })),
                _ => Ok(()),
            }
        }
        DispatchMode::ClusterSingle => {
            let statement = single_statement(statements)?;
            let script = build_job_script(&config.cwd, statement, job_memory, &name, ignore_pipe_errors)?;
            let template = script.template(&name, &config.cwd, &native);
            let submitted = {
                let _guard = config.submit_lock.lock().await;
                session.run_job(&template).await
            };
            let job_id = match submitted {
                Ok(id) => id,
                Err(e) => {
                    remove_or_warn(&script.path, "job script");
                    return Err(session_error(e));
                }
            };
            debug!("job has been submitted with job_id {}", job_id);
            collect_single_job(session.as_ref(), &job_id, statement, &script, &settings).await
        }
        DispatchMode::Local => run_locally(config, options, statements).await,
    }
}

fn single_statement(statements: &[String]) -> Result<&str, PipelineError> {
    statements
        .first()
        .map(String::as_str)
        .ok_or_else(|| PipelineError::Statement("no statement found".to_string()))
}

/// `job_array` as `(start, end, step)`.
pub fn job_array(options: &TaskOptions) -> Result<(usize, usize, usize), PipelineError> {
    let bad = || PipelineError::Configuration("`job_array` must be (start, end, step)".to_string());
    let values: Vec<i64> = options
        .get("job_array")
        .map(|v| v.as_list())
        .ok_or_else(bad)?
        .iter()
        .map(|v| v.as_i64().ok_or_else(bad))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        [start, end, step] if *start >= 0 && *end > *start && *step > 0 => {
            Ok((*start as usize, *end as usize, *step as usize))
        }
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalSession;
    use crate::config::params::{ParamMap, Parameters};
    use anyhow::Result;
    use tempfile::tempdir;

    fn options(pairs: &[(&str, ParamValue)]) -> TaskOptions {
        let map: ParamMap = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        TaskOptions::from_map(map)
    }

    #[test]
    fn test_dispatch_mode() -> Result<()> {
        let dir = tempdir()?;
        let local = RunConfig::new(dir.path().to_path_buf(), Parameters::default());
        assert_eq!(dispatch_mode(&local, &options(&[])), DispatchMode::Local);

        let cluster = RunConfig::new(dir.path().to_path_buf(), Parameters::default())
            .with_session(Arc::new(LocalSession::with_slots(1)));
        assert_eq!(dispatch_mode(&cluster, &options(&[])), DispatchMode::ClusterSingle);
        assert_eq!(dispatch_mode(&cluster, &options(&[("to_cluster", false.into())])), DispatchMode::Local);
        assert_eq!(
            dispatch_mode(&cluster, &options(&[("job_array", vec![0, 10, 2].into())])),
            DispatchMode::ClusterArray
        );
        assert_eq!(
            dispatch_mode(&cluster, &options(&[("statements", vec!["a", "b"].into())])),
            DispatchMode::ClusterBatch
        );

        let forced_local = RunConfig::new(dir.path().to_path_buf(), Parameters::default())
            .with_session(Arc::new(LocalSession::with_slots(1)))
            .without_cluster(true);
        assert_eq!(dispatch_mode(&forced_local, &options(&[])), DispatchMode::Local);
        Ok(())
    }

    #[test]
    fn test_synonyms() {
        let mut opts = options(&[
            ("cluster_options", "".into()),
            ("job_options", "-l h_rt=1:00:00".into()),
            ("cluster_queue", "all.q".into()),
            ("job_queue", "fast.q".into()),
        ]);
        apply_synonyms(&mut opts);
        assert_eq!(opts.get_str("cluster_options").as_deref(), Some("-l h_rt=1:00:00"));
        assert_eq!(opts.get_str("cluster_queue").as_deref(), Some("fast.q"));
    }

    #[test]
    fn test_resolve_job_memory() -> Result<()> {
        let base = [
            ("cluster_memory_resource", ParamValue::from("mem_free")),
            ("cluster_memory_default", ParamValue::from("2G")),
        ];

        let mut explicit = options(&base);
        explicit.insert("job_memory", "8G");
        explicit.insert("cluster_options", "-l mem_free=4G");
        assert_eq!(resolve_job_memory(&mut explicit)?, "8G");

        let mut legacy = options(&base);
        legacy.insert("cluster_options", "-l mem_free = 4G -l h_rt=1:00:00");
        assert_eq!(resolve_job_memory(&mut legacy)?, "4G");
        assert_eq!(legacy.get_str("cluster_options").as_deref(), Some("-l h_rt=1:00:00"));

        let mut fallback = options(&base);
        fallback.insert("cluster_options", "");
        assert_eq!(resolve_job_memory(&mut fallback)?, "2G");

        let mut broken = options(&base);
        broken.insert("cluster_options", "mem_free");
        assert!(matches!(resolve_job_memory(&mut broken), Err(PipelineError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn test_job_array() -> Result<()> {
        assert_eq!(job_array(&options(&[("job_array", vec![0, 10, 2].into())]))?, (0, 10, 2));
        assert!(job_array(&options(&[("job_array", vec![0, 10].into())])).is_err());
        assert!(job_array(&options(&[("job_array", vec![5, 1, 1].into())])).is_err());
        assert!(job_array(&options(&[])).is_err());
        Ok(())
    }
}
