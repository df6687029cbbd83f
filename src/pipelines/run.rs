// src/pipelines/run.rs: run and execute entry points for task functions

use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::cluster::dispatch::{apply_synonyms, dispatch_mode, resolve_job_memory, run_locally, run_on_cluster, DispatchMode};
use crate::config::defs::{ExecutionFailure, PipelineError, RunConfig};
use crate::config::params::{ParamMap, ParamValue, Parameters, TaskOptions};
use crate::utils::command::{run_bash, wrap_process_substitution};
use crate::utils::statement::build_statement;

/// One `run` or `execute` call: the statement template(s), the caller's
/// variables and the recognised options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    statement: Option<String>,
    statements: Option<Vec<String>>,
    locals: ParamMap,
    overrides: ParamMap,
}

impl RunOptions {
    pub fn new(statement: &str) -> Self {
        RunOptions { statement: Some(statement.to_string()), ..Default::default() }
    }

    /// Several statements, submitted as one batch when on the cluster.
    pub fn batch<S: AsRef<str>>(statements: &[S]) -> Self {
        RunOptions {
            statements: Some(statements.iter().map(|s| s.as_ref().to_string()).collect()),
            ..Default::default()
        }
    }

    /// Replaces the statement template, keeping every option.
    pub fn statement(mut self, statement: &str) -> Self {
        self.statement = Some(statement.to_string());
        self.statements = None;
        self
    }

    /// A variable from the calling task, visible to `%(name)s`.
    pub fn local(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.locals.insert(key.to_string(), value.into());
        self
    }

    /// An explicit option; wins over locals and parameters.
    pub fn set(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.overrides.insert(key.to_string(), value.into());
        self
    }

    pub fn to_cluster(self, to_cluster: bool) -> Self {
        self.set("to_cluster", to_cluster)
    }

    pub fn job_memory(self, memory: &str) -> Self {
        self.set("job_memory", memory)
    }

    pub fn job_threads(self, threads: usize) -> Self {
        self.set("job_threads", threads)
    }

    pub fn job_options(self, options: &str) -> Self {
        self.set("job_options", options)
    }

    pub fn job_queue(self, queue: &str) -> Self {
        self.set("job_queue", queue)
    }

    pub fn job_array(self, start: usize, end: usize, step: usize) -> Self {
        self.set("job_array", vec![start, end, step])
    }

    pub fn ignore_errors(self, ignore: bool) -> Self {
        self.set("ignore_errors", ignore)
    }

    pub fn ignore_pipe_errors(self, ignore: bool) -> Self {
        self.set("ignore_pipe_errors", ignore)
    }

    pub fn dryrun(self, dryrun: bool) -> Self {
        self.set("dryrun", dryrun)
    }

    pub fn outfile(self, outfile: &str) -> Self {
        self.set("outfile", outfile)
    }

    pub fn cwd(self, cwd: &Path) -> Self {
        self.set("cwd", cwd)
    }

    pub fn overrides(&self) -> &ParamMap {
        &self.overrides
    }

    /// Merges parameters, locals and options into the options of this call.
    pub fn resolve(&self, params: &Parameters) -> Result<TaskOptions, PipelineError> {
        let mut overrides = self.overrides.clone();
        if let Some(statement) = &self.statement {
            overrides.insert("statement".to_string(), statement.as_str().into());
        }
        if let Some(statements) = &self.statements {
            overrides.insert("statements".to_string(), statements.clone().into());
        }
        params.substitute(&self.locals, &overrides)
    }
}

/// Builds every statement of the call before anything is started.
fn build_statements(options: &TaskOptions) -> Result<Vec<String>, PipelineError> {
    match options.get("statements") {
        Some(statements) => {
            let mut built = Vec::new();
            for template in statements.as_list() {
                let mut single = options.clone();
                single.insert("statement", template);
                built.push(build_statement(&single)?);
            }
            Ok(built)
        }
        None => Ok(vec![build_statement(options)?]),
    }
}

fn is_dryrun(config: &RunConfig, options: &TaskOptions) -> bool {
    config.dryrun || options.is_true("dryrun")
}

/// Runs the statement(s) of `run_options` on the cluster if a session is
/// available, otherwise locally.
///
/// # Arguments
///
/// * `config` - Parameters, session and global flags of this run.
/// * `run_options` - Statement template(s), variables and options.
///
/// # Returns
///
/// Ok if every statement succeeded or errors are ignored.
pub async fn run(config: &RunConfig, run_options: RunOptions) -> Result<(), PipelineError> {
    let mut options = run_options.resolve(&config.params)?;
    apply_synonyms(&mut options);

    let statements = build_statements(&options)?;
    let job_memory = resolve_job_memory(&mut options)?;

    if is_dryrun(config, &options) {
        for statement in &statements {
            info!("dry-run: {}", statement);
        }
        return Ok(());
    }

    let mode = dispatch_mode(config, &options);
    debug!("dispatching {} statement(s) as {:?}", statements.len(), mode);
    match (mode, config.session.as_ref()) {
        (DispatchMode::Local, _) | (_, None) => run_locally(config, &options, &statements).await,
        (mode, Some(session)) => run_on_cluster(config, session, mode, &options, &statements, &job_memory).await,
    }
}

/// Runs a statement on this machine and returns its stdout and stderr.
/// Only the `dryrun` of the call itself is honoured.
pub async fn execute(config: &RunConfig, run_options: RunOptions) -> Result<(String, String), PipelineError> {
    let options = run_options.resolve(&config.params)?;
    let statement = build_statement(&options)?;

    if options.is_true("dryrun") {
        info!("dry-run: {}", statement);
        return Ok((String::new(), String::new()));
    }

    let cwd = options.get_str("cwd").map(PathBuf::from).unwrap_or_else(|| config.cwd.clone());
    let shell = std::env::var("SHELL").ok();
    let wrapped = wrap_process_substitution(&statement, shell.as_deref())?;
    let output = run_bash(&wrapped, &cwd).await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        if options.is_true("ignore_errors") {
            warn!("ignoring failed statement: {}", statement);
        } else {
            return Err(PipelineError::Execution(ExecutionFailure::from_output(&output, &statement)));
        }
    }
    Ok((stdout, stderr))
}
