use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cluster::ClusterSession;
use crate::config::params::{ParamValue, Parameters};
use crate::utils::file::FileRetry;

// External software
pub const BASH_TAG: &str = "bash";
pub const QSUB_TAG: &str = "qsub";
pub const QSTAT_TAG: &str = "qstat";
pub const QACCT_TAG: &str = "qacct";

// Static filenames
pub const PIPELINE_INI: &str = "pipeline.ini";
pub const PIPELINE_LOG: &str = "pipeline.log";
pub const SHELL_LOG: &str = "shell.log";
pub const USER_CONFIG: &str = ".cgat";
pub const TEMP_PREFIX: &str = "ctmp";

// Static Parameters
pub const DEFAULT_JOB_NAME: &str = "task";
pub const DEFAULT_MEMORY: &str = "2G";
pub const DEFAULT_MEMORY_RESOURCE: &str = "mem_free";
pub const ACCOUNTING_LOSS_CODE: i64 = 24;
pub const ACCOUNTING_RETRIES: usize = 12;
pub const ACCOUNTING_RETRY_DELAY_MS: u64 = 5000;
pub const OUTPUT_RETRIES: usize = 5;
pub const OUTPUT_RETRY_DELAY_MS: u64 = 1000;

/// Parameters that are interpolated against the full parameter map once
/// every configuration layer has been merged.
pub const INTERPOLATE_PARAMS: &[&str] = &["cmd-run-function"];

/// Keyword arguments consumed by the dispatcher, never seen by a remote function.
pub const DISPATCH_KWARGS: &[&str] = &[
    "submit",
    "to_cluster",
    "logfile",
    "job_options",
    "job_queue",
    "job_threads",
    "job_memory",
];

// detect_pipe_error(): propagate the error of any program in a pipe, not just the last.
// checkpoint(): abort a chain of commands joined with ; if the previous one failed.
pub const EXEC_PREFIX: &str = r##"detect_pipe_error_helper()
    {
    while [ "$#" != 0 ] ; do
        if [ "$1" != 0 ] ; then return 1 ; fi
        shift 1
    done
    return 0
    }
    detect_pipe_error() {
    detect_pipe_error_helper "${PIPESTATUS[@]}"
    return $?
    }
    checkpoint() {
        detect_pipe_error;
        if [ $? != 0 ]; then exit 1; fi;
    }
    "##;

pub const EXEC_SUFFIX: &str = "; detect_pipe_error";

lazy_static! {
    /// Built-in parameters that do not depend on the environment.
    pub static ref HARDCODED_PARAMS: Vec<(&'static str, ParamValue)> = vec![
        ("cmd-run-function", ParamValue::from("%(pipeline_bin)s run-function")),
        ("cmd-sql", ParamValue::from("sqlite3 -header -csv -separator $'\\t'")),
        ("database_backend", ParamValue::from("sqlite")),
        ("database_host", ParamValue::from("")),
        ("database_name", ParamValue::from("csvdb")),
        ("database_username", ParamValue::from("cgat")),
        ("database_password", ParamValue::from("")),
        ("database_port", ParamValue::Int(3306)),
        ("cluster_queue", ParamValue::from("all.q")),
        ("cluster_priority", ParamValue::Int(-10)),
        ("cluster_num_jobs", ParamValue::Int(100)),
        ("cluster_memory_resource", ParamValue::from(DEFAULT_MEMORY_RESOURCE)),
        ("cluster_memory_default", ParamValue::from(DEFAULT_MEMORY)),
        ("cluster_options", ParamValue::from("")),
        ("cluster_parallel_environment", ParamValue::from("dedicated")),
        ("cluster_accounting_loss_code", ParamValue::Int(ACCOUNTING_LOSS_CODE)),
        ("cluster_wait_timeout", ParamValue::Int(0)),
        ("jobs_limit_db", ParamValue::Int(10)),
        ("jobs_limit_R", ParamValue::Int(1)),
    ];
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("{0}")]
    Execution(ExecutionFailure),

    #[error("Cluster session error: {0}")]
    Session(String),

    #[error("Remote function error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Pipeline failed with {0} errors")]
    PipelineFailed(usize),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

/// A statement that finished with a nonzero status, locally or on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr: String,
    pub statement: String,
}

impl ExecutionFailure {
    /// The signal number if the child was killed, otherwise its exit code.
    pub fn status(&self) -> i32 {
        self.signal.or(self.code).unwrap_or(-1)
    }

    pub fn from_output(output: &std::process::Output, statement: &str) -> Self {
        use std::os::unix::process::ExitStatusExt;
        ExecutionFailure {
            code: output.status.code(),
            signal: output.status.signal(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            statement: statement.to_string(),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---------------------------------------")?;
        match self.signal {
            Some(signal) => writeln!(f, "Child was terminated by signal {}: ", signal)?,
            None => writeln!(f, "Child exited with code {}: ", self.code.unwrap_or(-1))?,
        }
        writeln!(f, "The stderr was: ")?;
        writeln!(f, "{}", self.stderr.trim_end())?;
        writeln!(f, "{}", self.statement)?;
        write!(f, "-----------------------------------------")
    }
}

pub struct RunConfig {
    pub cwd: PathBuf,
    pub params: Arc<Parameters>,
    pub session: Option<Arc<dyn ClusterSession>>,
    pub without_cluster: bool,
    pub dryrun: bool,
    pub output_retry: FileRetry,
    pub submit_lock: Mutex<()>,
}

impl RunConfig {
    pub fn new(cwd: PathBuf, params: Parameters) -> Self {
        RunConfig {
            cwd,
            params: Arc::new(params),
            session: None,
            without_cluster: false,
            dryrun: false,
            output_retry: FileRetry::default(),
            submit_lock: Mutex::new(()),
        }
    }

    pub fn with_session(mut self, session: Arc<dyn ClusterSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn without_cluster(mut self, local: bool) -> Self {
        self.without_cluster = local;
        self
    }

    pub fn dryrun(mut self, dryrun: bool) -> Self {
        self.dryrun = dryrun;
        self
    }

    pub fn output_retry(mut self, retry: FileRetry) -> Self {
        self.output_retry = retry;
        self
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("cwd", &self.cwd)
            .field("params", &self.params.len())
            .field("session", &self.session.as_ref().map(|s| s.name().to_string()))
            .field("without_cluster", &self.without_cluster)
            .field("dryrun", &self.dryrun)
            .finish()
    }
}
