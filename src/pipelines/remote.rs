// src/pipelines/remote.rs: registered functions called through a payload file

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::defs::{PipelineError, RunConfig, DEFAULT_MEMORY, DISPATCH_KWARGS};
use crate::config::params::{ParamMap, ParamValue};
use crate::pipelines::run::{run, RunOptions};
use crate::utils::file::{remove_or_warn, temp_file, temp_root};
use crate::utils::statement::{escape_percent, shell_quote};

/// A registered function: positional and keyword arguments in, success or an error out.
pub type RemoteFn = Arc<dyn Fn(&[ParamValue], &ParamMap) -> anyhow::Result<()> + Send + Sync>;

/// Arguments of one remote call, written once and consumed once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteCallPayload {
    pub args: Vec<ParamValue>,
    pub kwargs: ParamMap,
}

impl RemoteCallPayload {
    pub fn new(args: Vec<ParamValue>, kwargs: ParamMap) -> Self {
        RemoteCallPayload { args, kwargs }
    }

    /// Writes the payload to a new private file in `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PipelineError::Remote(format!("Failed to encode payload: {}", e)))?;
        let (mut file, path) = temp_file(dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::IOError(format!("Failed to read payload {}: {}", path.display(), e)))?;
        let (payload, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| PipelineError::Remote(format!("Failed to decode payload {}: {}", path.display(), e)))?;
        Ok(payload)
    }
}

/// Functions that can be called by module and name from a job.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    modules: BTreeMap<String, BTreeMap<String, RemoteFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, module: &str, function: &str, f: F) -> Self
    where
        F: Fn(&[ParamValue], &ParamMap) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(function.to_string(), Arc::new(f));
        self
    }

    pub fn lookup(&self, module: &str, function: &str) -> Result<&RemoteFn, PipelineError> {
        let functions = self.modules.get(module).ok_or_else(|| {
            let available: Vec<&str> = self.modules.keys().map(String::as_str).collect();
            PipelineError::Remote(format!(
                "could not find module '{}', available modules are: {}",
                module,
                available.join(", ")
            ))
        })?;
        functions.get(function).ok_or_else(|| {
            let public: Vec<&str> = functions
                .keys()
                .map(String::as_str)
                .filter(|name| !name.starts_with('_'))
                .collect();
            PipelineError::Remote(format!(
                "could not find function '{}' in module '{}', available functions are: {}",
                function,
                module,
                public.join(", ")
            ))
        })
    }

    pub fn call(&self, module: &str, function: &str, args: &[ParamValue], kwargs: &ParamMap) -> Result<(), PipelineError> {
        let f = self.lookup(module, function)?;
        debug!("calling {}.{} with {} args", module, function, args.len());
        f(args, kwargs).map_err(|e| PipelineError::Remote(format!("{}.{} failed: {:#}", module, function, e)))
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: BTreeMap<&str, Vec<&str>> = self
            .modules
            .iter()
            .map(|(m, fs)| (m.as_str(), fs.keys().map(String::as_str).collect()))
            .collect();
        f.debug_struct("FunctionRegistry").field("modules", &names).finish()
    }
}

/// Functions available to every binary. `builtin.touch` creates each
/// positional argument as an empty file.
pub fn builtin_registry() -> FunctionRegistry {
    FunctionRegistry::new().register("builtin", "touch", |args, _| {
        for arg in args {
            let path = arg.to_string();
            fs::OpenOptions::new().create(true).append(true).open(&path)?;
        }
        Ok(())
    })
}

/// Calls a registered function with the arguments stored in `payload`. The
/// payload file is removed whatever the outcome.
pub fn run_function(registry: &FunctionRegistry, module: &str, function: &str, payload: &Path) -> Result<(), PipelineError> {
    let result = registry.lookup(module, function).and_then(|_| {
        let call = RemoteCallPayload::read(payload)?;
        registry.call(module, function, &call.args, &call.kwargs)
    });
    if payload.exists() {
        remove_or_warn(payload, "payload");
    }
    result
}

/// Runs a registered function as a job: the arguments go to a payload file in
/// the shared temporary directory and the binary's `run-function`
/// subcommand is run through [`run`].
pub async fn submit(
    config: &RunConfig,
    module: &str,
    function: &str,
    args: Vec<ParamValue>,
    kwargs: ParamMap,
    run_options: RunOptions,
) -> Result<(), PipelineError> {
    let payload = RemoteCallPayload::new(args, kwargs).write(&temp_root(&config.params, true))?;
    info!("submitting {}.{} with payload {}", module, function, payload.display());

    let statement = format!(
        "%(cmd-run-function)s --module={} --function={} --payload={}",
        escape_percent(&shell_quote(module)),
        escape_percent(&shell_quote(function)),
        escape_percent(&shell_quote(&payload.to_string_lossy())),
    );
    let mut run_options = run_options.statement(&statement);
    if !run_options.overrides().contains_key("job_memory") {
        let memory = config
            .params
            .get_str("cluster_memory_default")
            .unwrap_or_else(|| DEFAULT_MEMORY.to_string());
        run_options = run_options.job_memory(&memory);
    }

    let result = run(config, run_options).await;
    if payload.exists() {
        remove_or_warn(&payload, "payload");
    }
    result
}

/// Splits keyword arguments into those for the function and those for the dispatcher.
pub fn split_dispatch_kwargs(kwargs: &ParamMap) -> (ParamMap, ParamMap) {
    kwargs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| !DISPATCH_KWARGS.contains(&k.as_str()))
}

/// Where a wrapped function runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Local,
    Submit(RunOptions),
}

/// A registered function that runs in this process or as a job.
#[derive(Debug, Clone)]
pub struct ClusterRunnable {
    registry: Arc<FunctionRegistry>,
    module: String,
    function: String,
}

impl ClusterRunnable {
    pub fn new(registry: Arc<FunctionRegistry>, module: &str, function: &str) -> Result<Self, PipelineError> {
        registry.lookup(module, function)?;
        Ok(ClusterRunnable { registry, module: module.to_string(), function: function.to_string() })
    }

    /// Picks the dispatch from the keyword arguments: a truthy `submit` sends
    /// the call to [`submit`] with the remaining dispatch keys as options.
    pub async fn call(&self, config: &RunConfig, args: Vec<ParamValue>, kwargs: &ParamMap) -> Result<(), PipelineError> {
        let (_, dispatch_kwargs) = split_dispatch_kwargs(kwargs);
        let dispatch = if dispatch_kwargs.get("submit").map(ParamValue::is_truthy).unwrap_or(false) {
            let options = dispatch_kwargs
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "submit" | "logfile"))
                .fold(RunOptions::default(), |opts, (k, v)| opts.set(k, v.clone()));
            Dispatch::Submit(options)
        } else {
            Dispatch::Local
        };
        self.call_with(config, dispatch, args, kwargs).await
    }

    pub async fn call_with(
        &self,
        config: &RunConfig,
        dispatch: Dispatch,
        args: Vec<ParamValue>,
        kwargs: &ParamMap,
    ) -> Result<(), PipelineError> {
        let (kwargs, _) = split_dispatch_kwargs(kwargs);
        match dispatch {
            Dispatch::Local => self.registry.call(&self.module, &self.function, &args, &kwargs),
            Dispatch::Submit(options) => submit(config, &self.module, &self.function, args, kwargs, options).await,
        }
    }
}
