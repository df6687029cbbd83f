// src/lib.rs
pub mod cli;
pub mod cluster;
pub mod config;
pub mod pipelines;
pub mod utils;

pub use config::defs::{PipelineError, RunConfig};
pub use config::params::{ParamValue, ParameterLoader, Parameters};
pub use pipelines::run::{execute, run, RunOptions};
