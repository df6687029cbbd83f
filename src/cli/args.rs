use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum ClusterKind {
    #[default]
    Sge,
    Local,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the merged parameters as JSON
    Dump,

    /// Write the default pipeline.ini into the working directory
    Config {
        #[arg(long = "from", help = "Directory holding the default pipeline.ini")]
        from: PathBuf,
    },

    /// Run a statement locally or on the cluster
    Run {
        statement: String,

        #[arg(long)]
        job_memory: Option<String>,

        #[arg(long)]
        job_threads: Option<usize>,

        #[arg(long)]
        job_options: Option<String>,

        #[arg(long)]
        job_queue: Option<String>,

        #[arg(long, num_args = 3, value_names = ["START", "END", "STEP"])]
        job_array: Option<Vec<usize>>,

        #[arg(long)]
        outfile: Option<String>,

        #[arg(long, action)]
        ignore_errors: bool,

        #[arg(long, action)]
        ignore_pipe_errors: bool,
    },

    /// Run a statement locally and print its stdout and stderr
    Execute {
        statement: String,

        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Call a registered function with the arguments in a payload file
    RunFunction {
        #[arg(long)]
        module: String,

        #[arg(long)]
        function: String,

        #[arg(long)]
        payload: PathBuf,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(name = "pipeline-dispatch", version, about = "Run pipeline statements locally or on a Grid Engine cluster")]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short = 'v', long = "verbose", action, global = true)]
    pub verbose: bool,

    #[arg(short = 'c', long = "config", global = true, help = "Configuration files read after the defaults, later files win")]
    pub config_files: Vec<PathBuf>,

    #[arg(long = "default-ini", global = true, help = "Installation default pipeline.ini; an error if missing")]
    pub default_ini: Option<PathBuf>,

    #[arg(long = "no-user-config", action, global = true, help = "Do not read ~/.cgat")]
    pub no_user_config: bool,

    #[arg(short = 's', long = "set", global = true, value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    #[arg(long = "local", action, global = true, help = "Run every statement on this machine")]
    pub local: bool,

    #[arg(short = 'n', long = "dry-run", action, global = true)]
    pub dry_run: bool,

    #[arg(long = "cluster", default_value = "sge", value_enum, global = true)]
    pub cluster: ClusterKind,

    #[arg(long = "log-file", global = true, help = "Append log messages to this file instead of stderr")]
    pub log_file: Option<PathBuf>,
}
