use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use env_logger::{Builder, Target};
use log::{debug, error, info, warn, LevelFilter};

use pipeline_dispatch::cli::{parse, Arguments, ClusterKind, Command};
use pipeline_dispatch::config::defs::{PipelineError, RunConfig};
use pipeline_dispatch::config::params::{ParameterLoader, Parameters};
use pipeline_dispatch::pipelines::control::{open_session, write_config_files, SessionKind};
use pipeline_dispatch::pipelines::remote::{builtin_registry, run_function};
use pipeline_dispatch::pipelines::run::{execute, run, RunOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();
    let args = parse();

    let log_level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let mut builder = Builder::new();
    builder.filter_level(log_level).format(|buf, record| {
        // continuation lines are indented under the header
        let message = record.args().to_string().replace('\n', "\n    ");
        writeln!(
            buf,
            "[{}] {}: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            message
        )
    });
    if let Some(log_file) = &args.log_file {
        let file = OpenOptions::new().create(true).append(true).open(log_file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.init();

    if let Err(e) = dispatch(args).await {
        error!("{} (after {} milliseconds)", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }
    debug!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

fn load_parameters(args: &Arguments, cwd: &Path) -> Result<Parameters, PipelineError> {
    let mut loader = ParameterLoader::new(cwd).user_config(!args.no_user_config);
    if let Some(default_ini) = &args.default_ini {
        loader = loader.default_ini(default_ini);
    }
    for assignment in &args.set {
        loader = loader.set(assignment)?;
    }
    loader.load(args.config_files.as_slice())
}

async fn dispatch(args: Arguments) -> Result<(), PipelineError> {
    let cwd = env::current_dir()?;

    match &args.command {
        Command::RunFunction { module, function, payload } => {
            run_function(&builtin_registry(), module, function, payload)
        }
        Command::Config { from } => {
            write_config_files(from, &cwd)?;
            Ok(())
        }
        Command::Dump => {
            let params = load_parameters(&args, &cwd)?;
            println!("{}", params.dump()?);
            Ok(())
        }
        Command::Execute { statement, cwd: workdir } => {
            let params = load_parameters(&args, &cwd)?;
            let config = RunConfig::new(cwd, params);
            let mut options = RunOptions::new(statement).dryrun(args.dry_run);
            if let Some(workdir) = workdir {
                options = options.cwd(workdir);
            }
            let (stdout, stderr) = execute(&config, options).await?;
            print!("{}", stdout);
            eprint!("{}", stderr);
            Ok(())
        }
        Command::Run {
            statement,
            job_memory,
            job_threads,
            job_options,
            job_queue,
            job_array,
            outfile,
            ignore_errors,
            ignore_pipe_errors,
        } => {
            let params = load_parameters(&args, &cwd)?;
            info!("The current directory is {:?}", cwd);

            let mut options = RunOptions::new(statement)
                .ignore_errors(*ignore_errors)
                .ignore_pipe_errors(*ignore_pipe_errors);
            if let Some(memory) = job_memory {
                options = options.job_memory(memory);
            }
            if let Some(threads) = job_threads {
                options = options.job_threads(*threads);
            }
            if let Some(job_options) = job_options {
                options = options.job_options(job_options);
            }
            if let Some(queue) = job_queue {
                options = options.job_queue(queue);
            }
            if let Some(array) = job_array {
                if let [start, end, step] = array.as_slice() {
                    options = options.job_array(*start, *end, *step);
                }
            }
            if let Some(outfile) = outfile {
                options = options.outfile(outfile);
            }

            let mut config = RunConfig::new(cwd, params).dryrun(args.dry_run).without_cluster(args.local);
            let session = if args.local || args.dry_run {
                None
            } else {
                let kind = match args.cluster {
                    ClusterKind::Sge => SessionKind::Sge,
                    ClusterKind::Local => SessionKind::Local,
                };
                Some(open_session(kind)?)
            };
            if let Some(session) = &session {
                config = config.with_session(session.clone());
            }

            let result = run(&config, options).await;
            if let Some(session) = session {
                if let Err(e) = session.exit().await {
                    warn!("could not close {} session: {}", session.name(), e);
                }
            }
            result
        }
    }
}
