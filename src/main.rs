use chrono::Local;
use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle};
use log::{error, info};
use sfan_bench::fold::FoldTask;
use sfan_bench::param::{self, Param};
use sfan_bench::solver::ProcessSolver;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "sfan-bench", version, about = "Nested cross-validation benchmark of sfan feature selection")]
struct Cli {
    /// YAML run configuration
    #[arg(short, long, default_value = "param.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every repeat (default)
    Run,
    /// Run one fold serialized by the batch mode
    RunFold {
        /// `<simu>.fold_<k>.task.json` written by `run`
        task: PathBuf,
    },
    /// Score finished folds and write the summary
    Evaluate,
}

fn init_logger(param: &Param) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(&param.general.log_level)?;
    if param.general.log_base.is_empty() {
        return logger.start();
    }

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let base = Path::new(&param.general.log_base);
    let basename = base.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let mut spec = FileSpec::default()
        .basename(format!("{}_{}", basename, timestamp))
        .suffix(&param.general.log_suffix)
        .suppress_timestamp();
    if let Some(dir) = base.parent().filter(|d| !d.as_os_str().is_empty()) {
        spec = spec.directory(dir);
    }

    logger.log_to_file(spec).duplicate_to_stdout(Duplicate::All).start()
}

fn fail(message: String) -> ! {
    error!("{}", message);
    eprintln!("{}", message);
    process::exit(1)
}

fn main() {
    let cli = Cli::parse();

    let (param, task) = match &cli.command {
        Some(Commands::RunFold { task }) => match FoldTask::load(task) {
            Ok(task) => (task.param.as_ref().clone(), Some(task)),
            Err(e) => fail(format!("{}", e)),
        },
        _ => match param::get(&cli.config) {
            Ok(param) => (param, None),
            Err(e) => fail(format!("{}", e)),
        },
    };

    let _logger = match init_logger(&param) {
        Ok(handle) => handle,
        Err(e) => fail(format!("cannot start logger: {}", e)),
    };
    info!("sfan-bench v{}#{}", env!("CARGO_PKG_VERSION"), env!("SFAN_BENCH_GIT_SHA"));

    let solver = ProcessSolver::new(&param);
    let outcome = match (cli.command, task) {
        (Some(Commands::RunFold { .. }), Some(task)) => sfan_bench::run_fold(&task, &solver),
        (Some(Commands::Evaluate), _) => sfan_bench::evaluate(&param),
        _ => sfan_bench::run(&param, &solver),
    };

    if let Err(e) = outcome {
        fail(format!("{}", e));
    }
    info!("THE END");
}
