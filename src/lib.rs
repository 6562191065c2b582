pub mod aggregate;
pub mod cv;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod fold;
pub mod hyperparam;
pub mod layout;
pub mod param;
pub mod solver;
pub mod stability;
pub mod utils;

use crate::cv::{make_rng, CV};
use crate::data::Dataset;
use crate::error::{HarnessError, Result};
use crate::fold::{FoldRunner, FoldTask};
use crate::hyperparam::GridSet;
use crate::layout::{DataLayout, Measure, ResultLayout};
use crate::param::{ExecutionMode, Param};
use crate::solver::{Algorithm, SelectionSolver};
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs `f` inside a rayon pool of `param.general.thread_number` threads
fn with_pool<T: Send>(param: &Param, f: impl FnOnce() -> Result<T> + Send) -> Result<T> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(param.general.thread_number)
        .build()
        .map_err(|e| HarnessError::InvalidConfig(format!("cannot build a pool of {} threads: {}", param.general.thread_number, e)))?;
    pool.install(f)
}

/// Full sweep: every repeat, every fold, then evaluation and aggregation.
/// In batch mode the folds are submitted and `evaluate` must be called once the jobs are done.
pub fn run(param: &Param, solver: &dyn SelectionSolver) -> Result<()> {
    let start = std::time::Instant::now();
    let results = ResultLayout::new(Path::new(&param.general.resu_dir), &param.general.simu_id);

    if param.general.overwrite_results && results.resu_dir.is_dir() {
        info!("Deleting {}", results.resu_dir.display());
        std::fs::remove_dir_all(&results.resu_dir).map_err(|e| HarnessError::io(&results.resu_dir, e))?;
    }
    utils::create_dir_if_not_exists(&results.resu_dir)?;
    restart_metric_files(&results, &Measure::ALL)?;

    let grids = GridSet::from_param(param)?;
    info!(
        "Grids: {} single-task, {} multitask (no precision), {} multitask points",
        grids.single_task.len(),
        grids.no_precision.len(),
        grids.precision.len()
    );

    let mut rng = make_rng(param.general.seed);
    with_pool(param, || {
        for repeat_idx in 0..param.cv.num_repeats {
            run_repeat(param, &grids, &results, repeat_idx, &mut rng, solver)?;
        }
        Ok(())
    })?;

    match param.execution.mode {
        ExecutionMode::sequential => {
            aggregate::summarize(&results, param.data.num_tasks, param.cv.num_folds, param.cv.num_repeats)?;
        }
        ExecutionMode::batch => {
            info!("Every fold submitted. Run `evaluate` once the jobs are finished.");
        }
    }

    info!("Sweep done in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Removes the append-only metric files of a previous run, so that every file
/// holds exactly one row per repeat of this run
fn restart_metric_files(results: &ResultLayout, measures: &[Measure]) -> Result<()> {
    for algorithm in Algorithm::ALL {
        for &measure in measures {
            let path = results.metric(algorithm, measure);
            if path.is_file() {
                info!("Restarting {}", path.display());
                std::fs::remove_file(&path).map_err(|e| HarnessError::io(&path, e))?;
            }
        }
    }
    Ok(())
}

/// One repeat: partition, fold tasks, then either the sequential fold loop followed by
/// the evaluation, or the batch submission
pub fn run_repeat(param: &Param, grids: &GridSet, results: &ResultLayout, repeat_idx: usize, rng: &mut ChaCha8Rng, solver: &dyn SelectionSolver) -> Result<()> {
    info!("=============== REPEAT {}", repeat_idx);
    let repeat = results.repeat(repeat_idx);
    utils::create_dir_if_not_exists(&repeat.dir)?;
    let data = DataLayout::new(Path::new(&param.data.data_dir), &param.general.simu_id, repeat_idx);

    let cv = CV::new(param.data.num_samples, param.cv.num_folds, param.cv.num_subsamples, param.cv.shuffle_folds, rng);
    cv.save(&repeat)?;
    grids.save(&repeat)?;

    let tasks = fold::fold_tasks(param, grids, &cv, &data, &repeat, results, repeat_idx);

    match param.execution.mode {
        ExecutionMode::sequential => {
            let dataset = Dataset::load(&data, param)?;
            info!("{}", dataset);
            for task in &tasks {
                FoldRunner::new(task, &dataset, solver).run()?;
            }
            evaluation::evaluate_repeat(param, &dataset, &cv, &repeat, results)?;
        }
        ExecutionMode::batch => {
            for task in &tasks {
                let path = repeat.fold_task(task.fold_idx);
                task.save(&path)?;
                submit(&param.execution.submit_command, &path)?;
            }
        }
    }
    Ok(())
}

/// Spawns `command <task_path>` without waiting for it
pub fn submit(command: &[String], task_path: &Path) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| HarnessError::InvalidConfig("empty submit_command".to_string()))?;
    info!("{} {} {}", program, args.join(" "), task_path.display());
    Command::new(program)
        .args(args)
        .arg(task_path)
        .spawn()
        .map_err(|e| HarnessError::io(PathBuf::from(program), e))?;
    Ok(())
}

/// Scores the persisted selections of every repeat and writes the summary
pub fn evaluate(param: &Param) -> Result<()> {
    let results = ResultLayout::new(Path::new(&param.general.resu_dir), &param.general.simu_id);
    restart_metric_files(&results, &Measure::AGGREGATED)?;

    with_pool(param, || {
        for repeat_idx in 0..param.cv.num_repeats {
            let repeat = results.repeat(repeat_idx);
            let data = DataLayout::new(Path::new(&param.data.data_dir), &param.general.simu_id, repeat_idx);
            let cv = CV::load(&repeat, param.cv.num_folds, param.data.num_samples)?;
            let dataset = Dataset::load(&data, param)?;
            evaluation::evaluate_repeat(param, &dataset, &cv, &repeat, &results)?;
        }
        Ok(())
    })?;

    aggregate::summarize(&results, param.data.num_tasks, param.cv.num_folds, param.cv.num_repeats)
}

/// Batch job entry point
pub fn run_fold(task: &FoldTask<'_>, solver: &dyn SelectionSolver) -> Result<()> {
    with_pool(&task.param, || {
        let selections = fold::run_fold_task(task, solver)?;
        for selection in selections.iter().filter(|s| s.degenerate) {
            warn!("{}: degenerate final selection with {}", selection.algorithm, selection.params);
        }
        Ok(())
    })
}
