//! One cross-validation fold:
//! subsample weights -> hyperparameter search (x3 algorithms) -> parameters files ->
//! final fit on the whole train fold -> timing, memory and selection files.

use crate::cv::{FoldIndices, CV};
use crate::data::{Dataset, WeightFiles};
use crate::error::{HarnessError, Result};
use crate::hyperparam::{GridSet, Hyperparameters, SolveContext, VariantSearch};
use crate::layout::{DataLayout, Measure, RepeatLayout, ResultLayout};
use crate::param::{ParameterSource, Param};
use crate::solver::{Algorithm, SelectionSolver, SolveRequest};
use crate::utils;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;

/// Everything one fold needs. The sequential coordinator borrows the repeat's partition,
/// grids and configuration; the batch mode writes the same task as JSON and a `run-fold`
/// job reads back an owned copy, so both paths see the same inputs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FoldTask<'a> {
    pub repeat_idx: usize,
    pub fold_idx: usize,
    pub indices: Cow<'a, FoldIndices>,
    pub grids: Cow<'a, GridSet>,
    pub data: Cow<'a, DataLayout>,
    pub repeat: Cow<'a, RepeatLayout>,
    pub results: Cow<'a, ResultLayout>,
    pub param: Cow<'a, Param>,
}

impl FoldTask<'_> {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        utils::write_string(path, &json)
    }

    pub fn load(path: &Path) -> Result<FoldTask<'static>> {
        let json = utils::read_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// One task per fold of `cv`, borrowing everything from the repeat
pub fn fold_tasks<'a>(param: &'a Param, grids: &'a GridSet, cv: &'a CV, data: &'a DataLayout, repeat: &'a RepeatLayout, results: &'a ResultLayout, repeat_idx: usize) -> Vec<FoldTask<'a>> {
    cv.folds
        .iter()
        .enumerate()
        .map(|(fold_idx, indices)| FoldTask {
            repeat_idx,
            fold_idx,
            indices: Cow::Borrowed(indices),
            grids: Cow::Borrowed(grids),
            data: Cow::Borrowed(data),
            repeat: Cow::Borrowed(repeat),
            results: Cow::Borrowed(results),
            param: Cow::Borrowed(param),
        })
        .collect()
}

/// What the fold produced for one algorithm
#[derive(Clone, Debug, PartialEq)]
pub struct FoldSelection {
    pub algorithm: Algorithm,
    pub params: Hyperparameters,
    pub selections: Vec<Vec<usize>>,
    pub degenerate: bool,
}

pub struct FoldRunner<'a> {
    task: &'a FoldTask<'a>,
    dataset: &'a Dataset,
    solver: &'a dyn SelectionSolver,
}

impl<'a> FoldRunner<'a> {
    pub fn new(task: &'a FoldTask<'a>, dataset: &'a Dataset, solver: &'a dyn SelectionSolver) -> FoldRunner<'a> {
        FoldRunner { task, dataset, solver }
    }

    fn num_tasks(&self) -> usize {
        self.task.param.data.num_tasks
    }

    pub fn run(&self) -> Result<Vec<FoldSelection>> {
        let time = Instant::now();
        info!("Repeat {} | fold {}: {} train, {} test samples", self.task.repeat_idx, self.task.fold_idx, self.task.indices.train.len(), self.task.indices.test.len());

        let optimal = match self.task.param.search.parameters {
            ParameterSource::search => self.search()?,
            ParameterSource::reuse => self.reuse_parameters()?,
            ParameterSource::fixed => self.fixed_parameters()?,
        };
        self.persist_parameters(&optimal)?;

        let selections = self.final_fit(optimal)?;
        self.persist_selections(&selections)?;

        info!("Repeat {} | fold {} done in {:.2}s", self.task.repeat_idx, self.task.fold_idx, time.elapsed().as_secs_f64());
        Ok(selections)
    }

    /// Stability driven grid search of the three algorithms over the fold's subsamples.
    /// Weight files of a subsample are dropped before the next subsample starts.
    fn search(&self) -> Result<Vec<(Algorithm, Hyperparameters)>> {
        let layout = &self.task.repeat;
        let tmp_dir = self.task.param.tmp_dir();
        let mut searches: Vec<VariantSearch> = Algorithm::ALL
            .iter()
            .map(|&algorithm| VariantSearch::new(algorithm, self.task.grids.grid(algorithm), self.num_tasks()))
            .collect();

        for (ss_idx, subsample) in self.task.indices.subsamples.iter().enumerate() {
            debug!("Fold {} | subsample {} ({} samples)", self.task.fold_idx, ss_idx, subsample.len());
            let weights = WeightFiles::create(self.dataset, subsample, &tmp_dir)?;
            let ctx = SolveContext {
                num_tasks: self.num_tasks(),
                network: &self.dataset.network,
                precision: &self.dataset.task_similarities,
                weights: weights.paths(),
            };

            searches.par_iter_mut().try_for_each(|search| {
                let algorithm = search.algorithm;
                search.run_subsample(
                    self.solver,
                    &ctx,
                    ss_idx,
                    &layout.subsample_process_time(algorithm, self.task.fold_idx),
                    &layout.subsample_max_rss(algorithm, self.task.fold_idx),
                )
            })?;
            drop(weights);
        }

        searches
            .iter()
            .map(|search| {
                let params = search.finish(self.task.param.data.num_features, self.task.param.search.policy)?;
                Ok((search.algorithm, params))
            })
            .collect()
    }

    /// Parameters a previous run persisted for this fold
    fn reuse_parameters(&self) -> Result<Vec<(Algorithm, Hyperparameters)>> {
        Algorithm::ALL
            .iter()
            .map(|&algorithm| {
                let path = self.task.repeat.parameters(algorithm, self.task.fold_idx);
                let text = utils::read_string(&path)?;
                let line = text.lines().next().unwrap_or("");
                let params: Hyperparameters = line.parse().map_err(|detail| HarnessError::Parse {
                    path: path.clone(),
                    line: 1,
                    detail,
                })?;
                info!("{}: reusing {}", algorithm, params);
                Ok((algorithm, params))
            })
            .collect()
    }

    fn fixed_parameters(&self) -> Result<Vec<(Algorithm, Hyperparameters)>> {
        let search = &self.task.param.search;
        Algorithm::ALL
            .iter()
            .map(|&algorithm| {
                let text = match algorithm {
                    Algorithm::SingleTask => &search.fixed_single_task,
                    Algorithm::MultitaskNoPrecision => &search.fixed_no_precision,
                    Algorithm::Multitask => &search.fixed_precision,
                };
                let params: Hyperparameters = text.parse().map_err(|detail| {
                    HarnessError::InvalidConfig(format!("search.fixed parameters of {}: {}", algorithm, detail))
                })?;
                Ok((algorithm, params))
            })
            .collect()
    }

    fn persist_parameters(&self, optimal: &[(Algorithm, Hyperparameters)]) -> Result<()> {
        if self.task.param.search.parameters == ParameterSource::reuse {
            return Ok(());
        }
        for (algorithm, params) in optimal {
            let path = self.task.repeat.parameters(*algorithm, self.task.fold_idx);
            utils::write_string(&path, &format!("{}\n", params))?;
        }
        Ok(())
    }

    /// Runs every algorithm once more with its optimal parameters, on weights computed from
    /// the whole train fold
    fn final_fit(&self, optimal: Vec<(Algorithm, Hyperparameters)>) -> Result<Vec<FoldSelection>> {
        let weights = WeightFiles::create(self.dataset, &self.task.indices.train, &self.task.param.tmp_dir())?;
        let num_tasks = self.num_tasks();

        let selections = optimal
            .into_par_iter()
            .map(|(algorithm, params)| {
                let request = SolveRequest {
                    algorithm,
                    num_tasks,
                    network: &self.dataset.network,
                    weights: weights.paths(),
                    precision: Some(self.dataset.task_similarities.as_path()),
                    params: &params,
                };
                let outcome = self.solver.invoke(&request)?;
                let degenerate = outcome.result.is_degenerate();
                if degenerate {
                    warn!(
                        "\x1b[1;93mfinal selection empty for every task! algo = {} ; param = {} ; fold = {}\x1b[0m",
                        algorithm, params, self.task.fold_idx
                    );
                }

                let results = &self.task.results;
                utils::append_line(&results.metric(algorithm, Measure::Timing), &outcome.timing)?;
                utils::append_line(&results.metric(algorithm, Measure::MaxRss), &outcome.max_rss)?;

                Ok(FoldSelection {
                    algorithm,
                    selections: outcome.result.into_selections(num_tasks),
                    params,
                    degenerate,
                })
            })
            .collect::<Result<Vec<_>>>();

        drop(weights);
        selections
    }

    fn persist_selections(&self, selections: &[FoldSelection]) -> Result<()> {
        for selection in selections {
            let path = self.task.repeat.selected_features(selection.algorithm, self.task.fold_idx);
            utils::write_lines(&path, &selection.selections)?;
        }
        Ok(())
    }
}

/// Entry point of a batch job: loads the repeat's data, then runs the fold
pub fn run_fold_task(task: &FoldTask<'_>, solver: &dyn SelectionSolver) -> Result<Vec<FoldSelection>> {
    let dataset = Dataset::load(&task.data, &task.param)?;
    FoldRunner::new(task, &dataset, solver).run()
}
