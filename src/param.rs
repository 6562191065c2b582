use crate::error::{HarnessError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

/// Where the optimal hyperparameters of a fold come from
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum ParameterSource {
    /// stability-driven grid search over the subsamples
    search,
    /// read the `.parameters` files persisted by a previous run (timing experiments)
    reuse,
    /// use the `search.fixed_*` strings as they are
    fixed,
}

/// How a grid point is elected once every consistency index is known
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum SelectionPolicy {
    /// highest consistency index over all grid points and all tasks combined
    global_max,
    /// highest mean (over tasks) consistency index
    mean_across_tasks,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum ExecutionMode {
    sequential,
    batch,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub cv: CV,
    #[serde(default)]
    pub solver: Solver,
    #[serde(default)]
    pub grid: Grid,
    #[serde(default)]
    pub search: Search,
    #[serde(default)]
    pub ridge: Ridge,
    #[serde(default)]
    pub execution: Execution,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "simu_id_default")]
    pub simu_id: String,
    #[serde(default = "resu_dir_default")]
    pub resu_dir: String,
    #[serde(default = "empty_string")]
    pub tmp_dir: String,
    #[serde(default = "one_default")]
    pub thread_number: usize,
    #[serde(default = "false_default")]
    pub overwrite_results: bool,
    #[serde(default = "empty_string")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "data_dir_default")]
    pub data_dir: String,
    #[serde(default = "num_tasks_default")]
    pub num_tasks: usize,
    #[serde(default = "num_features_default")]
    pub num_features: usize,
    #[serde(default = "num_samples_default")]
    pub num_samples: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CV {
    #[serde(default = "repeats_default")]
    pub num_repeats: usize,
    #[serde(default = "folds_default")]
    pub num_folds: usize,
    #[serde(default = "subsamples_default")]
    pub num_subsamples: usize,
    #[serde(default = "false_default")]
    pub shuffle_folds: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Solver {
    #[serde(default = "solver_program_default")]
    pub program: String,
    #[serde(default = "solver_args_default")]
    pub args: Vec<String>,
    #[serde(default = "single_task_offset_default")]
    pub single_task_offset: usize,
    #[serde(default = "multitask_offset_default")]
    pub multitask_offset: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Grid {
    #[serde(default)]
    pub single_task: Vec<String>,
    #[serde(default)]
    pub no_precision: Vec<String>,
    #[serde(default)]
    pub precision: Vec<String>,
    #[serde(default = "empty_string")]
    pub single_task_file: String,
    #[serde(default = "empty_string")]
    pub no_precision_file: String,
    #[serde(default = "empty_string")]
    pub precision_file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Search {
    #[serde(default = "parameter_source_default")]
    pub parameters: ParameterSource,
    #[serde(default = "policy_default")]
    pub policy: SelectionPolicy,
    #[serde(default = "empty_string")]
    pub fixed_single_task: String,
    #[serde(default = "empty_string")]
    pub fixed_no_precision: String,
    #[serde(default = "empty_string")]
    pub fixed_precision: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Ridge {
    #[serde(default = "alphas_default")]
    pub alphas: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Execution {
    #[serde(default = "execution_mode_default")]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub submit_command: Vec<String>,
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        General {
            seed: None,
            simu_id: simu_id_default(),
            resu_dir: resu_dir_default(),
            tmp_dir: empty_string(),
            thread_number: one_default(),
            overwrite_results: false_default(),
            log_base: empty_string(),
            log_suffix: log_suffix_default(),
            log_level: log_level_default(),
        }
    }
}

impl Default for Data {
    fn default() -> Self {
        Data {
            data_dir: data_dir_default(),
            num_tasks: num_tasks_default(),
            num_features: num_features_default(),
            num_samples: num_samples_default(),
        }
    }
}

impl Default for CV {
    fn default() -> Self {
        CV {
            num_repeats: repeats_default(),
            num_folds: folds_default(),
            num_subsamples: subsamples_default(),
            shuffle_folds: false_default(),
        }
    }
}

impl Default for Solver {
    fn default() -> Self {
        Solver {
            program: solver_program_default(),
            args: solver_args_default(),
            single_task_offset: single_task_offset_default(),
            multitask_offset: multitask_offset_default(),
        }
    }
}

impl Default for Grid {
    fn default() -> Self {
        Grid {
            single_task: Vec::new(),
            no_precision: Vec::new(),
            precision: Vec::new(),
            single_task_file: empty_string(),
            no_precision_file: empty_string(),
            precision_file: empty_string(),
        }
    }
}

impl Default for Search {
    fn default() -> Self {
        Search {
            parameters: parameter_source_default(),
            policy: policy_default(),
            fixed_single_task: empty_string(),
            fixed_no_precision: empty_string(),
            fixed_precision: empty_string(),
        }
    }
}

impl Default for Ridge {
    fn default() -> Self {
        Ridge { alphas: alphas_default() }
    }
}

impl Default for Execution {
    fn default() -> Self {
        Execution {
            mode: execution_mode_default(),
            submit_command: Vec::new(),
        }
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tmp_dir(&self) -> PathBuf {
        if self.general.tmp_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.general.tmp_dir)
        }
    }
}

pub fn get(param_file: &str) -> Result<Param> {
    let param_file_reader = File::open(param_file).map_err(|e| HarnessError::io(param_file, e))?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

/// Input-integrity checks, all of them run before any work starts
pub fn validate(param: &mut Param) -> Result<()> {
    let invalid = |msg: String| Err(HarnessError::InvalidConfig(msg));

    if param.data.num_tasks < 1 {
        return invalid("There must be at least one task specified.".to_string());
    }
    if param.data.num_features < 1 {
        return invalid("The number of features must be strictly positive.".to_string());
    }
    if param.data.num_samples == 0 {
        return invalid("The number of samples must be strictly positive.".to_string());
    }
    if param.cv.num_repeats == 0 {
        return invalid("The number of repeats must be strictly positive.".to_string());
    }
    if param.cv.num_folds < 2 {
        return invalid(format!(
            "Invalid num_folds={}. At least 2 cross-validation folds are needed.",
            param.cv.num_folds
        ));
    }
    if param.cv.num_folds > param.data.num_samples {
        return invalid(format!(
            "Invalid num_folds={}. Cannot exceed num_samples={}.",
            param.cv.num_folds, param.data.num_samples
        ));
    }
    if param.cv.num_subsamples < 2 {
        return invalid(format!(
            "Invalid num_subsamples={}. Stability needs at least 2 subsamples.",
            param.cv.num_subsamples
        ));
    }
    if param.general.thread_number == 0 {
        param.general.thread_number = 1;
    }
    if param.general.simu_id.is_empty() {
        return invalid("simu_id cannot be empty.".to_string());
    }

    if param.ridge.alphas.is_empty() || param.ridge.alphas.iter().any(|a| !(*a > 0.0)) {
        return invalid(format!(
            "Invalid ridge alphas {:?}. They must be non-empty and strictly positive.",
            param.ridge.alphas
        ));
    }

    match param.search.parameters {
        ParameterSource::search => {
            if param.grid.no_precision.is_empty() && param.grid.no_precision_file.is_empty() {
                return invalid("No grid given for the multitask (no precision) solver.".to_string());
            }
            if param.grid.precision.is_empty() && param.grid.precision_file.is_empty() {
                return invalid("No grid given for the multitask (precision) solver.".to_string());
            }
        }
        ParameterSource::fixed => {
            if param.search.fixed_single_task.trim().is_empty()
                || param.search.fixed_no_precision.trim().is_empty()
                || param.search.fixed_precision.trim().is_empty()
            {
                return invalid("Fixed parameters must be given for the three algorithms.".to_string());
            }
        }
        ParameterSource::reuse => {
            if param.general.overwrite_results {
                return invalid(
                    "overwrite_results=true would delete the parameters to reuse.".to_string(),
                );
            }
        }
    }

    if param.execution.mode == ExecutionMode::batch && param.execution.submit_command.is_empty() {
        return invalid("Batch mode needs a submit_command.".to_string());
    }

    if param.general.seed.is_none() {
        warn!("No seed given: folds and subsamples will not be reproducible.");
    }

    Ok(())
}

// Default value definitions

fn empty_string() -> String {
    "".to_string()
}
fn simu_id_default() -> String {
    "simu".to_string()
}
fn data_dir_default() -> String {
    "data".to_string()
}
fn resu_dir_default() -> String {
    "results".to_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn one_default() -> usize {
    1
}
fn false_default() -> bool {
    false
}
fn num_tasks_default() -> usize {
    3
}
fn num_features_default() -> usize {
    200
}
fn num_samples_default() -> usize {
    100
}
fn repeats_default() -> usize {
    10
}
fn folds_default() -> usize {
    10
}
fn subsamples_default() -> usize {
    10
}
fn solver_program_default() -> String {
    "python".to_string()
}
fn solver_args_default() -> Vec<String> {
    vec!["multitask_sfan.py".to_string()]
}
fn single_task_offset_default() -> usize {
    2
}
fn multitask_offset_default() -> usize {
    3
}
fn parameter_source_default() -> ParameterSource {
    ParameterSource::search
}
fn policy_default() -> SelectionPolicy {
    SelectionPolicy::global_max
}
fn alphas_default() -> Vec<f64> {
    vec![0.1, 1.0, 10.0]
}
fn execution_mode_default() -> ExecutionMode {
    ExecutionMode::sequential
}
