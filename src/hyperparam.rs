use crate::error::{HarnessError, Result};
use crate::layout::RepeatLayout;
use crate::param::{Param, SelectionPolicy};
use crate::solver::{Algorithm, SelectionSolver, SolveRequest};
use crate::stability::consistency_index_k;
use crate::utils;
use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One grid point: `-l <lambda> -e <eta> [-m <mu>]`.
///
/// Equality, hashing and ordering use the numeric values; the text is kept so the
/// parameters file holds the string exactly as the grid gave it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hyperparameters {
    pub lambda: OrderedFloat<f64>,
    pub eta: OrderedFloat<f64>,
    pub mu: Option<OrderedFloat<f64>>,
    text: String,
}

impl Hyperparameters {
    fn key(&self) -> (OrderedFloat<f64>, OrderedFloat<f64>, Option<OrderedFloat<f64>>) {
        (self.lambda, self.eta, self.mu)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Flags as separate command line arguments
    pub fn to_args(&self) -> Vec<String> {
        self.text.split_whitespace().map(String::from).collect()
    }

    /// Same point without its `-m <mu>` pair (single-task grid derived from a multitask one)
    pub fn without_mu(&self) -> Hyperparameters {
        let tokens: Vec<&str> = self.text.split_whitespace().collect();
        let mut kept = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            if tokens[i] == "-m" {
                i += 2;
                continue;
            }
            kept.push(tokens[i]);
            i += 1;
        }
        Hyperparameters {
            lambda: self.lambda,
            eta: self.eta,
            mu: None,
            text: kept.join(" "),
        }
    }
}

impl FromStr for Hyperparameters {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() % 2 != 0 {
            return Err(format!("'{}' is not a list of '-flag value' pairs", s));
        }

        let mut lambda = None;
        let mut eta = None;
        let mut mu = None;
        for pair in tokens.chunks(2) {
            let value: f64 = pair[1]
                .parse()
                .map_err(|_| format!("'{}' is not a number in '{}'", pair[1], s))?;
            match pair[0] {
                "-l" => lambda = Some(OrderedFloat(value)),
                "-e" => eta = Some(OrderedFloat(value)),
                "-m" => mu = Some(OrderedFloat(value)),
                flag => return Err(format!("unknown flag '{}' in '{}'", flag, s)),
            }
        }

        match (lambda, eta) {
            (Some(lambda), Some(eta)) => Ok(Hyperparameters {
                lambda,
                eta,
                mu,
                text: tokens.join(" "),
            }),
            _ => Err(format!("'{}' needs both -l and -e", s)),
        }
    }
}

impl TryFrom<String> for Hyperparameters {
    type Error = String;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Hyperparameters> for String {
    fn from(params: Hyperparameters) -> String {
        params.text
    }
}

impl std::fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl PartialEq for Hyperparameters {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Hyperparameters {}

impl Hash for Hyperparameters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Hyperparameters {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hyperparameters {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Parses grid lines, skipping blank lines and duplicated points (first one kept)
pub fn parse_grid(lines: &[String], origin: &Path) -> Result<Vec<Hyperparameters>> {
    let mut grid: Vec<Hyperparameters> = Vec::new();
    for (line_idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let point: Hyperparameters = line.parse().map_err(|detail| HarnessError::Parse {
            path: origin.to_path_buf(),
            line: line_idx + 1,
            detail,
        })?;
        if grid.contains(&point) {
            warn!("Grid point '{}' given twice, keeping the first one", point);
            continue;
        }
        grid.push(point);
    }
    Ok(grid)
}

pub fn load_grid(path: &Path) -> Result<Vec<Hyperparameters>> {
    let content = utils::read_string(path)?;
    let lines: Vec<String> = content.lines().map(String::from).collect();
    parse_grid(&lines, path)
}

/// Hyperparameter grids of the three algorithms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSet {
    pub single_task: Vec<Hyperparameters>,
    pub no_precision: Vec<Hyperparameters>,
    pub precision: Vec<Hyperparameters>,
}

impl GridSet {
    /// Inline grids win over grid files; a missing single-task grid is derived from the
    /// no-precision one by dropping `-m <mu>`
    pub fn from_param(param: &Param) -> Result<GridSet> {
        let read = |inline: &Vec<String>, file: &str, name: &str| -> Result<Vec<Hyperparameters>> {
            if !inline.is_empty() {
                parse_grid(inline, Path::new(name))
            } else if !file.is_empty() {
                load_grid(Path::new(file))
            } else {
                Ok(Vec::new())
            }
        };

        let grid = &param.grid;
        let no_precision = read(&grid.no_precision, grid.no_precision_file.as_str(), "grid.no_precision")?;
        let precision = read(&grid.precision, grid.precision_file.as_str(), "grid.precision")?;
        let mut single_task = read(&grid.single_task, grid.single_task_file.as_str(), "grid.single_task")?;
        if single_task.is_empty() {
            let mut derived: Vec<Hyperparameters> = Vec::new();
            for point in no_precision.iter().map(|p| p.without_mu()) {
                if !derived.contains(&point) {
                    derived.push(point);
                }
            }
            single_task = derived;
        }

        Ok(GridSet { single_task, no_precision, precision })
    }

    pub fn from_lines(single_task: &[String], no_precision: &[String], precision: &[String]) -> Result<GridSet> {
        Ok(GridSet {
            single_task: parse_grid(single_task, Path::new("single_task"))?,
            no_precision: parse_grid(no_precision, Path::new("no_precision"))?,
            precision: parse_grid(precision, Path::new("precision"))?,
        })
    }

    pub fn grid(&self, algorithm: Algorithm) -> &[Hyperparameters] {
        match algorithm {
            Algorithm::SingleTask => &self.single_task,
            Algorithm::MultitaskNoPrecision => &self.no_precision,
            Algorithm::Multitask => &self.precision,
        }
    }

    pub fn to_lines(&self, algorithm: Algorithm) -> Vec<String> {
        self.grid(algorithm).iter().map(|p| p.to_string()).collect()
    }

    /// One grid point per line, as the batch jobs and later analyses read them
    pub fn save(&self, layout: &RepeatLayout) -> Result<()> {
        let write = |path: PathBuf, algorithm: Algorithm| -> Result<()> {
            let mut content = self.to_lines(algorithm).join("\n");
            content.push('\n');
            utils::write_string(&path, &content)
        };
        write(layout.hyperparameters_st(), Algorithm::SingleTask)?;
        write(layout.hyperparameters_np(), Algorithm::MultitaskNoPrecision)?;
        write(layout.hyperparameters(), Algorithm::Multitask)
    }
}

/// Selections collected during the subsample loop of one fold, for one algorithm:
/// grid point -> task -> one selection per subsample
#[derive(Debug, Clone, Default)]
pub struct SelectionArchive {
    num_tasks: usize,
    entries: HashMap<Hyperparameters, Vec<Vec<Vec<usize>>>>,
}

impl SelectionArchive {
    pub fn new(grid: &[Hyperparameters], num_tasks: usize) -> SelectionArchive {
        let entries = grid
            .iter()
            .map(|p| (p.clone(), vec![Vec::new(); num_tasks]))
            .collect();
        SelectionArchive { num_tasks, entries }
    }

    /// Appends one subsample's per-task selections for `params`
    pub fn record(&mut self, params: &Hyperparameters, selections: Vec<Vec<usize>>) {
        let num_tasks = self.num_tasks;
        let per_task = self
            .entries
            .entry(params.clone())
            .or_insert_with(|| vec![Vec::new(); num_tasks]);
        for (task_idx, selection) in selections.into_iter().enumerate().take(num_tasks) {
            per_task[task_idx].push(selection);
        }
    }

    pub fn selections(&self, params: &Hyperparameters, task_idx: usize) -> &[Vec<usize>] {
        self.entries
            .get(params)
            .and_then(|per_task| per_task.get(task_idx))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// k-way consistency index per grid point (grid order) and per task
    pub fn consistency_table(&self, grid: &[Hyperparameters], num_features: usize) -> Vec<Vec<f64>> {
        grid.iter()
            .map(|params| {
                (0..self.num_tasks)
                    .map(|task_idx| {
                        let selections = self.selections(params, task_idx);
                        if selections.len() < 2 {
                            f64::NEG_INFINITY
                        } else {
                            consistency_index_k(selections, num_features)
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

/// Picks the grid point to keep. Ties keep the first point in grid order.
///
/// `global_max` compares every (grid point, task) consistency index at once, so a point
/// can win on a single task.
pub fn optimal_parameters(archive: &SelectionArchive, grid: &[Hyperparameters], num_features: usize, policy: SelectionPolicy) -> Option<(Hyperparameters, f64)> {
    let table = archive.consistency_table(grid, num_features);

    let mut best: Option<(usize, f64)> = None;
    for (grid_idx, per_task) in table.iter().enumerate() {
        debug!("{} -> {:?}", grid[grid_idx], per_task);
        let score = match policy {
            SelectionPolicy::global_max => per_task.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            SelectionPolicy::mean_across_tasks => {
                if per_task.is_empty() {
                    f64::NEG_INFINITY
                } else {
                    per_task.iter().sum::<f64>() / per_task.len() as f64
                }
            }
        };
        match best {
            None => best = Some((grid_idx, score)),
            Some((_, best_score)) if score > best_score => best = Some((grid_idx, score)),
            _ => {}
        }
    }

    best.map(|(grid_idx, score)| (grid[grid_idx].clone(), score))
}

/// Grid search of one algorithm over the subsamples of one fold
pub struct VariantSearch<'g> {
    pub algorithm: Algorithm,
    pub grid: &'g [Hyperparameters],
    pub archive: SelectionArchive,
    pub degenerate_solves: usize,
}

/// Solver inputs shared by every call of a subsample iteration
pub struct SolveContext<'a> {
    pub num_tasks: usize,
    pub network: &'a Path,
    pub precision: &'a Path,
    pub weights: &'a [PathBuf],
}

impl<'g> VariantSearch<'g> {
    pub fn new(algorithm: Algorithm, grid: &'g [Hyperparameters], num_tasks: usize) -> VariantSearch<'g> {
        VariantSearch {
            algorithm,
            grid,
            archive: SelectionArchive::new(grid, num_tasks),
            degenerate_solves: 0,
        }
    }

    /// Runs every grid point on one subsample and records the selections.
    /// Solver measurements are appended to `process_time_file` / `max_rss_file`.
    pub fn run_subsample(&mut self, solver: &dyn SelectionSolver, ctx: &SolveContext, ss_idx: usize, process_time_file: &Path, max_rss_file: &Path) -> Result<()> {
        for params in self.grid {
            debug!("{} | subsample {} | {}", self.algorithm, ss_idx, params);
            let request = SolveRequest {
                algorithm: self.algorithm,
                num_tasks: ctx.num_tasks,
                network: ctx.network,
                weights: ctx.weights,
                precision: Some(ctx.precision),
                params,
            };
            let outcome = solver.invoke(&request)?;
            if outcome.result.is_degenerate() {
                self.degenerate_solves += 1;
                warn!(
                    "\x1b[1;93mreturned selection empty for every task! algo = {} ; param = {} ; subsample = {}\x1b[0m",
                    self.algorithm, params, ss_idx
                );
            }
            self.archive.record(params, outcome.result.into_selections(ctx.num_tasks));

            utils::append_line(process_time_file, &outcome.timing)?;
            utils::append_line(max_rss_file, &outcome.max_rss)?;
        }
        Ok(())
    }

    pub fn finish(&self, num_features: usize, policy: SelectionPolicy) -> Result<Hyperparameters> {
        let (params, score) = optimal_parameters(&self.archive, self.grid, num_features, policy).ok_or_else(|| {
            HarnessError::InvalidConfig(format!("empty hyperparameter grid for {}", self.algorithm))
        })?;
        if self.degenerate_solves > 0 {
            warn!("{}: {} degenerate solves during the search", self.algorithm, self.degenerate_solves);
        }
        info!("opt param {} : {} (consistency {:.3})", self.algorithm, params, score);
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> Hyperparameters {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_hyperparameters() {
        let params = p("-l 5.97e-03 -e 1.60e-02");
        assert_eq!(params.lambda, OrderedFloat(5.97e-3));
        assert_eq!(params.eta, OrderedFloat(1.6e-2));
        assert_eq!(params.mu, None);
        assert_eq!(params.to_string(), "-l 5.97e-03 -e 1.60e-02");

        let params = p("  -l 1   -e 2 -m 3 ");
        assert_eq!(params.mu, Some(OrderedFloat(3.0)));
        assert_eq!(params.to_string(), "-l 1 -e 2 -m 3");
    }

    #[test]
    fn test_parse_hyperparameters_errors() {
        assert!("-l 1".parse::<Hyperparameters>().is_err());
        assert!("-l 1 -e".parse::<Hyperparameters>().is_err());
        assert!("-l 1 -e x".parse::<Hyperparameters>().is_err());
        assert!("-l 1 -e 2 -z 3".parse::<Hyperparameters>().is_err());
    }

    #[test]
    fn test_equality_is_numeric() {
        assert_eq!(p("-l 1e-2 -e 1"), p("-e 1.0 -l 0.01"));
        assert_ne!(p("-l 1 -e 1"), p("-l 1 -e 1 -m 0"));
        assert!(p("-l 1 -e 1") < p("-l 2 -e 0"));
    }

    #[test]
    fn test_serde_keeps_verbatim_text() {
        let params = p("-l 1.00e-02 -e 3 -m 0.5");
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, "\"-l 1.00e-02 -e 3 -m 0.5\"");
        let back: Hyperparameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), params.as_str());
        assert!(serde_json::from_str::<Hyperparameters>("\"-x 1\"").is_err());
    }

    #[test]
    fn test_without_mu() {
        let st = p("-l 2.94e-03 -e 7.65e-03 -m 1.42e-02").without_mu();
        assert_eq!(st.to_string(), "-l 2.94e-03 -e 7.65e-03");
        assert_eq!(st.mu, None);
    }

    #[test]
    fn test_grid_skips_blank_and_duplicates() {
        let lines = vec!["-l 1 -e 1".to_string(), "".to_string(), "-l 1.0 -e 1.0".to_string(), "-l 2 -e 1".to_string()];
        let grid = parse_grid(&lines, Path::new("grid")).unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0].to_string(), "-l 1 -e 1");
    }

    #[test]
    fn test_grid_set_derives_single_task() {
        let mut param = Param::default();
        param.grid.no_precision = vec!["-l 1 -e 1 -m 1".to_string(), "-l 1 -e 1 -m 2".to_string(), "-l 2 -e 1 -m 1".to_string()];
        param.grid.precision = vec!["-l 1 -e 1 -m 1".to_string()];
        let grids = GridSet::from_param(&param).unwrap();
        assert_eq!(grids.single_task.len(), 2);
        assert_eq!(grids.single_task[0].to_string(), "-l 1 -e 1");
        assert_eq!(grids.grid(Algorithm::Multitask).len(), 1);
    }

    #[test]
    fn test_grid_set_reads_files_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let np_file = dir.path().join("np.txt");
        utils::write_string(&np_file, "-l 1 -e 1 -m 1\n-l 3 -e 1 -m 1\n").unwrap();
        let mut param = Param::default();
        param.grid.no_precision_file = np_file.display().to_string();
        param.grid.precision = vec!["-l 5 -e 5 -m 5".to_string()];
        let grids = GridSet::from_param(&param).unwrap();
        assert_eq!(grids.no_precision.len(), 2);

        let layout = RepeatLayout { dir: dir.path().to_path_buf(), simu_id: "simu".to_string() };
        grids.save(&layout).unwrap();
        let reloaded = load_grid(&layout.hyperparameters_np()).unwrap();
        assert_eq!(reloaded, grids.no_precision);
        let st = load_grid(&layout.hyperparameters_st()).unwrap();
        assert_eq!(st, grids.single_task);
    }

    #[test]
    fn test_archive_records_per_task() {
        let grid = vec![p("-l 1 -e 1"), p("-l 2 -e 2")];
        let mut archive = SelectionArchive::new(&grid, 2);
        archive.record(&grid[0], vec![vec![1, 2], vec![3]]);
        archive.record(&grid[0], vec![vec![1], vec![]]);
        assert_eq!(archive.selections(&grid[0], 0), &[vec![1, 2], vec![1]]);
        assert_eq!(archive.selections(&grid[0], 1), &[vec![3], vec![]]);
        assert!(archive.selections(&grid[1], 0).is_empty());
    }

    fn archive_fixture() -> (Vec<Hyperparameters>, SelectionArchive) {
        // point 0: task 0 perfectly stable, task 1 unstable
        // point 1: both tasks fairly stable, never perfect
        let grid = vec![p("-l 1 -e 1"), p("-l 2 -e 2")];
        let mut archive = SelectionArchive::new(&grid, 2);
        archive.record(&grid[0], vec![vec![1, 2, 3], vec![0, 1]]);
        archive.record(&grid[0], vec![vec![1, 2, 3], vec![5, 6]]);
        archive.record(&grid[1], vec![vec![1, 2, 3], vec![0, 1, 2]]);
        archive.record(&grid[1], vec![vec![1, 2, 4], vec![0, 1, 3]]);
        (grid, archive)
    }

    #[test]
    fn test_global_max_policy() {
        let (grid, archive) = archive_fixture();
        let (best, score) = optimal_parameters(&archive, &grid, 20, SelectionPolicy::global_max).unwrap();
        assert_eq!(best, grid[0]);
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean_across_tasks_policy() {
        let (grid, archive) = archive_fixture();
        let (best, _) = optimal_parameters(&archive, &grid, 20, SelectionPolicy::mean_across_tasks).unwrap();
        assert_eq!(best, grid[1]);
    }

    #[test]
    fn test_ties_keep_first_grid_point() {
        let grid = vec![p("-l 3 -e 1"), p("-l 1 -e 1"), p("-l 2 -e 1")];
        let mut archive = SelectionArchive::new(&grid, 1);
        for params in &grid {
            archive.record(params, vec![vec![1, 2]]);
            archive.record(params, vec![vec![1, 2]]);
        }
        let (best, _) = optimal_parameters(&archive, &grid, 10, SelectionPolicy::global_max).unwrap();
        assert_eq!(best, grid[0]);
    }

    #[test]
    fn test_all_degenerate_still_returns_a_grid_point() {
        let grid = vec![p("-l 1 -e 1"), p("-l 2 -e 1")];
        let mut archive = SelectionArchive::new(&grid, 2);
        for params in &grid {
            archive.record(params, vec![vec![], vec![]]);
            archive.record(params, vec![vec![], vec![]]);
        }
        let (best, score) = optimal_parameters(&archive, &grid, 10, SelectionPolicy::global_max).unwrap();
        assert_eq!(best, grid[0]);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_empty_grid() {
        let archive = SelectionArchive::new(&[], 2);
        assert!(optimal_parameters(&archive, &[], 10, SelectionPolicy::global_max).is_none());
    }
}
