//! Boundary with the external feature-selection solver.
//!
//! The harness only sees `SelectionSolver::invoke`; how the selection is obtained (a
//! subprocess whose standard output is parsed at a fixed line offset, or anything else)
//! stays behind this trait.

use crate::error::{HarnessError, Result};
use crate::hyperparam::Hyperparameters;
use crate::param::Param;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;

/// The three solver variants compared by the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algorithm {
    /// each task solved on its own
    SingleTask,
    /// multitask, without task-similarity prior
    MultitaskNoPrecision,
    /// multitask, with the precision (task-similarity) matrix
    Multitask,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::SingleTask, Algorithm::MultitaskNoPrecision, Algorithm::Multitask];

    /// Name used in every file of the results tree
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::SingleTask => "sfan",
            Algorithm::MultitaskNoPrecision => "msfan_np",
            Algorithm::Multitask => "msfan",
        }
    }

    pub fn uses_precision(&self) -> bool {
        matches!(self, Algorithm::Multitask)
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Inputs of one solver call
#[derive(Debug, Clone)]
pub struct SolveRequest<'a> {
    pub algorithm: Algorithm,
    pub num_tasks: usize,
    pub network: &'a Path,
    /// one node-weight file per task
    pub weights: &'a [PathBuf],
    /// task-similarity matrix, only read by `Algorithm::Multitask`
    pub precision: Option<&'a Path>,
    pub params: &'a Hyperparameters,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveResult {
    /// one selection (0-based feature indices) per task
    Selected(Vec<Vec<usize>>),
    /// the solver returned nothing for every task at these hyperparameters
    Degenerate,
}

impl SolveResult {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, SolveResult::Degenerate)
    }

    /// Per task selections, an explicit empty placeholder for each task when degenerate
    pub fn into_selections(self, num_tasks: usize) -> Vec<Vec<usize>> {
        match self {
            SolveResult::Selected(selections) => selections,
            SolveResult::Degenerate => vec![Vec::new(); num_tasks],
        }
    }
}

/// Result of one call with the opaque measurements forwarded to persistence
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub result: SolveResult,
    /// elapsed wall time, seconds
    pub timing: String,
    /// peak resident memory of the solver process, kilobytes
    pub max_rss: String,
}

pub trait SelectionSolver: Sync {
    /// Blocking call; returns once the solver is done
    fn invoke(&self, request: &SolveRequest) -> Result<SolveOutcome>;
}

/// Turns the captured standard output into per-task selections.
///
/// Selections start at line `offset` and span `num_tasks` lines of whitespace separated
/// 1-based indices. Lines missing at the end of the output count as empty selections.
pub fn parse_selections(stdout: &str, offset: usize, num_tasks: usize, num_features: usize, algorithm: Algorithm) -> Result<SolveResult> {
    let lines: Vec<&str> = stdout.split('\n').collect();

    let mut selections = Vec::with_capacity(num_tasks);
    for task_idx in 0..num_tasks {
        let line = lines.get(offset + task_idx).copied().unwrap_or("");
        let mut selection = Vec::new();
        for token in line.split_whitespace() {
            let one_based: usize = token.parse().map_err(|_| HarnessError::Solver {
                algorithm: algorithm.to_string(),
                detail: format!("task {}: '{}' is not a feature index", task_idx, token),
            })?;
            if one_based == 0 || one_based > num_features {
                return Err(HarnessError::Solver {
                    algorithm: algorithm.to_string(),
                    detail: format!("task {}: feature {} outside 1..={}", task_idx, one_based, num_features),
                });
            }
            selection.push(one_based - 1);
        }
        selections.push(selection);
    }

    if selections.iter().all(|s| s.is_empty()) {
        Ok(SolveResult::Degenerate)
    } else {
        Ok(SolveResult::Selected(selections))
    }
}

/// Runs the solver as an external program and reads its standard output
#[derive(Debug, Clone)]
pub struct ProcessSolver {
    pub program: String,
    pub args: Vec<String>,
    pub single_task_offset: usize,
    pub multitask_offset: usize,
    pub num_features: usize,
}

impl ProcessSolver {
    pub fn new(param: &Param) -> ProcessSolver {
        ProcessSolver {
            program: param.solver.program.clone(),
            args: param.solver.args.clone(),
            single_task_offset: param.solver.single_task_offset,
            multitask_offset: param.solver.multitask_offset,
            num_features: param.data.num_features,
        }
    }

    fn offset(&self, algorithm: Algorithm) -> usize {
        match algorithm {
            Algorithm::SingleTask => self.single_task_offset,
            _ => self.multitask_offset,
        }
    }

    pub fn command_args(&self, request: &SolveRequest) -> Vec<String> {
        let mut argum = self.args.clone();
        argum.push("--num_tasks".to_string());
        argum.push(request.num_tasks.to_string());
        argum.push("--networks".to_string());
        argum.push(request.network.display().to_string());
        argum.push("--node_weights".to_string());
        argum.extend(request.weights.iter().map(|w| w.display().to_string()));

        if request.algorithm.uses_precision() {
            if let Some(precision) = request.precision {
                argum.push("--precision_matrix".to_string());
                argum.push(precision.display().to_string());
            }
        }

        argum.extend(request.params.to_args());
        if request.algorithm == Algorithm::SingleTask && request.params.mu.is_none() {
            argum.push("-m".to_string());
            argum.push("0".to_string());
        }
        argum
    }
}

impl SelectionSolver for ProcessSolver {
    fn invoke(&self, request: &SolveRequest) -> Result<SolveOutcome> {
        if request.algorithm.uses_precision() && request.precision.is_none() {
            return Err(HarnessError::Solver {
                algorithm: request.algorithm.to_string(),
                detail: "no precision matrix given".to_string(),
            });
        }

        let argum = self.command_args(request);
        debug!("{} {}", self.program, argum.join(" "));

        let solver_error = |detail: String| HarnessError::Solver {
            algorithm: request.algorithm.to_string(),
            detail,
        };

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&argum)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| solver_error(format!("cannot launch {}: {}", self.program, e)))?;

        let mut raw = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_end(&mut raw)
                .map_err(|e| solver_error(format!("cannot read output: {}", e)))?;
        }
        let (status, max_rss) = wait_with_max_rss(&mut child).map_err(|e| solver_error(format!("wait failed: {}", e)))?;
        let elapsed = start.elapsed().as_secs_f64();

        if !status.success() {
            warn!("{} exited with {} (params {})", request.algorithm, status, request.params);
        }

        let stdout = String::from_utf8_lossy(&raw);
        let result = parse_selections(&stdout, self.offset(request.algorithm), request.num_tasks, self.num_features, request.algorithm)?;

        Ok(SolveOutcome {
            result,
            timing: format!("{:.3}", elapsed),
            max_rss: max_rss.map(|kb| kb.to_string()).unwrap_or_else(|| "NA".to_string()),
        })
    }
}

/// Reaps the child with `wait4` to read its own resource usage (`ru_maxrss`, kilobytes on Linux)
#[cfg(unix)]
fn wait_with_max_rss(child: &mut Child) -> std::io::Result<(ExitStatus, Option<i64>)> {
    use std::os::unix::process::ExitStatusExt;

    let pid = child.id() as libc::pid_t;
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is a plain C struct for which all-zero is a valid value
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok((ExitStatus::from_raw(status), Some(usage.ru_maxrss as i64)))
}

#[cfg(not(unix))]
fn wait_with_max_rss(child: &mut Child) -> std::io::Result<(ExitStatus, Option<i64>)> {
    Ok((child.wait()?, None))
}
