//! Kuncheva's consistency index.
//!
//! Kuncheva, L.I. (2007). A Stability Index for Feature Selection. AIAC, pp. 390--395.

use crate::error::Result;
use crate::utils;
use std::collections::HashSet;
use std::path::PathBuf;

/// Consistency index between two sets of selected features.
///
/// Returns 0 when `min(|a|, |b|)` equals the expected overlap: taking every feature or
/// taking none are trivial solutions that must not be rewarded.
pub fn consistency_index(sel_a: &HashSet<usize>, sel_b: &HashSet<usize>, num_features: usize) -> f64 {
    let observed = sel_a.intersection(sel_b).count() as f64;
    let expected = (sel_a.len() * sel_b.len()) as f64 / num_features as f64;
    let maxposbl = sel_a.len().min(sel_b.len()) as f64;

    if expected != maxposbl {
        (observed - expected) / (maxposbl - expected)
    } else {
        0.0
    }
}

/// Average pairwise consistency index over all unordered pairs of selections.
///
/// Callers must pass at least 2 selections.
pub fn consistency_index_k(selections: &[Vec<usize>], num_features: usize) -> f64 {
    debug_assert!(selections.len() >= 2, "consistency_index_k needs at least 2 selections");
    let sets: Vec<HashSet<usize>> = selections.iter().map(|s| s.iter().copied().collect()).collect();

    let k = sets.len();
    let mut cidx = 0.0;
    for i in 0..k {
        for j in (i + 1)..k {
            cidx += consistency_index(&sets[i], &sets[j], num_features);
        }
    }
    2.0 / (k * (k - 1)) as f64 * cidx
}

/// Per task, the consistency index between the selections of every fold.
///
/// `fold_files` holds one selected-features file per fold, one line per task.
/// A task line missing from a file counts as an empty selection; extra lines or
/// indices of `num_features` or more are parse errors.
pub fn consistency_index_task(fold_files: &[PathBuf], num_tasks: usize, num_features: usize) -> Result<Vec<f64>> {
    let per_fold = fold_files
        .iter()
        .map(|path| utils::read_selections(path, num_tasks, num_features))
        .collect::<Result<Vec<_>>>()?;

    let ci_list = (0..num_tasks)
        .map(|task_idx| {
            let sel_list: Vec<Vec<usize>> = per_fold
                .iter()
                .map(|lines| lines[task_idx].clone())
                .collect();
            consistency_index_k(&sel_list, num_features)
        })
        .collect();

    Ok(ci_list)
}
