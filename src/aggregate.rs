//! Cross-repeat statistics of the metric files.

use crate::error::{HarnessError, Result};
use crate::layout::{Measure, ResultLayout};
use crate::solver::Algorithm;
use crate::utils;
use log::info;
use serde::Serialize;
use std::path::Path;

/// Mean and population standard deviation of one measure, per task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStats {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

/// Reads a metric file as a `repeats x values` table.
///
/// With `num_folds` the rows are fold-major then task-minor and each task is first
/// averaged over its folds (values `task, task + num_tasks, ...`).
pub fn read_metric_table(path: &Path, num_tasks: usize, num_folds: Option<usize>) -> Result<Vec<Vec<f64>>> {
    let rows: Vec<Vec<f64>> = utils::read_lines_of::<f64>(path)?
        .into_iter()
        .filter(|row| !row.is_empty())
        .collect();
    if rows.is_empty() {
        return Err(HarnessError::MetricShape {
            path: path.to_path_buf(),
            row: 0,
            detail: "no repeat recorded".to_string(),
        });
    }

    let expected = num_tasks * num_folds.unwrap_or(1);
    rows.into_iter()
        .enumerate()
        .map(|(row_idx, content)| {
            if content.len() != expected {
                return Err(HarnessError::MetricShape {
                    path: path.to_path_buf(),
                    row: row_idx,
                    detail: format!("{} values, expected {}", content.len(), expected),
                });
            }
            match num_folds {
                None => Ok(content),
                Some(_) => Ok(deinterleave(&content, num_tasks)
                    .iter()
                    .map(|per_fold| per_fold.iter().sum::<f64>() / per_fold.len() as f64)
                    .collect()),
            }
        })
        .collect()
}

/// Splits a fold-major row into one Vec per task
pub fn deinterleave(content: &[f64], num_tasks: usize) -> Vec<Vec<f64>> {
    (0..num_tasks)
        .map(|task_idx| content.iter().skip(task_idx).step_by(num_tasks).copied().collect())
        .collect()
}

/// Column-wise mean and std over the repeats
pub fn column_stats(table: &[Vec<f64>], num_tasks: usize) -> TaskStats {
    let (means, stds) = (0..num_tasks)
        .map(|task_idx| {
            let column: Vec<f64> = table.iter().map(|row| row[task_idx]).collect();
            utils::mean_and_std(&column)
        })
        .unzip();
    TaskStats { means, stds }
}

/// Per-task statistics of one metric file, which must hold exactly one row per repeat
pub fn extract_stats(path: &Path, measure: Measure, num_tasks: usize, num_folds: usize, num_repeats: usize) -> Result<TaskStats> {
    let num_folds = if measure.is_per_fold() { Some(num_folds) } else { None };
    let table = read_metric_table(path, num_tasks, num_folds)?;
    if table.len() != num_repeats {
        return Err(HarnessError::MetricShape {
            path: path.to_path_buf(),
            row: table.len(),
            detail: format!("{} repeats recorded, {} expected", table.len(), num_repeats),
        });
    }
    Ok(column_stats(&table, num_tasks))
}

#[derive(Debug, Serialize)]
struct SummaryRecord<'a> {
    measure: &'a str,
    algorithm: &'a str,
    task: usize,
    mean: f64,
    std: f64,
}

/// Aggregates every metric file and writes the tab separated summary
pub fn summarize(results: &ResultLayout, num_tasks: usize, num_folds: usize, num_repeats: usize) -> Result<()> {
    let path = results.summary();
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(&path)?;

    for measure in Measure::AGGREGATED {
        for algorithm in Algorithm::ALL {
            let stats = extract_stats(&results.metric(algorithm, measure), measure, num_tasks, num_folds, num_repeats)?;
            info!(
                "{:<11} {:<8} mean {} std {}",
                measure.extension(),
                algorithm.name(),
                utils::join(&stats.means.iter().map(|v| format!("{:.4}", v)).collect::<Vec<_>>()),
                utils::join(&stats.stds.iter().map(|v| format!("{:.4}", v)).collect::<Vec<_>>())
            );
            for task in 0..num_tasks {
                writer.serialize(SummaryRecord {
                    measure: measure.extension(),
                    algorithm: algorithm.name(),
                    task,
                    mean: stats.means[task],
                    std: stats.stds[task],
                })?;
            }
        }
    }
    writer.flush().map_err(|e| HarnessError::io(&path, e))?;
    info!("Summary written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave() {
        let tasks = deinterleave(&[0.1, 0.2, 0.3, 0.4], 2);
        assert_eq!(tasks, vec![vec![0.1, 0.3], vec![0.2, 0.4]]);
    }

    #[test]
    fn test_per_task_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simu.sfan.rmse");
        utils::write_string(&path, "1.0 2.0\n3.0 6.0\n").unwrap();
        let stats = extract_stats(&path, Measure::Rmse, 2, 5, 2).unwrap();
        assert_eq!(stats.means, vec![2.0, 4.0]);
        assert!((stats.stds[0] - 1.0).abs() < 1e-12);
        assert!((stats.stds[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_per_fold_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simu.sfan.ppv");
        utils::write_string(&path, "0.1 0.2 0.3 0.4\n0.3 0.2 0.5 0.4\n").unwrap();
        let table = read_metric_table(&path, 2, Some(2)).unwrap();
        assert!((table[0][0] - 0.2).abs() < 1e-12);
        assert!((table[0][1] - 0.3).abs() < 1e-12);
        assert!((table[1][0] - 0.4).abs() < 1e-12);

        let stats = extract_stats(&path, Measure::Ppv, 2, 2, 2).unwrap();
        assert!((stats.means[0] - 0.3).abs() < 1e-12);
        assert!((stats.stds[0] - 0.1).abs() < 1e-12);
        assert!(stats.stds[1].abs() < 1e-12);
    }

    #[test]
    fn test_shape_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        utils::write_string(&path, "0.1 0.2 0.3\n").unwrap();
        assert!(matches!(read_metric_table(&path, 2, None), Err(HarnessError::MetricShape { row: 0, .. })));
        assert!(matches!(read_metric_table(&path, 2, Some(2)), Err(HarnessError::MetricShape { .. })));

        let empty = dir.path().join("empty");
        utils::write_string(&empty, "").unwrap();
        assert!(matches!(read_metric_table(&empty, 2, None), Err(HarnessError::MetricShape { .. })));
        assert!(matches!(
            read_metric_table(&dir.path().join("missing"), 2, None),
            Err(HarnessError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn test_repeat_count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simu.sfan.rmse");
        utils::write_string(&path, "1.0 2.0\n3.0 6.0\n1.0 2.0\n3.0 6.0\n").unwrap();
        assert!(matches!(
            extract_stats(&path, Measure::Rmse, 2, 5, 2),
            Err(HarnessError::MetricShape { row: 4, .. })
        ));
        assert!(matches!(extract_stats(&path, Measure::Rmse, 2, 5, 5), Err(HarnessError::MetricShape { .. })));
        assert!(extract_stats(&path, Measure::Rmse, 2, 5, 4).is_ok());
    }

    #[test]
    fn test_summary_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let results = ResultLayout::new(dir.path(), "simu");
        for algorithm in Algorithm::ALL {
            for measure in Measure::AGGREGATED {
                let line = if measure.is_per_fold() { "1 1 1 1\n1 1 1 1\n" } else { "1 2\n3 4\n" };
                utils::write_string(&results.metric(algorithm, measure), line).unwrap();
            }
        }
        summarize(&results, 2, 2, 2).unwrap();

        let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(results.summary()).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec!["measure", "algorithm", "task", "mean", "std"]);
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 4 * 3 * 2);
        assert_eq!(&records[0][0], "rmse");
        assert_eq!(&records[0][1], "sfan");
        assert_eq!(&records[1][3], "3.0");
    }
}
