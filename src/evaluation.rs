//! Scoring of the selections a repeat produced: held-out ridge regression (RMSE),
//! agreement with the causal features (PPV/TPR) and cross-fold consistency.

use crate::cv::CV;
use crate::data::{load_causal_features, Dataset, GenotypeMatrix};
use crate::error::{HarnessError, Result};
use crate::layout::{Measure, RepeatLayout, ResultLayout};
use crate::param::Param;
use crate::solver::Algorithm;
use crate::stability::consistency_index_task;
use crate::utils;
use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, Side};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use std::path::PathBuf;

/// Ridge model with an unpenalized intercept, fitted on centered predictors
#[derive(Debug, Clone, PartialEq)]
pub struct RidgeModel {
    pub alpha: f64,
    pub intercept: f64,
    pub coefficients: Array1<f64>,
    x_mean: Array1<f64>,
}

impl RidgeModel {
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        (x - &self.x_mean).dot(&self.coefficients) + self.intercept
    }
}

/// Cholesky factor of a symmetric positive definite system
struct CholeskyFactor {
    factor: Llt<f64>,
}

impl CholeskyFactor {
    fn new(a: &Array2<f64>) -> Result<CholeskyFactor> {
        let mat = Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)]);
        let factor = mat
            .as_ref()
            .llt(Side::Lower)
            .map_err(|e| HarnessError::Linalg(format!("Cholesky factorization failed: {:?}", e)))?;
        Ok(CholeskyFactor { factor })
    }

    fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_mat = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let sol = self.factor.solve(rhs_mat.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_mat = Mat::from_fn(rhs.nrows(), rhs.ncols(), |i, j| rhs[(i, j)]);
        let sol = self.factor.solve(rhs_mat.as_ref());
        Array2::from_shape_fn((sol.nrows(), sol.ncols()), |(i, j)| sol[(i, j)])
    }
}

/// Ridge regression whose alpha is chosen among `alphas` by leave-one-out squared error,
/// computed in closed form from the hat matrix diagonal. Ties keep the first alpha.
pub fn fit_ridge_cv(x: &Array2<f64>, y: &Array1<f64>, alphas: &[f64]) -> Result<RidgeModel> {
    let n = x.nrows();
    if n == 0 || n != y.len() {
        return Err(HarnessError::InvalidConfig(format!(
            "ridge regression on {} rows and {} responses",
            n,
            y.len()
        )));
    }
    let p = x.ncols();

    let x_mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| HarnessError::InvalidConfig("ridge regression on an empty design".to_string()))?;
    let y_mean = y.sum() / n as f64;
    let xc = x - &x_mean;
    let yc = y - y_mean;

    let gram = xc.t().dot(&xc);
    let xty = xc.t().dot(&yc);

    let mut best: Option<(f64, f64, Array1<f64>)> = None;
    for &alpha in alphas {
        let chol = CholeskyFactor::new(&(&gram + &(Array2::<f64>::eye(p) * alpha)))?;
        let beta = chol.solve_vec(&xty);

        // leverage h_i = 1/n + x_i^T (X^T X + alpha I)^-1 x_i, the 1/n term from the intercept
        let solved = chol.solve_mat(&xc.t().to_owned());
        let leverage = (&xc * &solved.t()).sum_axis(Axis(1)) + 1.0 / n as f64;
        let residuals = &yc - &xc.dot(&beta);

        let loo = residuals
            .iter()
            .zip(leverage.iter())
            .map(|(r, h)| {
                let denom = 1.0 - h;
                let e = if denom.abs() > 1e-12 { r / denom } else { *r };
                e * e
            })
            .sum::<f64>()
            / n as f64;
        debug!("ridge alpha={} loo mse={:.4}", alpha, loo);

        let improves = match &best {
            Some((_, best_loo, _)) => loo < *best_loo,
            None => true,
        };
        if improves {
            best = Some((alpha, loo, beta));
        }
    }

    let (alpha, _, coefficients) = best.ok_or_else(|| HarnessError::InvalidConfig("no ridge alpha given".to_string()))?;
    Ok(RidgeModel { alpha, intercept: y_mean, coefficients, x_mean })
}

/// Fits a ridge regression on the train samples using only `selected_features`, and
/// predicts the test samples (in the order of `test`)
pub fn ridge_predict(selected_features: &[usize], genotypes: &GenotypeMatrix, phenotype: &[f64], train: &[usize], test: &[usize], alphas: &[f64]) -> Result<Vec<f64>> {
    if selected_features.is_empty() {
        return Err(HarnessError::EmptySelection);
    }
    let x_train = genotypes.design(selected_features, train);
    let y_train: Array1<f64> = train.iter().map(|&s| phenotype[s]).collect();
    let model = fit_ridge_cv(&x_train, &y_train, alphas)?;
    Ok(model.predict(&genotypes.design(selected_features, test)).to_vec())
}

/// Root mean squared error; both slices in the same sample order
pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let n = y_true.len().min(y_pred.len());
    if n == 0 {
        return f64::NAN;
    }
    let mse = y_true.iter().zip(y_pred.iter()).map(|(t, p)| (t - p) * (t - p)).sum::<f64>() / n as f64;
    mse.sqrt()
}

/// Per task, the fraction of features whose causal and predicted status agree.
///
/// Both "PPV" and "TPR" are this same agreement rate (an accuracy over all features),
/// kept under those names for compatibility with existing result files.
/// Indices are expected below `num_features`, as `utils::read_selections` guarantees.
pub fn ppv_and_tpr(ground_truth: &[Vec<usize>], predicted: &[Vec<usize>], num_features: usize) -> (Vec<f64>, Vec<f64>) {
    let mut ppv_list = Vec::with_capacity(ground_truth.len());
    let mut tpr_list = Vec::with_capacity(ground_truth.len());

    for (task_idx, causal) in ground_truth.iter().enumerate() {
        let mut y_true = vec![false; num_features];
        let mut y_pred = vec![false; num_features];
        for &f in causal {
            y_true[f] = true;
        }
        if let Some(selected) = predicted.get(task_idx) {
            for &f in selected {
                y_pred[f] = true;
            }
        }

        let agree = y_true.iter().zip(y_pred.iter()).filter(|(t, p)| t == p).count();
        let rate = agree as f64 / num_features as f64;
        ppv_list.push(rate);
        tpr_list.push(rate);
    }

    (ppv_list, tpr_list)
}

fn format_row(values: &[f64]) -> String {
    values.iter().map(|v| format!("{:.6}", v)).collect::<Vec<_>>().join(" ")
}

/// Scores of one algorithm over every fold of a repeat
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatScores {
    pub algorithm: Algorithm,
    pub rmse: Vec<f64>,
    /// fold-major, task-minor
    pub ppv: Vec<f64>,
    pub tpr: Vec<f64>,
    pub consistency: Vec<f64>,
}

fn score_algorithm(algorithm: Algorithm, param: &Param, dataset: &Dataset, cv: &CV, layout: &RepeatLayout, causal: &[Vec<usize>]) -> Result<RepeatScores> {
    let num_tasks = param.data.num_tasks;
    let num_features = param.data.num_features;
    let num_samples = param.data.num_samples;

    let selection_files: Vec<PathBuf> = (0..cv.num_folds()).map(|k| layout.selected_features(algorithm, k)).collect();
    let mut global_pred = vec![vec![f64::NAN; num_samples]; num_tasks];
    let mut ppv = Vec::with_capacity(num_tasks * cv.num_folds());
    let mut tpr = Vec::with_capacity(num_tasks * cv.num_folds());

    for (fold_idx, fold) in cv.folds.iter().enumerate() {
        let selections = utils::read_selections(&selection_files[fold_idx], num_tasks, num_features)?;

        for (task_idx, selected) in selections.iter().enumerate() {
            let phenotype = &dataset.phenotypes[task_idx];
            let preds = match ridge_predict(selected, &dataset.genotypes, phenotype, &fold.train, &fold.test, &param.ridge.alphas) {
                Ok(preds) => preds,
                Err(HarnessError::EmptySelection) => {
                    warn!("{} | fold {} | task {}: empty selection, predicting the train mean", algorithm, fold_idx, task_idx);
                    let mean = fold.train.iter().map(|&s| phenotype[s]).sum::<f64>() / fold.train.len() as f64;
                    vec![mean; fold.test.len()]
                }
                Err(e) => return Err(e),
            };

            let lines: Vec<Vec<String>> = preds.iter().map(|p| vec![format!("{:.3e}", p)]).collect();
            utils::write_lines(&layout.predicted(algorithm, fold_idx, task_idx), &lines)?;

            for (&sample, &p) in fold.test.iter().zip(preds.iter()) {
                global_pred[task_idx][sample] = p;
            }
        }

        let (fold_ppv, fold_tpr) = ppv_and_tpr(causal, &selections, num_features);
        ppv.extend(fold_ppv);
        tpr.extend(fold_tpr);
    }

    let rmse = (0..num_tasks)
        .map(|task_idx| rmse(&dataset.phenotypes[task_idx], &global_pred[task_idx]))
        .collect();
    let consistency = consistency_index_task(&selection_files, num_tasks, num_features)?;

    Ok(RepeatScores { algorithm, rmse, ppv, tpr, consistency })
}

/// Scores every algorithm of a finished repeat and appends one line to each metric file
pub fn evaluate_repeat(param: &Param, dataset: &Dataset, cv: &CV, layout: &RepeatLayout, results: &ResultLayout) -> Result<Vec<RepeatScores>> {
    let causal = load_causal_features(&dataset.causal_features, param.data.num_tasks, param.data.num_features)?;

    let scores = Algorithm::ALL
        .par_iter()
        .map(|&algorithm| score_algorithm(algorithm, param, dataset, cv, layout, &causal))
        .collect::<Result<Vec<_>>>()?;

    for s in &scores {
        info!("{} | rmse {} | consistency {}", s.algorithm, format_row(&s.rmse), format_row(&s.consistency));
        utils::append_line(&results.metric(s.algorithm, Measure::Rmse), &format_row(&s.rmse))?;
        utils::append_line(&results.metric(s.algorithm, Measure::Ppv), &format_row(&s.ppv))?;
        utils::append_line(&results.metric(s.algorithm, Measure::Tpr), &format_row(&s.tpr))?;
        utils::append_line(&results.metric(s.algorithm, Measure::Consistency), &format_row(&s.consistency))?;
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv::FoldIndices;
    use ndarray::array;
    use std::path::Path;

    #[test]
    fn test_rmse() {
        assert_eq!(rmse(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), 0.0);
        let r = rmse(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((r - 12.5f64.sqrt()).abs() < 1e-12);
        assert!(rmse(&[1.0], &[-1.0]) > 0.0);
    }

    #[test]
    fn test_ppv_tpr_identical_sets() {
        let truth = vec![vec![0, 3], vec![1]];
        let (ppv, tpr) = ppv_and_tpr(&truth, &truth, 5);
        assert_eq!(ppv, vec![1.0, 1.0]);
        assert_eq!(tpr, vec![1.0, 1.0]);
    }

    #[test]
    fn test_ppv_tpr_is_agreement_rate() {
        // 10 features: truth {0,1}, predicted {1,2} -> disagree on 0 and 2
        let (ppv, tpr) = ppv_and_tpr(&[vec![0, 1]], &[vec![1, 2]], 10);
        assert!((ppv[0] - 0.8).abs() < 1e-12);
        assert_eq!(ppv, tpr);

        let (ppv, _) = ppv_and_tpr(&[vec![0, 1]], &[vec![]], 4);
        assert!((ppv[0] - 0.5).abs() < 1e-12);
        assert!(ppv.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_cholesky_solve() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let chol = CholeskyFactor::new(&a).unwrap();
        let x = chol.solve_vec(&array![2.0, 1.0]);
        assert!((4.0 * x[0] + 2.0 * x[1] - 2.0).abs() < 1e-12);
        assert!((2.0 * x[0] + 3.0 * x[1] - 1.0).abs() < 1e-12);

        let inv = chol.solve_mat(&Array2::eye(2));
        let identity = a.dot(&inv);
        assert!((identity[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(identity[(0, 1)].abs() < 1e-12);
        assert!(CholeskyFactor::new(&array![[-1.0]]).is_err());
    }

    #[test]
    fn test_ridge_recovers_linear_signal() {
        let x = Array2::from_shape_fn((20, 2), |(i, j)| if j == 0 { i as f64 } else { ((i * 7) % 5) as f64 });
        let y: Array1<f64> = x.rows().into_iter().map(|r| 3.0 + 2.0 * r[0] - r[1]).collect();
        let model = fit_ridge_cv(&x, &y, &[0.001, 1.0, 100.0]).unwrap();
        assert_eq!(model.alpha, 0.001);
        assert!((model.coefficients[0] - 2.0).abs() < 1e-2);
        assert!((model.coefficients[1] + 1.0).abs() < 1e-2);
        let pred = model.predict(&array![[30.0, 1.0]]);
        assert!((pred[0] - 62.0).abs() < 0.1);
    }

    #[test]
    fn test_ridge_loo_choice_matches_refits() {
        // brute force leave-one-out: refit without each row with the same alpha
        let x = Array2::from_shape_fn((12, 2), |(i, j)| ((i * (j + 3)) % 7) as f64);
        let y: Array1<f64> = (0..12).map(|i| x[(i, 0)] - 0.5 * x[(i, 1)] + if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let alphas = [0.01, 1.0, 10.0, 100.0];

        let brute_force: Vec<f64> = alphas
            .iter()
            .map(|&alpha| {
                (0..12)
                    .map(|held_out| {
                        let keep: Vec<usize> = (0..12).filter(|&i| i != held_out).collect();
                        let model = fit_ridge_cv(&x.select(Axis(0), &keep), &y.select(Axis(0), &keep), &[alpha]).unwrap();
                        let pred = model.predict(&x.select(Axis(0), &[held_out]))[0];
                        (y[held_out] - pred).powi(2)
                    })
                    .sum::<f64>()
            })
            .collect();
        let best = brute_force
            .iter()
            .enumerate()
            .fold(0, |best, (i, v)| if *v < brute_force[best] { i } else { best });

        let model = fit_ridge_cv(&x, &y, &alphas).unwrap();
        assert_eq!(model.alpha, alphas[best]);
    }

    #[test]
    fn test_ridge_constant_feature_predicts_mean() {
        let x = array![[1.0], [1.0], [1.0]];
        let y = array![1.0, 2.0, 6.0];
        let model = fit_ridge_cv(&x, &y, &[1.0]).unwrap();
        assert_eq!(model.predict(&array![[5.0]]), array![3.0]);
    }

    #[test]
    fn test_ridge_predict_rejects_empty_selection() {
        let geno = GenotypeMatrix::new(vec![vec![0.0, 1.0, 2.0]]).unwrap();
        let err = ridge_predict(&[], &geno, &[1.0, 2.0, 3.0], &[0, 1], &[2], &[1.0]).unwrap_err();
        assert!(matches!(err, HarnessError::EmptySelection));
    }

    #[test]
    fn test_ridge_predict_uses_train_rows_only() {
        let geno = GenotypeMatrix::new(vec![vec![0.0, 1.0, 2.0, 3.0, 100.0]]).unwrap();
        let y = vec![0.0, 2.0, 4.0, 6.0, -50.0];
        let preds = ridge_predict(&[0], &geno, &y, &[0, 1, 2, 3], &[4, 0], &[1e-6]).unwrap();
        assert_eq!(preds.len(), 2);
        assert!((preds[0] - 200.0).abs() < 1e-2);
        assert!(preds[1].abs() < 1e-3);
    }

    /// 6 samples, 1 task, 3 shuffled folds; `y` is zero except for sample 5
    fn create_scoring_setup(dir: &Path) -> (Param, Dataset, CV, RepeatLayout) {
        let mut param = Param::default();
        param.data.num_tasks = 1;
        param.data.num_features = 2;
        param.data.num_samples = 6;
        param.cv.num_folds = 3;

        let causal_features = dir.join("causal.txt");
        utils::write_string(&causal_features, "0\n").unwrap();
        let dataset = Dataset {
            genotypes: GenotypeMatrix::new(vec![vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0], vec![1.0; 6]]).unwrap(),
            phenotypes: vec![vec![0.0, 0.0, 0.0, 0.0, 0.0, 6.0]],
            network: dir.join("net.dimacs"),
            task_similarities: dir.join("sim.txt"),
            causal_features,
        };

        let fold = |test: Vec<usize>| {
            let train = (0..6).filter(|s| !test.contains(s)).collect();
            FoldIndices { train, test, subsamples: Vec::new() }
        };
        let cv = CV { folds: vec![fold(vec![4, 1]), fold(vec![0, 5]), fold(vec![3, 2])] };

        let layout = ResultLayout::new(dir, "simu").repeat(0);
        std::fs::create_dir_all(&layout.dir).unwrap();
        (param, dataset, cv, layout)
    }

    #[test]
    fn test_rmse_uses_global_sample_order() {
        let dir = tempfile::tempdir().unwrap();
        let (param, dataset, cv, layout) = create_scoring_setup(dir.path());
        for fold_idx in 0..3 {
            utils::write_string(&layout.selected_features(Algorithm::SingleTask, fold_idx), "\n").unwrap();
        }

        let causal = load_causal_features(&dataset.causal_features, 1, 2).unwrap();
        let scores = score_algorithm(Algorithm::SingleTask, &param, &dataset, &cv, &layout, &causal).unwrap();

        // empty selections predict the train mean: 1.5, 0.0 and 1.5 for the three folds,
        // so fold 1 misses sample 5 by 6 and folds 0 and 2 miss two zeros by 1.5
        let expected = ((4.0 * 2.25 + 36.0) / 6.0f64).sqrt();
        assert!((scores.rmse[0] - expected).abs() < 1e-12);

        let fold_1: Vec<f64> = utils::read_flat(&layout.predicted(Algorithm::SingleTask, 1, 0)).unwrap();
        assert_eq!(fold_1, vec![0.0, 0.0]);
        assert_eq!(scores.ppv.len(), 3);
    }

    #[test]
    fn test_out_of_range_selection_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (param, dataset, cv, layout) = create_scoring_setup(dir.path());
        for fold_idx in 0..3 {
            let content = if fold_idx == 1 { "0 2\n" } else { "0\n" };
            utils::write_string(&layout.selected_features(Algorithm::Multitask, fold_idx), content).unwrap();
        }

        let causal = load_causal_features(&dataset.causal_features, 1, 2).unwrap();
        let err = score_algorithm(Algorithm::Multitask, &param, &dataset, &cv, &layout, &causal).unwrap_err();
        match err {
            HarnessError::Parse { path, line, .. } => {
                assert_eq!(path, layout.selected_features(Algorithm::Multitask, 1));
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
