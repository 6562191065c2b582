use crate::error::{HarnessError, Result};
use crate::layout::RepeatLayout;
use crate::utils;
use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Sample indices of one cross-validation fold
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FoldIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
    /// Subsets of `train` only, used to measure selection stability
    pub subsamples: Vec<Vec<usize>>,
}

/// This class implement Cross Validation indices, e.g. split the samples in N folds, each with its
/// train/test partition and its stability subsamples drawn from the train part.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CV {
    pub folds: Vec<FoldIndices>,
}

/// Seeded when a seed is given, drawn from OS entropy otherwise
pub fn make_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

impl CV {
    /// Standard k-fold over `0..num_samples`. Folds are contiguous unless `shuffle_folds`.
    /// Each fold's train set is then split into `num_subsamples` shuffled chunks and subsample `j`
    /// is the train set minus chunk `j`.
    pub fn new(num_samples: usize, num_folds: usize, num_subsamples: usize, shuffle_folds: bool, rng: &mut ChaCha8Rng) -> CV {
        let samples: Vec<usize> = (0..num_samples).collect();
        let test_folds = if shuffle_folds {
            utils::split_into_balanced_random_chunks(samples, num_folds, rng)
        } else {
            utils::split_into_balanced_chunks(&samples, num_folds)
        };

        let mut folds = Vec::with_capacity(num_folds);
        for (fold_idx, test) in test_folds.into_iter().enumerate() {
            let mut test = test;
            test.sort_unstable();
            let held_out: HashSet<usize> = test.iter().copied().collect();
            let train: Vec<usize> = (0..num_samples).filter(|i| !held_out.contains(i)).collect();

            let subsamples = CV::subsample(&train, num_subsamples, rng);
            debug!("Fold #{}: {} train, {} test, {} subsamples", fold_idx, train.len(), test.len(), subsamples.len());

            folds.push(FoldIndices { train, test, subsamples });
        }

        CV { folds }
    }

    fn subsample(train: &[usize], num_subsamples: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<usize>> {
        let left_out = utils::split_into_balanced_random_chunks(train.to_vec(), num_subsamples, rng);
        left_out
            .into_iter()
            .map(|chunk| {
                let chunk: HashSet<usize> = chunk.into_iter().collect();
                train.iter().copied().filter(|i| !chunk.contains(i)).collect()
            })
            .collect()
    }

    pub fn num_folds(&self) -> usize {
        self.folds.len()
    }

    /// Test indices of every fold concatenated in fold order, i.e. the order in which
    /// fold-local predictions are produced
    pub fn test_order(&self) -> Vec<usize> {
        self.folds.iter().flat_map(|f| f.test.iter().copied()).collect()
    }

    /// Writes the train, test and subsample index files of each fold
    pub fn save(&self, layout: &RepeatLayout) -> Result<()> {
        for (fold_idx, fold) in self.folds.iter().enumerate() {
            utils::write_lines(&layout.train_indices(fold_idx), &[fold.train.clone()])?;
            utils::write_lines(&layout.test_indices(fold_idx), &[fold.test.clone()])?;
            utils::write_lines(&layout.subsample_indices(fold_idx), &fold.subsamples)?;
        }
        Ok(())
    }

    pub fn load_fold(layout: &RepeatLayout, fold_idx: usize) -> Result<FoldIndices> {
        let train: Vec<usize> = utils::read_flat(&layout.train_indices(fold_idx))?;
        let test: Vec<usize> = utils::read_flat(&layout.test_indices(fold_idx))?;
        let subsamples: Vec<Vec<usize>> = utils::read_lines_of(&layout.subsample_indices(fold_idx))?
            .into_iter()
            .filter(|line| !line.is_empty())
            .collect();
        Ok(FoldIndices { train, test, subsamples })
    }

    /// Reload the partition persisted by `save` and check it is still a partition of `0..num_samples`
    pub fn load(layout: &RepeatLayout, num_folds: usize, num_samples: usize) -> Result<CV> {
        let folds = (0..num_folds)
            .map(|fold_idx| CV::load_fold(layout, fold_idx))
            .collect::<Result<Vec<_>>>()?;
        let cv = CV { folds };
        cv.check(num_samples)?;
        Ok(cv)
    }

    /// Train and test are disjoint and cover the population; test sets cover it exactly once
    pub fn check(&self, num_samples: usize) -> Result<()> {
        let mut seen = vec![false; num_samples];
        for (fold_idx, fold) in self.folds.iter().enumerate() {
            let train: HashSet<usize> = fold.train.iter().copied().collect();
            let test: HashSet<usize> = fold.test.iter().copied().collect();
            if train.len() + test.len() != num_samples || train.union(&test).any(|&i| i >= num_samples) || !train.is_disjoint(&test) {
                return Err(HarnessError::InvalidConfig(format!(
                    "fold {} is not a train/test partition of {} samples",
                    fold_idx, num_samples
                )));
            }
            for &i in &fold.test {
                if seen[i] {
                    return Err(HarnessError::InvalidConfig(format!(
                        "sample {} appears in several test folds",
                        i
                    )));
                }
                seen[i] = true;
            }
            if fold.subsamples.iter().flatten().any(|i| !train.contains(i)) {
                return Err(HarnessError::InvalidConfig(format!(
                    "fold {} has a subsample outside of its train set",
                    fold_idx
                )));
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(HarnessError::InvalidConfig(
                "test folds do not cover every sample".to_string(),
            ));
        }
        Ok(())
    }
}

// unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cv_new_creates_correct_number_of_folds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let cv = CV::new(20, 4, 3, false, &mut rng);
        assert_eq!(cv.num_folds(), 4);
        for fold in &cv.folds {
            assert_eq!(fold.subsamples.len(), 3);
        }
    }

    #[test]
    fn test_ten_samples_five_folds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let cv = CV::new(10, 5, 2, false, &mut rng);
        let mut all_test = Vec::new();
        for fold in &cv.folds {
            assert_eq!(fold.test.len(), 2);
            assert_eq!(fold.train.len(), 8);
            all_test.extend(fold.test.iter().copied());
        }
        all_test.sort();
        assert_eq!(all_test, (0..10).collect::<Vec<usize>>());
        assert_eq!(cv.folds[0].test, vec![0, 1]);
        assert_eq!(cv.folds[4].test, vec![8, 9]);
    }

    #[test]
    fn test_partition_invariants_with_shuffle() {
        for seed in 0..5 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let cv = CV::new(23, 4, 5, true, &mut rng);
            assert!(cv.check(23).is_ok());
            for fold in &cv.folds {
                let train: HashSet<usize> = fold.train.iter().copied().collect();
                assert!(fold.test.iter().all(|i| !train.contains(i)));
                for ss in &fold.subsamples {
                    assert!(ss.iter().all(|i| train.contains(i)));
                    assert!(ss.len() < fold.train.len());
                }
            }
        }
    }

    #[test]
    fn test_subsamples_leave_out_balanced_chunks() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let cv = CV::new(12, 3, 4, false, &mut rng);
        // 8 train samples, 4 subsamples: each one leaves 2 samples out
        for fold in &cv.folds {
            for ss in &fold.subsamples {
                assert_eq!(ss.len(), 6);
                assert!(ss.windows(2).all(|w| w[0] < w[1]));
            }
            // each train sample is left out exactly once across subsamples
            for i in &fold.train {
                let left_out = fold.subsamples.iter().filter(|ss| !ss.contains(i)).count();
                assert_eq!(left_out, 1);
            }
        }
    }

    #[test]
    fn test_cv_new_reproductibility() {
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);
        let cv1 = CV::new(30, 3, 4, true, &mut rng1);
        let cv2 = CV::new(30, 3, 4, true, &mut rng2);
        assert_eq!(cv1, cv2);

        let mut rng3 = ChaCha8Rng::seed_from_u64(43);
        let cv3 = CV::new(30, 3, 4, true, &mut rng3);
        assert_ne!(cv1, cv3);
    }

    #[test]
    fn test_unseeded_partition_is_still_valid() {
        let mut rng = make_rng(None);
        let cv = CV::new(17, 5, 3, true, &mut rng);
        assert!(cv.check(17).is_ok());
    }

    #[test]
    fn test_test_order_concatenates_folds() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let cv = CV::new(7, 3, 2, true, &mut rng);
        let order = cv.test_order();
        assert_eq!(order.len(), 7);
        assert_eq!(&order[..cv.folds[0].test.len()], cv.folds[0].test.as_slice());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepeatLayout { dir: dir.path().to_path_buf(), simu_id: "simu".to_string() };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let cv = CV::new(15, 3, 4, true, &mut rng);
        cv.save(&layout).unwrap();

        assert!(layout.train_indices(2).exists());
        let reloaded = CV::load(&layout, 3, 15).unwrap();
        assert_eq!(reloaded, cv);
    }

    #[test]
    fn test_load_missing_fold_is_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepeatLayout { dir: dir.path().to_path_buf(), simu_id: "simu".to_string() };
        let err = CV::load(&layout, 2, 10).unwrap_err();
        assert!(matches!(err, HarnessError::MissingArtifact { .. }));
    }

    #[test]
    fn test_check_detects_overlap() {
        let cv = CV {
            folds: vec![
                FoldIndices { train: vec![2, 3], test: vec![0, 1], subsamples: vec![vec![2]] },
                FoldIndices { train: vec![0, 1, 3], test: vec![1, 2], subsamples: vec![vec![0]] },
            ],
        };
        assert!(cv.check(4).is_err());
    }
}
