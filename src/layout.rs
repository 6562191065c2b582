//! File naming of the inputs (simulated data) and of every artifact written by a run.
//!
//! All files of a repeat live in `<dir>/repeat_<r>/`; cross-repeat metric files live in
//! the results root. Names are kept compatible with the plotting scripts that read them.

use crate::solver::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Cross-repeat measures, one append-only file per (algorithm, measure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measure {
    Rmse,
    Ppv,
    Tpr,
    Consistency,
    Timing,
    MaxRss,
}

impl Measure {
    pub const AGGREGATED: [Measure; 4] = [Measure::Rmse, Measure::Consistency, Measure::Ppv, Measure::Tpr];
    pub const ALL: [Measure; 6] = [Measure::Rmse, Measure::Consistency, Measure::Ppv, Measure::Tpr, Measure::Timing, Measure::MaxRss];

    pub fn extension(&self) -> &'static str {
        match self {
            Measure::Rmse => "rmse",
            Measure::Ppv => "ppv",
            Measure::Tpr => "tpr",
            Measure::Consistency => "consistency",
            Measure::Timing => "timing",
            Measure::MaxRss => "maxRSS",
        }
    }

    /// PPV and TPR rows hold one value per (fold, task), fold-major
    pub fn is_per_fold(&self) -> bool {
        matches!(self, Measure::Ppv | Measure::Tpr)
    }
}

/// Simulated data of one repeat: `<data_dir>/repeat_<r>/<simu_id>.*`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLayout {
    pub dir: PathBuf,
    pub simu_id: String,
}

impl DataLayout {
    pub fn new(data_dir: &Path, simu_id: &str, repeat_idx: usize) -> DataLayout {
        DataLayout {
            dir: data_dir.join(format!("repeat_{}", repeat_idx)),
            simu_id: simu_id.to_string(),
        }
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.simu_id, suffix))
    }

    pub fn genotypes(&self) -> PathBuf {
        self.file("genotypes.txt")
    }

    pub fn network(&self) -> PathBuf {
        self.file("network.dimacs")
    }

    pub fn task_similarities(&self) -> PathBuf {
        self.file("task_similarities.txt")
    }

    pub fn causal_features(&self) -> PathBuf {
        self.file("causal_features.txt")
    }

    pub fn phenotype(&self, task_idx: usize) -> PathBuf {
        self.file(&format!("phenotype_{}.txt", task_idx))
    }

    pub fn phenotypes(&self, num_tasks: usize) -> Vec<PathBuf> {
        (0..num_tasks).map(|t| self.phenotype(t)).collect()
    }
}

/// Artifacts of one repeat: `<resu_dir>/repeat_<r>/<simu_id>.*`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatLayout {
    pub dir: PathBuf,
    pub simu_id: String,
}

impl RepeatLayout {
    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.simu_id, suffix))
    }

    pub fn train_indices(&self, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.trIndices", fold_idx))
    }

    pub fn test_indices(&self, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.teIndices", fold_idx))
    }

    pub fn subsample_indices(&self, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.ssIndices", fold_idx))
    }

    pub fn parameters(&self, algorithm: Algorithm, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.fold_{}.parameters", algorithm.name(), fold_idx))
    }

    pub fn selected_features(&self, algorithm: Algorithm, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.fold_{}.selected_features", algorithm.name(), fold_idx))
    }

    pub fn predicted(&self, algorithm: Algorithm, fold_idx: usize, task_idx: usize) -> PathBuf {
        self.file(&format!("{}.fold_{}.task_{}.predicted", algorithm.name(), fold_idx, task_idx))
    }

    pub fn subsample_process_time(&self, algorithm: Algorithm, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.fold_{}.ss.processTime", algorithm.name(), fold_idx))
    }

    pub fn subsample_max_rss(&self, algorithm: Algorithm, fold_idx: usize) -> PathBuf {
        self.file(&format!("{}.fold_{}.ss.maxRSS", algorithm.name(), fold_idx))
    }

    pub fn fold_task(&self, fold_idx: usize) -> PathBuf {
        self.file(&format!("fold_{}.task.json", fold_idx))
    }

    /// Grid persisted for the multitask solver without precision matrix (single-task grid is derived from it)
    pub fn hyperparameters_np(&self) -> PathBuf {
        self.file("hyperparameters_np.txt")
    }

    pub fn hyperparameters(&self) -> PathBuf {
        self.file("hyperparameters.txt")
    }

    pub fn hyperparameters_st(&self) -> PathBuf {
        self.file("hyperparameters_st.txt")
    }
}

/// Root of the results tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultLayout {
    pub resu_dir: PathBuf,
    pub simu_id: String,
}

impl ResultLayout {
    pub fn new(resu_dir: &Path, simu_id: &str) -> ResultLayout {
        ResultLayout {
            resu_dir: resu_dir.to_path_buf(),
            simu_id: simu_id.to_string(),
        }
    }

    pub fn repeat(&self, repeat_idx: usize) -> RepeatLayout {
        RepeatLayout {
            dir: self.resu_dir.join(format!("repeat_{}", repeat_idx)),
            simu_id: self.simu_id.clone(),
        }
    }

    pub fn metric(&self, algorithm: Algorithm, measure: Measure) -> PathBuf {
        self.resu_dir
            .join(format!("{}.{}.{}", self.simu_id, algorithm.name(), measure.extension()))
    }

    pub fn summary(&self) -> PathBuf {
        self.resu_dir.join(format!("{}.summary.tsv", self.simu_id))
    }
}
