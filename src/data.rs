use crate::error::{HarnessError, Result};
use crate::layout::DataLayout;
use crate::param::Param;
use crate::utils;
use log::{debug, info};
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Genotypes stored feature-major: `values[[feature, sample]]`
#[derive(Clone, Debug, PartialEq)]
pub struct GenotypeMatrix {
    values: Array2<f64>,
}

impl GenotypeMatrix {
    pub fn new(values: Vec<Vec<f64>>) -> Result<GenotypeMatrix> {
        let num_samples = values.first().map(|row| row.len()).unwrap_or(0);
        if let Some(idx) = values.iter().position(|row| row.len() != num_samples) {
            return Err(HarnessError::InvalidConfig(format!(
                "genotype row {} has {} samples, expected {}",
                idx,
                values[idx].len(),
                num_samples
            )));
        }
        let num_features = values.len();
        let flat: Vec<f64> = values.into_iter().flatten().collect();
        let values = Array2::from_shape_vec((num_features, num_samples), flat)
            .map_err(|e| HarnessError::InvalidConfig(format!("genotype matrix: {}", e)))?;
        Ok(GenotypeMatrix { values })
    }

    /// Reads a whitespace separated matrix, one line per feature, one column per sample
    pub fn load(path: &Path, num_features: usize, num_samples: usize) -> Result<GenotypeMatrix> {
        info!("Loading genotypes {}...", path.display());
        let rows: Vec<Vec<f64>> = utils::read_lines_of::<f64>(path)?
            .into_iter()
            .filter(|row| !row.is_empty())
            .collect();

        if rows.len() != num_features {
            return Err(HarnessError::Parse {
                path: path.to_path_buf(),
                line: rows.len(),
                detail: format!("{} features found, {} expected", rows.len(), num_features),
            });
        }
        if let Some(idx) = rows.iter().position(|row| row.len() != num_samples) {
            return Err(HarnessError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                detail: format!("{} samples found, {} expected", rows[idx].len(), num_samples),
            });
        }

        GenotypeMatrix::new(rows)
    }

    pub fn num_features(&self) -> usize {
        self.values.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.values.ncols()
    }

    pub fn feature(&self, feature_idx: usize) -> ArrayView1<'_, f64> {
        self.values.row(feature_idx)
    }

    /// Sample-major design matrix restricted to `features` (columns) and `samples` (rows)
    pub fn design(&self, features: &[usize], samples: &[usize]) -> Array2<f64> {
        self.values.select(Axis(0), features).select(Axis(1), samples).reversed_axes()
    }
}

/// One float per sample in global sample order, whitespace or newline separated
pub fn load_phenotype(path: &Path, num_samples: usize) -> Result<Vec<f64>> {
    let y: Vec<f64> = utils::read_flat(path)?;
    if y.len() != num_samples {
        return Err(HarnessError::Parse {
            path: path.to_path_buf(),
            line: 0,
            detail: format!("{} phenotype values found, {} expected", y.len(), num_samples),
        });
    }
    Ok(y)
}

/// One line per task holding the 0-based indices of the truly causal features
pub fn load_causal_features(path: &Path, num_tasks: usize, num_features: usize) -> Result<Vec<Vec<usize>>> {
    utils::read_selections(path, num_tasks, num_features)
}

/// In-memory inputs of one repeat
#[derive(Clone, Debug)]
pub struct Dataset {
    pub genotypes: GenotypeMatrix,
    pub phenotypes: Vec<Vec<f64>>,
    pub network: PathBuf,
    pub task_similarities: PathBuf,
    pub causal_features: PathBuf,
}

impl Dataset {
    pub fn load(layout: &DataLayout, param: &Param) -> Result<Dataset> {
        let genotypes = GenotypeMatrix::load(&layout.genotypes(), param.data.num_features, param.data.num_samples)?;
        let phenotypes = layout
            .phenotypes(param.data.num_tasks)
            .iter()
            .map(|path| load_phenotype(path, param.data.num_samples))
            .collect::<Result<Vec<_>>>()?;

        let dataset = Dataset {
            genotypes,
            phenotypes,
            network: layout.network(),
            task_similarities: layout.task_similarities(),
            causal_features: layout.causal_features(),
        };
        for path in [&dataset.network, &dataset.task_similarities] {
            if !path.exists() {
                return Err(HarnessError::MissingArtifact { path: path.clone() });
            }
        }
        Ok(dataset)
    }

    pub fn num_tasks(&self) -> usize {
        self.phenotypes.len()
    }

    pub fn num_features(&self) -> usize {
        self.genotypes.num_features()
    }

    /// Squared Pearson correlation of every feature with the task phenotype on `samples`
    pub fn node_weights(&self, task_idx: usize, samples: &[usize]) -> Vec<f64> {
        let phenotype = &self.phenotypes[task_idx];
        let y: Vec<f64> = samples.iter().map(|&s| phenotype[s]).collect();

        (0..self.num_features())
            .into_par_iter()
            .map(|feature_idx| {
                let row = self.genotypes.feature(feature_idx);
                let x: Vec<f64> = samples.iter().map(|&s| row[s]).collect();
                utils::pearson_r2(&x, &y)
            })
            .collect()
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks, {} features x {} samples, network {}",
            self.num_tasks(),
            self.num_features(),
            self.genotypes.num_samples(),
            self.network.display()
        )
    }
}

/// Node-weight files of every task for one sample subset.
///
/// Files are removed when the value is dropped, so they never outlive the loop
/// iteration that created them.
pub struct WeightFiles {
    files: Vec<NamedTempFile>,
    paths: Vec<PathBuf>,
}

impl WeightFiles {
    pub fn create(dataset: &Dataset, samples: &[usize], tmp_dir: &Path) -> Result<WeightFiles> {
        let mut files = Vec::with_capacity(dataset.num_tasks());
        for task_idx in 0..dataset.num_tasks() {
            let weights = dataset.node_weights(task_idx, samples);

            let file = tempfile::Builder::new()
                .prefix("sfan_weights_")
                .suffix(&format!(".task_{}", task_idx))
                .tempfile_in(tmp_dir)
                .map_err(|e| HarnessError::io(tmp_dir, e))?;
            {
                let mut writer = BufWriter::new(file.as_file());
                for w in &weights {
                    writeln!(writer, "{:.3e}", w).map_err(|e| HarnessError::io(file.path(), e))?;
                }
                writer.flush().map_err(|e| HarnessError::io(file.path(), e))?;
            }
            debug!("Task {} weights -> {}", task_idx, file.path().display());
            files.push(file);
        }
        let paths = files.iter().map(|f| f.path().to_path_buf()).collect();
        Ok(WeightFiles { files, paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn create_test_dataset(dir: &Path) -> Dataset {
        let genotypes = GenotypeMatrix::new(vec![
            vec![0.0, 1.0, 2.0, 3.0],
            vec![1.0, 1.0, 1.0, 1.0],
            vec![3.0, 2.0, 1.0, 0.0],
        ])
        .unwrap();
        Dataset {
            genotypes,
            phenotypes: vec![vec![1.0, 2.0, 3.0, 4.0], vec![0.0, 1.0, 0.0, 1.0]],
            network: dir.join("net.dimacs"),
            task_similarities: dir.join("sim.txt"),
            causal_features: dir.join("causal.txt"),
        }
    }

    #[test]
    fn test_load_genotypes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geno.txt");
        utils::write_string(&path, "0 1 2\n1 1 0\n").unwrap();
        let geno = GenotypeMatrix::load(&path, 2, 3).unwrap();
        assert_eq!(geno.num_features(), 2);
        assert_eq!(geno.num_samples(), 3);
        assert_eq!(geno.feature(1).to_vec(), vec![1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_load_genotypes_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geno.txt");
        utils::write_string(&path, "0 1 2\n1 1\n").unwrap();
        assert!(matches!(GenotypeMatrix::load(&path, 2, 3), Err(HarnessError::Parse { line: 2, .. })));
        assert!(GenotypeMatrix::load(&path, 3, 3).is_err());
    }

    #[test]
    fn test_design_selects_rows_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = create_test_dataset(dir.path());
        let x = dataset.genotypes.design(&[2, 0], &[3, 1]);
        assert_eq!(x, array![[0.0, 3.0], [2.0, 1.0]]);
    }

    #[test]
    fn test_load_phenotype_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pheno.txt");
        utils::write_string(&path, "1.5\n2.5\n-0.5\n").unwrap();
        assert_eq!(load_phenotype(&path, 3).unwrap(), vec![1.5, 2.5, -0.5]);
        assert!(load_phenotype(&path, 4).is_err());
    }

    #[test]
    fn test_load_causal_features_pads_missing_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("causal.txt");
        utils::write_string(&path, "0 4 7\n").unwrap();
        let causal = load_causal_features(&path, 2, 8).unwrap();
        assert_eq!(causal, vec![vec![0, 4, 7], vec![]]);
    }

    #[test]
    fn test_load_causal_features_rejects_extra_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("causal.txt");
        utils::write_string(&path, "0 1\n1 2\n3\n").unwrap();
        assert!(matches!(load_causal_features(&path, 2, 8), Err(HarnessError::Parse { line: 3, .. })));
        assert!(load_causal_features(&path, 3, 3).is_err());
    }

    #[test]
    fn test_node_weights() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = create_test_dataset(dir.path());
        let w = dataset.node_weights(0, &[0, 1, 2, 3]);
        assert!((w[0] - 1.0).abs() < 1e-12);
        assert_eq!(w[1], 0.0);
        assert!((w[2] - 1.0).abs() < 1e-12);

        let w = dataset.node_weights(1, &[0, 1, 2, 3]);
        assert!(w[0] > 0.0 && w[0] < 1.0);
    }

    #[test]
    fn test_weight_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = create_test_dataset(dir.path());
        let paths = {
            let weights = WeightFiles::create(&dataset, &[0, 1, 2], dir.path()).unwrap();
            assert_eq!(weights.len(), 2);
            let content = utils::read_string(&weights.paths()[0]).unwrap();
            assert_eq!(content.lines().count(), 3);
            assert!(content.lines().next().unwrap().contains('e'));
            weights.paths().to_vec()
        };
        assert!(paths.iter().all(|p| !p.exists()));
    }
}
