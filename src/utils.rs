use crate::error::{HarnessError, Result};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use statrs::statistics::Statistics;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// a function used essentially in CV that split randomly a Vec<T> into p Vec<T> of approximatively the same size
pub fn split_into_balanced_random_chunks<T: Clone>(vec: Vec<T>, p: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<T>> {
    let mut shuffled = vec;
    shuffled.shuffle(rng);
    split_into_balanced_chunks(&shuffled, p)
}

/// Contiguous split, the first `len % p` chunks receiving one extra element
pub fn split_into_balanced_chunks<T: Clone>(values: &[T], p: usize) -> Vec<Vec<T>> {
    let n = values.len();
    let base_size = n / p;
    let extra_elements = n % p;

    let mut chunks = Vec::with_capacity(p);
    let mut start = 0;
    for i in 0..p {
        let chunk_size = base_size + if i < extra_elements { 1 } else { 0 };
        let end = start + chunk_size;
        chunks.push(values[start..end].to_vec());
        start = end;
    }

    chunks
}

/// Population mean and standard deviation (ddof = 0)
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    (values.iter().mean(), values.iter().population_std_dev())
}

/// Squared Pearson correlation, 0.0 when one of the vectors is constant
pub fn pearson_r2(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let var_x = x.iter().population_variance();
    let var_y = y.iter().population_variance();
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    let cov = x.iter().population_covariance(y.iter());
    cov * cov / (var_x * var_y)
}

/// Whitespace separated tokens parsed as `T`, one Vec per line (empty lines give empty Vecs)
pub fn read_lines_of<T: std::str::FromStr>(path: &Path) -> Result<Vec<Vec<T>>>
where
    T::Err: std::fmt::Display,
{
    let file = File::open(path).map_err(|e| HarnessError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    for (line_idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| HarnessError::io(path, e))?;
        rows.push(parse_tokens(&line, path, line_idx + 1)?);
    }
    Ok(rows)
}

/// Feature index lists, one line per task, as written for selections and causal features.
///
/// Every index must be below `num_features` and the file may not hold more than
/// `num_tasks` lines. Missing trailing tasks are empty lists.
pub fn read_selections(path: &Path, num_tasks: usize, num_features: usize) -> Result<Vec<Vec<usize>>> {
    let mut rows = read_lines_of::<usize>(path)?;
    if rows.len() > num_tasks {
        return Err(HarnessError::Parse {
            path: path.to_path_buf(),
            line: num_tasks + 1,
            detail: format!("{} task lines found, {} expected", rows.len(), num_tasks),
        });
    }
    for (line_idx, row) in rows.iter().enumerate() {
        if let Some(feature) = row.iter().find(|&&f| f >= num_features) {
            return Err(HarnessError::Parse {
                path: path.to_path_buf(),
                line: line_idx + 1,
                detail: format!("feature index {} out of range (num_features = {})", feature, num_features),
            });
        }
    }
    rows.resize(num_tasks, Vec::new());
    Ok(rows)
}

pub fn parse_tokens<T: std::str::FromStr>(line: &str, path: &Path, line_number: usize) -> Result<Vec<T>>
where
    T::Err: std::fmt::Display,
{
    line.split_whitespace()
        .map(|token| {
            token.parse::<T>().map_err(|e| HarnessError::Parse {
                path: path.to_path_buf(),
                line: line_number,
                detail: format!("'{}': {}", token, e),
            })
        })
        .collect()
}

/// Every whitespace separated token of the file, regardless of line breaks
pub fn read_flat<T: std::str::FromStr>(path: &Path) -> Result<Vec<T>>
where
    T::Err: std::fmt::Display,
{
    Ok(read_lines_of::<T>(path)?.into_iter().flatten().collect())
}

pub fn join<T: ToString>(values: &[T]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Overwrites `path` with one space separated line per row
pub fn write_lines<T: ToString>(path: &Path, rows: &[Vec<T>]) -> Result<()> {
    let file = File::create(path).map_err(|e| HarnessError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        writeln!(writer, "{}", join(row)).map_err(|e| HarnessError::io(path, e))?;
    }
    writer.flush().map_err(|e| HarnessError::io(path, e))
}

pub fn write_string(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| HarnessError::io(path, e))
}

pub fn read_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))
}

/// Appends one line to an append-only file, creating it if needed
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| HarnessError::io(path, e))?;
    writeln!(file, "{}", line).map_err(|e| HarnessError::io(path, e))
}

pub fn create_dir_if_not_exists(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        log::info!("Creating {}", dir.display());
        std::fs::create_dir_all(dir).map_err(|e| HarnessError::io(dir, e))?;
    }
    Ok(())
}
