use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a repeat, a fold or the final aggregation.
///
/// A solver that returns nothing is not an error: see `solver::SolveResult::Degenerate`.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing artifact {}: upstream stage did not complete", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}, line {line}: {detail}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    #[error("solver failure ({algorithm}): {detail}")]
    Solver { algorithm: String, detail: String },

    #[error("ridge regression needs at least one selected feature")]
    EmptySelection,

    #[error("linear algebra failure: {0}")]
    Linalg(String),

    #[error("metric file {} has a malformed row {row}: {detail}", path.display())]
    MetricShape {
        path: PathBuf,
        row: usize,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HarnessError {
    /// Wraps an I/O error, turning `NotFound` into `MissingArtifact`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> HarnessError {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            HarnessError::MissingArtifact { path }
        } else {
            HarnessError::Io { path, source }
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(e: serde_json::Error) -> Self {
        HarnessError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for HarnessError {
    fn from(e: serde_yaml::Error) -> Self {
        HarnessError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for HarnessError {
    fn from(e: csv::Error) -> Self {
        HarnessError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
