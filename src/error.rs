//! Error taxonomy surfaced by trainers.

use thiserror::Error;

use crate::dataset::DatasetError;
use crate::estimator::EstimatorError;
use crate::package::{EnvironmentConflict, PackageError};
use crate::session::SessionError;
use crate::spec::SpecError;
use crate::trainer::{ExecutionMode, WorkUnitFailure};

/// Everything a training call can fail with.
///
/// Specification and mode errors are raised before any remote resource
/// exists. Remote, distributed and chunk errors are raised after staged
/// resources were released (or their release was attempted).
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Bad column or estimator configuration.
    #[error("Invalid specification: {0}")]
    InvalidSpecification(#[from] SpecError),
    /// The requested execution mode does not fit the estimator or dataset.
    #[error("Execution mode {mode} is not supported: {reason}")]
    UnsupportedMode { mode: ExecutionMode, reason: String },
    /// The substrate's installed packages do not satisfy the manifest.
    #[error(
        "Environment mismatch: {package} requires {required}, substrate has {}",
        installed.as_deref().unwrap_or("not installed")
    )]
    EnvironmentMismatch {
        package: String,
        required: String,
        installed: Option<String>,
    },
    /// More search work units failed than the tolerance allows.
    #[error(
        "Distributed search failed: {} of {total_units} work units failed ({})",
        failed.len(),
        WorkUnitFailure::describe_all(failed)
    )]
    DistributedTraining {
        failed: Vec<WorkUnitFailure>,
        total_units: usize,
    },
    /// The remote routine raised or the substrate reported a fault.
    #[error("Remote execution of {procedure} failed: {message}")]
    RemoteExecution { procedure: String, message: String },
    /// One external-memory chunk failed; later chunks were not attempted.
    #[error("Chunk {chunk_index} failed: {message}")]
    ChunkFailed { chunk_index: usize, message: String },
    #[error("Dataset {0} has no rows to train on")]
    EmptyDataset(String),
    #[error("Training was cancelled")]
    Cancelled,
    /// Estimator error from an in-process fit, with dataset context.
    #[error("Local fit failed on {rows} rows x {columns} columns: {source}")]
    LocalFit {
        rows: usize,
        columns: usize,
        #[source]
        source: EstimatorError,
    },
    /// Staged resources that could not be released.
    #[error("Could not release staged resources: {}", .0.join(", "))]
    Cleanup(Vec<String>),
    #[error(transparent)]
    Session(SessionError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Estimator(#[from] EstimatorError),
}

impl TrainingError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<SessionError> for TrainingError {
    fn from(err: SessionError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Session(err)
        }
    }
}

impl From<EnvironmentConflict> for TrainingError {
    fn from(conflict: EnvironmentConflict) -> Self {
        Self::EnvironmentMismatch {
            package: conflict.package,
            required: conflict.required,
            installed: conflict.installed,
        }
    }
}
