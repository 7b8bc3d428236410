//! Train estimators against a data substrate, locally or remotely.
//!
//! A [`TrainerBuilder`] inspects the dataset and the estimator, picks one
//! [`ExecutionMode`] and returns a trainer with a uniform
//! `train()`/`cleanup()` contract. Remote modes stage data, package the
//! estimator and run fit or score procedures on a [`Session`], then release
//! everything they staged.

/// Per-user directories for config, logs and stages.
pub mod app_dirs;
pub mod cancel;
/// Persisted training settings.
pub mod config;
/// Tabular data, schemas and dataset handles.
pub mod dataset;
pub mod error;
/// Estimator contract and built-in estimators.
pub mod estimator;
pub mod logging;
/// Serialized estimator plus dependency manifest shipped to the substrate.
pub mod package;
/// Substrate contract and the SQLite implementation.
pub mod session;
pub mod spec;
/// Mode selection and the four trainers.
pub mod trainer;

pub use cancel::CancellationToken;
pub use config::{FailureTolerance, TrainingSettings};
pub use dataset::{DatasetHandle, Table};
pub use error::TrainingError;
pub use estimator::{Estimator, EstimatorRegistry};
pub use session::{Session, SqliteSession};
pub use spec::{ModelSpecification, predict_table};
pub use trainer::{
    ExecutionMode, Trainer, TrainerBuilder, TrainingMetrics, TrainingResult, WorkUnitFailure,
    build_trainer,
};
