//! Routines that run on the substrate.
//!
//! Trainers register these as stored procedures under request-scoped names.
//! Each reads a [`RemoteExecutionPackage`] from a stage, verifies its
//! checksum, rebuilds the estimator through the registry and reads training
//! rows from a staged table. Fitted estimators travel back the same way: as a
//! package file written to the stage.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::TrainingData;
use crate::estimator::search::evaluate_candidate;
use crate::estimator::{Estimator, EstimatorRegistry, Params, Scoring};
use crate::package::{FitArguments, RemoteExecutionPackage};
use crate::session::{ProcedureContext, ProcedureError, StoredProcedure};

/// Arguments of [`FitProcedure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitRequest {
    pub stage: String,
    pub package_file: String,
    /// File the fitted package is written to, in the same stage.
    pub output_file: String,
    /// Table to read instead of the package's staged input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_table: Option<String>,
    /// Overrides `fit_arguments.partial`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitReport {
    pub output_file: String,
    pub rows: u64,
    pub fit_millis: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Fit (or continue fitting) the packaged estimator on one staged table.
pub struct FitProcedure {
    registry: Arc<EstimatorRegistry>,
}

impl FitProcedure {
    pub fn new(registry: Arc<EstimatorRegistry>) -> Self {
        Self { registry }
    }
}

impl StoredProcedure for FitProcedure {
    fn call(&self, ctx: &ProcedureContext, args: Value) -> Result<Value, ProcedureError> {
        let request: FitRequest = serde_json::from_value(args)?;
        let package = load_package(ctx, &request.stage, &request.package_file)?;
        let mut estimator = rebuild(&package, &self.registry)?;
        let table = input_table(&package, request.input_table.as_deref())?;
        let data = read_training_data(ctx, table, &package.fit_arguments)?;
        let warnings = data_warnings(&data);

        ctx.checkpoint()?;
        let started = Instant::now();
        let fitted = if request.partial.unwrap_or(package.fit_arguments.partial) {
            estimator.partial_fit(&data)
        } else {
            estimator.fit(&data)
        };
        fitted.map_err(|err| ProcedureError::Failed(err.to_string()))?;
        let fit_millis = started.elapsed().as_millis() as u64;
        ctx.checkpoint()?;

        let output = package
            .with_estimator(estimator.as_ref())
            .and_then(|package| package.to_bytes())
            .map_err(|err| ProcedureError::Failed(err.to_string()))?;
        ctx.put(&request.stage, &request.output_file, &output)?;
        Ok(serde_json::to_value(FitReport {
            output_file: request.output_file,
            rows: data.n_rows() as u64,
            fit_millis,
            warnings,
        })?)
    }
}

/// Arguments of [`ScoreProcedure`]: one (combination, fold) work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub stage: String,
    pub package_file: String,
    pub candidate: usize,
    pub fold: usize,
    pub n_folds: usize,
    pub scoring: Scoring,
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub candidate: usize,
    pub fold: usize,
    /// `None` when the score is not a finite number.
    pub score: Option<f64>,
}

/// Fit the packaged base estimator with one parameter combination on the
/// training part of one fold, and score it on the validation part.
pub struct ScoreProcedure {
    registry: Arc<EstimatorRegistry>,
}

impl ScoreProcedure {
    pub fn new(registry: Arc<EstimatorRegistry>) -> Self {
        Self { registry }
    }
}

impl StoredProcedure for ScoreProcedure {
    fn call(&self, ctx: &ProcedureContext, args: Value) -> Result<Value, ProcedureError> {
        let request: ScoreRequest = serde_json::from_value(args)?;
        let package = load_package(ctx, &request.stage, &request.package_file)?;
        let base = rebuild(&package, &self.registry)?;
        let table = input_table(&package, None)?;
        let data = read_training_data(ctx, table, &package.fit_arguments)?;
        ctx.checkpoint()?;
        let score = evaluate_candidate(
            base.as_ref(),
            &request.params,
            &data,
            request.n_folds,
            request.fold,
            request.scoring,
        )
        .map_err(|err| ProcedureError::Failed(err.to_string()))?;
        Ok(serde_json::to_value(ScoreReport {
            candidate: request.candidate,
            fold: request.fold,
            score: score.is_finite().then_some(score),
        })?)
    }
}

fn load_package(
    ctx: &ProcedureContext,
    stage: &str,
    file: &str,
) -> Result<RemoteExecutionPackage, ProcedureError> {
    let bytes = ctx.get(stage, file)?;
    RemoteExecutionPackage::from_bytes(&bytes)
        .map_err(|err| ProcedureError::InvalidArguments(format!("{file}: {err}")))
}

fn rebuild(
    package: &RemoteExecutionPackage,
    registry: &EstimatorRegistry,
) -> Result<Box<dyn Estimator>, ProcedureError> {
    package
        .estimator(registry)
        .map_err(|err| ProcedureError::Failed(err.to_string()))
}

fn input_table<'a>(
    package: &'a RemoteExecutionPackage,
    explicit: Option<&'a str>,
) -> Result<&'a str, ProcedureError> {
    explicit
        .or(package.staged_input_ref.as_deref())
        .ok_or_else(|| ProcedureError::InvalidArguments("no staged input table".to_string()))
}

fn read_training_data(
    ctx: &ProcedureContext,
    table: &str,
    arguments: &FitArguments,
) -> Result<TrainingData, ProcedureError> {
    let rows = ctx.read_table(table, &arguments.columns(), None)?;
    TrainingData::from_table(
        &rows,
        &arguments.input_cols,
        &arguments.label_cols,
        arguments.sample_weight_col.as_deref(),
    )
    .map_err(|err| ProcedureError::Failed(err.to_string()))
}

fn data_warnings(data: &TrainingData) -> Vec<String> {
    let missing = data
        .x
        .iter()
        .filter(|row| row.iter().any(|value| value.is_nan()))
        .count();
    if missing == 0 {
        Vec::new()
    } else {
        vec![format!(
            "{missing} of {} rows have missing feature values",
            data.n_rows()
        )]
    }
}
