//! Remote single-node trainer.
//!
//! Stages the training columns as a table, ships the estimator as a package
//! file and runs one fit procedure on the substrate. The fitted estimator
//! comes back through the stage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::driver::{FitProcedure, FitReport, FitRequest};
use super::staging::scoped;
use super::{ExecutionMode, RemoteContext, StagingArea, Trainer, TrainerContext, TrainingMetrics, TrainingResult};
use crate::cancel::CancellationToken;
use crate::dataset::DatasetHandle;
use crate::error::TrainingError;
use crate::estimator::{Estimator, EstimatorRegistry};
use crate::package::RemoteExecutionPackage;
use crate::session::{ProcedureCall, Session, SessionError, SubmitOptions};

pub(crate) const PACKAGE_FILE: &str = "package.json";
pub(crate) const RESULT_FILE: &str = "fitted.json";

pub struct RemoteTrainer {
    remote: RemoteContext,
}

impl RemoteTrainer {
    pub(crate) fn new(remote: RemoteContext) -> Self {
        Self { remote }
    }
}

/// Build the package for `estimator` and check it against the substrate
/// before anything is staged.
pub(crate) fn prepare_package(
    context: &TrainerContext,
    session: &dyn Session,
    estimator: &dyn Estimator,
) -> Result<RemoteExecutionPackage, TrainingError> {
    let package =
        RemoteExecutionPackage::build(&context.spec, estimator, &context.settings.extra_requirements)?;
    let installed = session.installed_packages()?;
    package.check_environment(&installed)?;
    Ok(package)
}

/// Stage the training columns of `dataset` as `<prefix>_INPUT`.
///
/// Remote data is copied inside the substrate; in-memory data is uploaded.
pub(crate) fn stage_input(
    staging: &mut StagingArea,
    dataset: &DatasetHandle,
    columns: &[String],
) -> Result<String, TrainingError> {
    match dataset {
        DatasetHandle::Remote { table, .. } => {
            let name = staging.prefix().object("input");
            let (name, rows) = staging.copy_table(name, table, columns, None)?;
            if rows == 0 {
                return Err(TrainingError::EmptyDataset(table.clone()));
            }
            Ok(name)
        }
        DatasetHandle::InMemory(table) => {
            if table.num_rows() == 0 {
                return Err(TrainingError::EmptyDataset("in-memory table".to_string()));
            }
            staging.write_table("input", &table.select(columns)?)
        }
    }
}

/// Map a submission failure to the taxonomy: cancellation stays
/// cancellation, everything else is a remote execution error.
pub(crate) fn remote_failure(procedure: &str, err: SessionError) -> TrainingError {
    match err {
        SessionError::Cancelled { .. } => TrainingError::Cancelled,
        SessionError::ProcedureFailed { procedure, message } => {
            TrainingError::RemoteExecution { procedure, message }
        }
        other => TrainingError::RemoteExecution {
            procedure: procedure.to_string(),
            message: other.to_string(),
        },
    }
}

/// Run one fit unit and fetch the fitted estimator it wrote.
pub(crate) fn run_fit(
    staging: &StagingArea,
    procedure: &str,
    request: FitRequest,
    options: &SubmitOptions,
    registry: &EstimatorRegistry,
) -> Result<(Box<dyn Estimator>, FitReport), TrainingError> {
    let stage = request.stage.clone();
    let args = serde_json::to_value(&request).map_err(crate::package::PackageError::from)?;
    // At most once: a failed submission is reported, never retried here.
    let value = staging
        .session()
        .call_procedure(&ProcedureCall::new(procedure, args), options)
        .map_err(|err| remote_failure(procedure, err))?;
    let report: FitReport = serde_json::from_value(value).map_err(|err| TrainingError::RemoteExecution {
        procedure: procedure.to_string(),
        message: format!("unreadable fit report: {err}"),
    })?;
    let bytes = staging.session().get(&stage, &report.output_file)?;
    let fitted = RemoteExecutionPackage::from_bytes(&bytes)?;
    let estimator = fitted.estimator(registry)?;
    Ok((estimator, report))
}

impl Trainer for RemoteTrainer {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::RemoteSingleNode
    }

    fn train(&mut self) -> Result<TrainingResult, TrainingError> {
        let started = Instant::now();
        let RemoteContext {
            base: context,
            session,
            staging,
        } = &mut self.remote;
        context.check_cancelled()?;
        let package = prepare_package(context, session.as_ref(), context.estimator.as_ref())?;
        let prefix = staging.prefix().as_str().to_string();
        info!(prefix = %prefix, estimator = context.spec.estimator_class(), "Remote fit starting");

        let (estimator, report) = scoped(staging, &context.cancel, |staging| {
            let input = stage_input(staging, &context.dataset, &context.spec.training_columns())?;
            let stage = staging.create_stage("stage")?;
            let package = package.with_staged_input(input);
            staging.session().put(&stage, PACKAGE_FILE, &package.to_bytes()?)?;
            let procedure = staging.register_procedure(
                "fit",
                Arc::new(FitProcedure::new(Arc::clone(&context.registry))),
            )?;
            context.check_cancelled()?;
            run_fit(
                staging,
                &procedure,
                FitRequest {
                    stage,
                    package_file: PACKAGE_FILE.to_string(),
                    output_file: RESULT_FILE.to_string(),
                    input_table: None,
                    partial: None,
                },
                &context.submit_options(),
                &context.registry,
            )
        })?;

        for warning in &report.warnings {
            warn!(prefix = %prefix, "{warning}");
        }
        let duration = started.elapsed();
        info!(
            prefix = %prefix,
            rows = report.rows,
            fit_ms = report.fit_millis,
            elapsed_ms = duration.as_millis() as u64,
            "Remote fit finished"
        );
        let search = estimator.search().and_then(|search| search.outcome().cloned());
        Ok(TrainingResult {
            estimator,
            mode: ExecutionMode::RemoteSingleNode,
            metrics: TrainingMetrics {
                duration,
                remote_duration: Some(Duration::from_millis(report.fit_millis)),
                rows: Some(report.rows),
                search,
                ..TrainingMetrics::default()
            },
            warnings: report.warnings,
        })
    }

    fn cleanup(&mut self) -> Result<(), TrainingError> {
        self.remote.staging.release_all()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.remote.base.cancel.clone()
    }
}
