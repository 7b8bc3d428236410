//! Chunked incremental fitting for data that does not fit in memory.
//!
//! The source is copied into the substrate one row window at a time. Each
//! chunk is fed to `partial_fit` through the fit procedure, which reads the
//! previous chunk's fitted package and writes the next one. A chunk table is
//! dropped as soon as its unit finishes, so at most one is staged at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::driver::{FitProcedure, FitReport, FitRequest};
use super::remote::{PACKAGE_FILE, RESULT_FILE, prepare_package, run_fit};
use super::staging::scoped;
use super::{ExecutionMode, RemoteContext, StagingArea, Trainer, TrainingMetrics, TrainingResult};
use crate::cancel::CancellationToken;
use crate::dataset::DatasetHandle;
use crate::error::TrainingError;
use crate::estimator::{Estimator, EstimatorRegistry};
use crate::session::SubmitOptions;

pub struct ExternalMemoryTrainer {
    remote: RemoteContext,
}

impl ExternalMemoryTrainer {
    pub(crate) fn new(remote: RemoteContext) -> Self {
        Self { remote }
    }
}

/// What the chunk loop produced.
struct ChunkRun {
    estimator: Box<dyn Estimator>,
    chunks: usize,
    rows: u64,
    fit_millis: u64,
    warnings: Vec<String>,
}

/// Everything one chunk unit needs besides its index.
struct ChunkPlan<'a> {
    source: &'a str,
    columns: &'a [String],
    chunk_rows: u64,
    stage: &'a str,
    procedure: &'a str,
    options: &'a SubmitOptions,
    registry: &'a EstimatorRegistry,
}

impl ChunkPlan<'_> {
    /// Copy chunk `index` and fit on it. Returns `None` once the source is
    /// exhausted. The chunk table is released before returning either way.
    fn run(
        &self,
        staging: &mut StagingArea,
        index: usize,
    ) -> Result<Option<(Box<dyn Estimator>, FitReport, u64)>, TrainingError> {
        let start = index as u64 * self.chunk_rows;
        let name = staging.prefix().numbered("chunk", index);
        let outcome = self.copy_and_fit(staging, name.clone(), index, start);
        let released = staging.release(&name);
        let outcome = outcome.map_err(|err| chunk_failure(index, err))?;
        released?;
        Ok(outcome)
    }

    fn copy_and_fit(
        &self,
        staging: &mut StagingArea,
        name: String,
        index: usize,
        start: u64,
    ) -> Result<Option<(Box<dyn Estimator>, FitReport, u64)>, TrainingError> {
        let (chunk, copied) =
            staging.copy_table(name, self.source, self.columns, Some(start..start + self.chunk_rows))?;
        if copied == 0 {
            return Ok(None);
        }
        debug!(chunk = index, rows = copied, table = %chunk, "Fitting chunk");
        let package_file = if index == 0 { PACKAGE_FILE } else { RESULT_FILE };
        let (estimator, report) = run_fit(
            staging,
            self.procedure,
            FitRequest {
                stage: self.stage.to_string(),
                package_file: package_file.to_string(),
                output_file: RESULT_FILE.to_string(),
                input_table: Some(chunk),
                partial: Some(true),
            },
            self.options,
            self.registry,
        )?;
        Ok(Some((estimator, report, copied)))
    }
}

fn chunk_failure(chunk_index: usize, err: TrainingError) -> TrainingError {
    match err {
        TrainingError::Cancelled => TrainingError::Cancelled,
        TrainingError::RemoteExecution { message, .. } => {
            TrainingError::ChunkFailed { chunk_index, message }
        }
        other => TrainingError::ChunkFailed {
            chunk_index,
            message: other.to_string(),
        },
    }
}

impl Trainer for ExternalMemoryTrainer {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::ExternalMemory
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
        let columns = context.spec.training_columns();
        let schema = context.dataset.resolve_schema(Some(session.as_ref()))?;
        let chunk_rows = context
            .settings
            .chunk_rows_for(schema.estimated_row_width(&columns));
        let prefix = staging.prefix().as_str().to_string();
        info!(prefix = %prefix, chunk_rows, "External-memory fit starting");

        let run = scoped(staging, &context.cancel, |staging| {
            let source = match &context.dataset {
                DatasetHandle::Remote { table, .. } => table.clone(),
                DatasetHandle::InMemory(table) => staging.write_table("input", &table.select(&columns)?)?,
            };
            let stage = staging.create_stage("stage")?;
            staging.session().put(&stage, PACKAGE_FILE, &package.to_bytes()?)?;
            let procedure = staging.register_procedure(
                "fit",
                Arc::new(FitProcedure::new(Arc::clone(&context.registry))),
            )?;
            let options = context.submit_options();
            let plan = ChunkPlan {
                source: &source,
                columns: &columns,
                chunk_rows,
                stage: &stage,
                procedure: &procedure,
                options: &options,
                registry: &context.registry,
            };

            let mut fitted = None;
            let mut chunks = 0;
            let mut rows = 0;
            let mut fit_millis = 0;
            let mut warnings = Vec::new();
            loop {
                context.check_cancelled()?;
                let Some((estimator, report, copied)) = plan.run(staging, chunks)? else {
                    break;
                };
                rows += copied;
                fit_millis += report.fit_millis;
                warnings.extend(
                    report
                        .warnings
                        .into_iter()
                        .map(|warning| format!("chunk {chunks}: {warning}")),
                );
                fitted = Some(estimator);
                chunks += 1;
                if copied < chunk_rows {
                    break;
                }
            }
            let estimator = fitted.ok_or_else(|| TrainingError::EmptyDataset(source.clone()))?;
            Ok(ChunkRun {
                estimator,
                chunks,
                rows,
                fit_millis,
                warnings,
            })
        })?;

        for warning in &run.warnings {
            warn!(prefix = %prefix, "{warning}");
        }
        let duration = started.elapsed();
        info!(
            prefix = %prefix,
            chunks = run.chunks,
            rows = run.rows,
            elapsed_ms = duration.as_millis() as u64,
            "External-memory fit finished"
        );
        Ok(TrainingResult {
            estimator: run.estimator,
            mode: ExecutionMode::ExternalMemory,
            metrics: TrainingMetrics {
                duration,
                remote_duration: Some(Duration::from_millis(run.fit_millis)),
                rows: Some(run.rows),
                chunks: run.chunks,
                ..TrainingMetrics::default()
            },
            warnings: run.warnings,
        })
    }

    fn cleanup(&mut self) -> Result<(), TrainingError> {
        self.remote.staging.release_all()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.remote.base.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionError;

    #[test]
    fn chunk_failures_keep_their_index() {
        let err = chunk_failure(
            3,
            TrainingError::RemoteExecution {
                procedure: "RF_FIT".into(),
                message: "boom".into(),
            },
        );
        assert!(matches!(
            err,
            TrainingError::ChunkFailed { chunk_index: 3, ref message } if message == "boom"
        ));
        let err = chunk_failure(1, TrainingError::Session(SessionError::Busy));
        assert!(matches!(err, TrainingError::ChunkFailed { chunk_index: 1, .. }));
        assert!(matches!(chunk_failure(0, TrainingError::Cancelled), TrainingError::Cancelled));
    }
}
