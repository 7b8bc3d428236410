//! In-process fit against fully materialized rows.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use super::{ExecutionMode, Trainer, TrainerContext, TrainingMetrics, TrainingResult};
use crate::cancel::CancellationToken;
use crate::dataset::{DatasetHandle, Table, TrainingData};
use crate::error::TrainingError;
use crate::session::{Session, SessionError};

pub struct LocalTrainer {
    context: TrainerContext,
    /// Only needed to materialize a remote table.
    session: Option<Arc<dyn Session>>,
}

impl LocalTrainer {
    pub(crate) fn new(context: TrainerContext, session: Option<Arc<dyn Session>>) -> Self {
        Self { context, session }
    }

    fn materialize(&self) -> Result<Table, TrainingError> {
        let columns = self.context.spec.training_columns();
        match &self.context.dataset {
            DatasetHandle::InMemory(table) => Ok(table.select(&columns)?),
            DatasetHandle::Remote { table, .. } => {
                let session = self.session.as_ref().ok_or(SessionError::Unavailable)?;
                Ok(session.read_table(table, &columns, None)?)
            }
        }
    }
}

impl Trainer for LocalTrainer {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Local
    }

    fn train(&mut self) -> Result<TrainingResult, TrainingError> {
        let started = Instant::now();
        self.context.check_cancelled()?;
        let table = self.materialize()?;
        let spec = &self.context.spec;
        let data = TrainingData::from_table(
            &table,
            spec.input_cols(),
            spec.label_cols(),
            spec.sample_weight_col(),
        )?;
        self.context.check_cancelled()?;

        let mut estimator = self.context.estimator.boxed_clone();
        let fitted = if spec.is_fit_method_partial() {
            estimator.partial_fit(&data)
        } else {
            estimator.fit(&data)
        };
        fitted.map_err(|source| TrainingError::LocalFit {
            rows: data.n_rows(),
            columns: table.num_columns(),
            source,
        })?;
        self.context.check_cancelled()?;

        let duration = started.elapsed();
        info!(
            estimator = spec.estimator_class(),
            rows = data.n_rows(),
            elapsed_ms = duration.as_millis() as u64,
            "Local fit finished"
        );
        let search = estimator.search().and_then(|search| search.outcome().cloned());
        Ok(TrainingResult {
            estimator,
            mode: ExecutionMode::Local,
            metrics: TrainingMetrics {
                duration,
                rows: Some(data.n_rows() as u64),
                search,
                ..TrainingMetrics::default()
            },
            warnings: Vec::new(),
        })
    }

    fn cleanup(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }
}
