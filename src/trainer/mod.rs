//! Training strategies behind one `train()`/`cleanup()` contract.
//!
//! [`TrainerBuilder`] inspects the dataset and the estimator's capabilities,
//! picks exactly one [`ExecutionMode`] and constructs the matching trainer.
//! Specification and mode errors surface here, before any remote resource is
//! created.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cancel::CancellationToken;
use crate::config::TrainingSettings;
use crate::dataset::{DatasetHandle, DatasetProfile, Table};
use crate::error::TrainingError;
use crate::estimator::{CapabilitySet, Estimator, EstimatorRegistry, Params, SearchOutcome};
use crate::session::{RequestPrefix, Session, SubmitOptions};
use crate::spec::{ModelSpecification, PredictionError, SpecError, predict_table};

pub mod dispatch;
pub mod driver;
pub mod external_memory;
pub mod local;
pub mod remote;
pub mod search;
pub mod staging;

pub use dispatch::{DispatchPolicy, select_mode};
pub use external_memory::ExternalMemoryTrainer;
pub use local::LocalTrainer;
pub use remote::RemoteTrainer;
pub use search::DistributedSearchTrainer;
pub use staging::StagingArea;

/// Strategy chosen for one training call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    RemoteSingleNode,
    DistributedSearch,
    ExternalMemory,
}

impl ExecutionMode {
    pub const ALL: [Self; 4] = [
        Self::Local,
        Self::RemoteSingleNode,
        Self::DistributedSearch,
        Self::ExternalMemory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::RemoteSingleNode => "remote_single_node",
            Self::DistributedSearch => "distributed_search",
            Self::ExternalMemory => "external_memory",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local" => Ok(Self::Local),
            "remote" | "remote_single_node" => Ok(Self::RemoteSingleNode),
            "search" | "distributed_search" => Ok(Self::DistributedSearch),
            "external" | "external_memory" => Ok(Self::ExternalMemory),
            other => Err(format!("unknown execution mode {other:?}")),
        }
    }
}

/// One failed distributed-search work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitFailure {
    /// Canonical combination index.
    pub candidate: usize,
    pub fold: usize,
    pub params: Params,
    pub message: String,
}

impl WorkUnitFailure {
    /// `(combination 2 {alpha=1}, fold 0): boom`
    pub fn describe(&self) -> String {
        format!(
            "(combination {} {{{}}}, fold {}): {}",
            self.candidate,
            crate::estimator::format_params(&self.params),
            self.fold,
            self.message
        )
    }

    pub fn describe_all(failures: &[Self]) -> String {
        failures
            .iter()
            .map(Self::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Facts gathered while training, beyond the fitted estimator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingMetrics {
    /// Wall time of the whole `train()` call.
    pub duration: Duration,
    /// Time spent inside remote routines, when any ran.
    pub remote_duration: Option<Duration>,
    /// Rows the estimator was fit on.
    pub rows: Option<u64>,
    /// Search work units submitted, excluding the refit.
    pub work_units: usize,
    pub failed_units: Vec<WorkUnitFailure>,
    /// External-memory chunks consumed.
    pub chunks: usize,
    /// Search summary with best parameters and cross-validation scores.
    pub search: Option<SearchOutcome>,
}

/// Fitted estimator plus metrics and warnings.
#[derive(Debug)]
pub struct TrainingResult {
    pub estimator: Box<dyn Estimator>,
    pub mode: ExecutionMode,
    pub metrics: TrainingMetrics,
    /// Non-fatal problems, such as tolerated work-unit failures.
    pub warnings: Vec<String>,
}

impl TrainingResult {
    pub fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, TrainingError> {
        Ok(self.estimator.predict(x)?)
    }

    /// Input table plus the specification's output columns.
    pub fn predict_table(
        &self,
        spec: &ModelSpecification,
        table: &Table,
    ) -> Result<Table, PredictionError> {
        predict_table(self.estimator.as_ref(), spec, table)
    }
}

/// One training strategy.
pub trait Trainer: Send {
    fn mode(&self) -> ExecutionMode;

    /// Run training. Staged resources are released before this returns,
    /// whether it succeeds or fails.
    fn train(&mut self) -> Result<TrainingResult, TrainingError>;

    /// Release anything still staged. Safe to call repeatedly.
    fn cleanup(&mut self) -> Result<(), TrainingError>;

    /// Token that aborts a running `train()` from another thread.
    fn cancellation_token(&self) -> CancellationToken;
}

/// Collaborators shared by every trainer of one training call.
pub(crate) struct TrainerContext {
    pub(crate) dataset: DatasetHandle,
    pub(crate) spec: ModelSpecification,
    pub(crate) estimator: Box<dyn Estimator>,
    pub(crate) settings: TrainingSettings,
    pub(crate) registry: Arc<EstimatorRegistry>,
    pub(crate) cancel: CancellationToken,
}

impl TrainerContext {
    pub(crate) fn check_cancelled(&self) -> Result<(), TrainingError> {
        if self.cancel.is_cancelled() {
            Err(TrainingError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            timeout: self.settings.submit_timeout(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Collaborators of the remote trainers.
pub(crate) struct RemoteContext {
    pub(crate) base: TrainerContext,
    pub(crate) session: Arc<dyn Session>,
    pub(crate) staging: StagingArea,
}

impl RemoteContext {
    fn new(base: TrainerContext, session: Arc<dyn Session>) -> Self {
        let prefix = RequestPrefix::new(&base.settings.staging_prefix);
        let staging = StagingArea::new(Arc::clone(&session), prefix);
        Self {
            base,
            session,
            staging,
        }
    }
}

/// Dispatcher: resolves the dataset, probes capabilities and picks a trainer.
pub struct TrainerBuilder {
    dataset: DatasetHandle,
    spec: ModelSpecification,
    estimator: Box<dyn Estimator>,
    session: Option<Arc<dyn Session>>,
    settings: TrainingSettings,
    mode_override: Option<ExecutionMode>,
    registry: Arc<EstimatorRegistry>,
    cancel: CancellationToken,
}

impl TrainerBuilder {
    pub fn new(dataset: DatasetHandle, spec: ModelSpecification, estimator: Box<dyn Estimator>) -> Self {
        Self {
            dataset,
            spec,
            estimator,
            session: None,
            settings: TrainingSettings::default(),
            mode_override: None,
            registry: Arc::new(EstimatorRegistry::with_builtins()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(mut self, session: Arc<dyn Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn settings(mut self, settings: TrainingSettings) -> Self {
        self.settings = settings.normalized();
        self
    }

    pub fn mode(mut self, mode: Option<ExecutionMode>) -> Self {
        self.mode_override = mode;
        self
    }

    /// Registry the substrate uses to rebuild estimators.
    pub fn registry(mut self, registry: Arc<EstimatorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The mode `build` would choose, without constructing a trainer.
    pub fn select(&self) -> Result<ExecutionMode, TrainingError> {
        self.spec.check_estimator(self.estimator.as_ref())?;
        let schema = self.dataset.resolve_schema(self.session.as_deref())?;
        for column in self.spec.training_columns() {
            if schema.field(&column).is_none() {
                return Err(SpecError::UnknownColumn(column).into());
            }
        }
        let profile: DatasetProfile = self
            .dataset
            .profile(self.session.as_deref(), &self.spec.training_columns())?;
        check_folds(self.estimator.as_ref(), profile.row_count)?;
        let capabilities = CapabilitySet::probe(self.estimator.as_ref());
        let policy = DispatchPolicy::from_settings(&self.settings);
        select_mode(&profile, &capabilities, &policy, self.mode_override)
    }

    pub fn build(self) -> Result<Box<dyn Trainer>, TrainingError> {
        let mode = self.select()?;
        info!(
            mode = %mode,
            estimator = self.spec.estimator_class(),
            overridden = self.mode_override.is_some(),
            "Selected execution mode"
        );
        let context = TrainerContext {
            dataset: self.dataset,
            spec: self.spec,
            estimator: self.estimator,
            settings: self.settings,
            registry: self.registry,
            cancel: self.cancel,
        };
        let trainer: Box<dyn Trainer> = match (mode, self.session) {
            (ExecutionMode::Local, session) => Box::new(LocalTrainer::new(context, session)),
            (mode, None) => {
                return Err(TrainingError::UnsupportedMode {
                    mode,
                    reason: "no substrate session".to_string(),
                });
            }
            (ExecutionMode::RemoteSingleNode, Some(session)) => {
                Box::new(RemoteTrainer::new(RemoteContext::new(context, session)))
            }
            (ExecutionMode::DistributedSearch, Some(session)) => {
                Box::new(DistributedSearchTrainer::new(RemoteContext::new(context, session)))
            }
            (ExecutionMode::ExternalMemory, Some(session)) => {
                Box::new(ExternalMemoryTrainer::new(RemoteContext::new(context, session)))
            }
        };
        Ok(trainer)
    }
}

/// Fold count of a search wrapper must split the known rows.
fn check_folds(estimator: &dyn Estimator, rows: Option<u64>) -> Result<(), SpecError> {
    let Some(search) = estimator.search() else {
        return Ok(());
    };
    let folds = search.n_folds();
    if folds < 2 {
        return Err(SpecError::TooFewFolds(folds));
    }
    match rows {
        Some(rows) if rows < folds as u64 => Err(SpecError::FoldsExceedRows { folds, rows }),
        _ => Ok(()),
    }
}

/// Build a trainer with default settings.
pub fn build_trainer(
    session: Option<Arc<dyn Session>>,
    dataset: DatasetHandle,
    spec: ModelSpecification,
    estimator: Box<dyn Estimator>,
    mode_override: Option<ExecutionMode>,
) -> Result<Box<dyn Trainer>, TrainingError> {
    let mut builder = TrainerBuilder::new(dataset, spec, estimator).mode(mode_override);
    if let Some(session) = session {
        builder = builder.session(session);
    }
    builder.build()
}
