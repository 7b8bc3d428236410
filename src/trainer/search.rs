//! Distributed hyperparameter search.
//!
//! Every (combination, fold) pair becomes one independent work unit scored by
//! a stored procedure. Scores are ranked locally with [`aggregate`], so the
//! outcome does not depend on the order units complete in. The winner is
//! refit once on the full staged input and installed into a copy of the
//! search wrapper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::driver::{FitProcedure, FitRequest, ScoreProcedure, ScoreReport, ScoreRequest};
use super::remote::{PACKAGE_FILE, RESULT_FILE, prepare_package, remote_failure, run_fit, stage_input};
use super::staging::scoped;
use super::{
    ExecutionMode, RemoteContext, Trainer, TrainingMetrics, TrainingResult, WorkUnitFailure,
};
use crate::cancel::CancellationToken;
use crate::error::TrainingError;
use crate::estimator::search::{FoldScore, aggregate};
use crate::estimator::{Estimator, Params, Scoring};
use crate::package::PackageError;
use crate::session::{CallOutcome, ProcedureCall, SessionError};

const REFIT_FILE: &str = "refit.json";

pub struct DistributedSearchTrainer {
    remote: RemoteContext,
}

impl DistributedSearchTrainer {
    pub(crate) fn new(remote: RemoteContext) -> Self {
        Self { remote }
    }
}

/// Search settings read off the wrapper before anything is staged.
struct SearchPlan {
    base: Box<dyn Estimator>,
    candidates: Vec<Params>,
    n_folds: usize,
    scoring: Scoring,
    refit: bool,
}

impl SearchPlan {
    fn from_estimator(estimator: &dyn Estimator) -> Result<Self, TrainingError> {
        let wrapper = estimator.search().ok_or_else(|| TrainingError::UnsupportedMode {
            mode: ExecutionMode::DistributedSearch,
            reason: format!("{} is not a search wrapper", estimator.class_name()),
        })?;
        let candidates = wrapper.candidates()?;
        if candidates.is_empty() {
            return Err(TrainingError::DistributedTraining {
                failed: Vec::new(),
                total_units: 0,
            });
        }
        Ok(Self {
            base: wrapper.base_estimator().boxed_clone(),
            candidates,
            n_folds: wrapper.n_folds(),
            scoring: wrapper.scoring(),
            refit: wrapper.refit(),
        })
    }

    fn total_units(&self) -> usize {
        self.candidates.len() * self.n_folds
    }

    /// Units in canonical order: combination-major, fold-minor.
    fn requests(&self, stage: &str) -> Vec<ScoreRequest> {
        self.candidates
            .iter()
            .enumerate()
            .flat_map(|(candidate, params)| {
                (0..self.n_folds).map(move |fold| ScoreRequest {
                    stage: stage.to_string(),
                    package_file: PACKAGE_FILE.to_string(),
                    candidate,
                    fold,
                    n_folds: self.n_folds,
                    scoring: self.scoring,
                    params: params.clone(),
                })
            })
            .collect()
    }
}

/// Split unit outcomes into usable scores and failures.
///
/// A unit whose score is not finite counts as produced but unranked, not as a
/// failure. Cancellation of any unit cancels the whole search.
fn collect_scores(
    requests: &[ScoreRequest],
    outcomes: Vec<CallOutcome>,
) -> Result<(Vec<FoldScore>, Vec<WorkUnitFailure>), TrainingError> {
    let mut scores = Vec::with_capacity(requests.len());
    let mut failures = Vec::new();
    for (request, outcome) in requests.iter().zip(outcomes) {
        let failure = |message: String| WorkUnitFailure {
            candidate: request.candidate,
            fold: request.fold,
            params: request.params.clone(),
            message,
        };
        match outcome {
            Ok(value) => match serde_json::from_value::<ScoreReport>(value) {
                Ok(report) => scores.push(FoldScore {
                    candidate: request.candidate,
                    fold: request.fold,
                    score: report.score.unwrap_or(f64::NAN),
                }),
                Err(err) => failures.push(failure(format!("unreadable score report: {err}"))),
            },
            Err(SessionError::Cancelled { .. }) => return Err(TrainingError::Cancelled),
            Err(SessionError::ProcedureFailed { message, .. }) => failures.push(failure(message)),
            Err(other) => failures.push(failure(other.to_string())),
        }
    }
    Ok((scores, failures))
}

impl Trainer for DistributedSearchTrainer {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::DistributedSearch
    }

    fn train(&mut self) -> Result<TrainingResult, TrainingError> {
        let started = Instant::now();
        let RemoteContext {
            base: context,
            session,
            staging,
        } = &mut self.remote;
        context.check_cancelled()?;
        let plan = SearchPlan::from_estimator(context.estimator.as_ref())?;
        let package = prepare_package(context, session.as_ref(), plan.base.as_ref())?;
        let total_units = plan.total_units();
        let allowed = context.settings.failure_tolerance.allowed(total_units);
        let prefix = staging.prefix().as_str().to_string();
        info!(
            prefix = %prefix,
            candidates = plan.candidates.len(),
            folds = plan.n_folds,
            units = total_units,
            allowed_failures = allowed,
            "Distributed search starting"
        );

        let (outcome, failures, refit) = scoped(staging, &context.cancel, |staging| {
            let input = stage_input(staging, &context.dataset, &context.spec.training_columns())?;
            let stage = staging.create_stage("stage")?;
            let package = package.with_staged_input(input);
            staging.session().put(&stage, PACKAGE_FILE, &package.to_bytes()?)?;
            let score_procedure = staging.register_procedure(
                "score",
                Arc::new(ScoreProcedure::new(Arc::clone(&context.registry))),
            )?;
            context.check_cancelled()?;

            let requests = plan.requests(&stage);
            let calls = requests
                .iter()
                .map(|request| {
                    serde_json::to_value(request)
                        .map(|args| ProcedureCall::new(score_procedure.as_str(), args))
                        .map_err(PackageError::from)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let options = context.submit_options();
            let mut outcomes = Vec::with_capacity(calls.len());
            for wave in calls.chunks(context.settings.max_concurrent_units) {
                context.check_cancelled()?;
                outcomes.extend(
                    staging
                        .session()
                        .call_procedures(wave, &options)
                        .map_err(|err| remote_failure(&score_procedure, err))?,
                );
            }
            let (scores, failures) = collect_scores(&requests, outcomes)?;
            if failures.len() > allowed {
                return Err(TrainingError::DistributedTraining {
                    failed: failures,
                    total_units,
                });
            }
            let Some(outcome) = aggregate(&plan.candidates, plan.n_folds, &scores, plan.scoring)
            else {
                return Err(TrainingError::DistributedTraining {
                    failed: failures,
                    total_units,
                });
            };
            context.check_cancelled()?;

            let refit = if plan.refit {
                let mut best = plan.base.boxed_clone();
                best.set_params(&outcome.best_params)?;
                let refit_package = package.with_estimator(best.as_ref())?;
                staging.session().put(&stage, REFIT_FILE, &refit_package.to_bytes()?)?;
                let fit_procedure = staging.register_procedure(
                    "fit",
                    Arc::new(FitProcedure::new(Arc::clone(&context.registry))),
                )?;
                let (estimator, report) = run_fit(
                    staging,
                    &fit_procedure,
                    FitRequest {
                        stage: stage.clone(),
                        package_file: REFIT_FILE.to_string(),
                        output_file: RESULT_FILE.to_string(),
                        input_table: None,
                        partial: Some(false),
                    },
                    &options,
                    &context.registry,
                )?;
                Some((estimator, report))
            } else {
                None
            };
            Ok((outcome, failures, refit))
        })?;

        let mut warnings = Vec::new();
        if !failures.is_empty() {
            let warning = format!(
                "{} of {} work units failed: {}",
                failures.len(),
                total_units,
                WorkUnitFailure::describe_all(&failures)
            );
            warn!(prefix = %prefix, "{warning}");
            warnings.push(warning);
        }

        let (best_estimator, remote_duration, rows) = match refit {
            Some((estimator, report)) => {
                for warning in &report.warnings {
                    warn!(prefix = %prefix, "{warning}");
                }
                warnings.extend(report.warnings);
                (
                    Some(estimator),
                    Some(Duration::from_millis(report.fit_millis)),
                    Some(report.rows),
                )
            }
            None => (None, None, None),
        };
        let mut estimator = context.estimator.boxed_clone();
        let wrapper = estimator.search_mut().ok_or_else(|| TrainingError::UnsupportedMode {
            mode: ExecutionMode::DistributedSearch,
            reason: "search wrapper disappeared".to_string(),
        })?;
        wrapper.install(outcome.clone(), best_estimator)?;

        let duration = started.elapsed();
        info!(
            prefix = %prefix,
            best_index = outcome.best_index,
            best_score = outcome.best_score,
            failed_units = failures.len(),
            elapsed_ms = duration.as_millis() as u64,
            "Distributed search finished"
        );
        Ok(TrainingResult {
            estimator,
            mode: ExecutionMode::DistributedSearch,
            metrics: TrainingMetrics {
                duration,
                remote_duration,
                rows,
                work_units: total_units,
                failed_units: failures,
                search: Some(outcome),
                ..TrainingMetrics::default()
            },
            warnings,
        })
    }

    fn cleanup(&mut self) -> Result<(), TrainingError> {
        self.remote.staging.release_all()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.remote.base.cancel.clone()
    }
}
