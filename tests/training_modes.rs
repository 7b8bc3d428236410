mod support;

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use remotefit::estimator::search::{FoldScore, aggregate};
use remotefit::estimator::{
    BoostedStumps, GridSearchCV, ParamGrid, ParamValue, Params, RidgeRegression, Scoring,
};
use remotefit::session::{ProcedureCall, Session};
use remotefit::{
    CancellationToken, DatasetHandle, Estimator, ExecutionMode, FailureTolerance,
    ModelSpecification, Trainer, TrainerBuilder, TrainingError, TrainingSettings,
};
use serde_json::json;
use support::{FaultInjectingSession, linear_table, staged_objects, substrate};

fn spec_for(session: &dyn Session, estimator: &dyn Estimator) -> ModelSpecification {
    ModelSpecification::builder(estimator)
        .input_cols(["X1", "X2"])
        .label_cols(["Y"])
        .build(&session.describe_table("TRAIN").unwrap())
        .unwrap()
}

fn remote_trainer(
    session: Arc<dyn Session>,
    estimator: Box<dyn Estimator>,
    settings: TrainingSettings,
    mode: Option<ExecutionMode>,
) -> Box<dyn Trainer> {
    let spec = spec_for(session.as_ref(), estimator.as_ref());
    TrainerBuilder::new(DatasetHandle::remote("TRAIN"), spec, estimator)
        .session(session)
        .settings(settings)
        .mode(mode)
        .build()
        .unwrap()
}

fn alpha_search() -> GridSearchCV {
    let mut grid = ParamGrid::new();
    grid.insert(
        "alpha".into(),
        vec![ParamValue::Float(0.1), ParamValue::Float(1.0), ParamValue::Float(10.0)],
    );
    GridSearchCV::new(Box::new(RidgeRegression::default()), grid, 2, Scoring::R2)
}

fn first_rows(count: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|i| vec![i as f32 / 10.0, ((i * 7) % 13) as f32])
        .collect()
}

#[test]
fn small_remote_table_trains_on_a_single_node() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(100)).unwrap();
    let session: Arc<dyn Session> = Arc::new(sqlite.clone());
    let mut trainer = remote_trainer(
        session,
        Box::new(RidgeRegression::default()),
        TrainingSettings::default(),
        None,
    );
    assert_eq!(trainer.mode(), ExecutionMode::RemoteSingleNode);

    let result = trainer.train().unwrap();
    assert_eq!(result.metrics.rows, Some(100));
    assert!(result.estimator.is_fitted());
    let predicted = result.predict(&first_rows(5)).unwrap();
    assert_eq!(predicted.len(), 5);
    assert!(staged_objects(&sqlite).is_empty());

    trainer.cleanup().unwrap();
    trainer.cleanup().unwrap();
}

#[test]
fn local_and_remote_fits_predict_alike() {
    let (_dir, sqlite) = substrate();
    let table = linear_table(60);
    sqlite.write_table("TRAIN", &table).unwrap();
    let ridge = RidgeRegression::new(0.5);

    let spec = spec_for(&sqlite, &ridge);
    let mut local = TrainerBuilder::new(DatasetHandle::in_memory(table), spec.clone(), Box::new(ridge.clone()))
        .build()
        .unwrap();
    assert_eq!(local.mode(), ExecutionMode::Local);
    let local = local.train().unwrap();

    let mut remote = remote_trainer(
        Arc::new(sqlite.clone()),
        Box::new(ridge),
        TrainingSettings::default(),
        None,
    );
    let remote = remote.train().unwrap();

    let rows = first_rows(8);
    let a = local.predict(&rows).unwrap();
    let b = remote.predict(&rows).unwrap();
    for (left, right) in a.iter().zip(&b) {
        assert!((left[0] - right[0]).abs() < 1e-4, "{left:?} vs {right:?}");
    }

    let scored = remote.predict_table(&spec, &linear_table(3)).unwrap();
    assert_eq!(scored.num_rows(), 3);
    assert!(scored.schema().field("OUTPUT_Y").is_some());
}

#[test]
fn tolerated_search_failure_is_reported_as_warning() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(100)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    faulty.fail_calls(|call: &ProcedureCall| {
        call.args.get("candidate") == Some(&json!(1)) && call.args.get("fold") == Some(&json!(0))
    });
    let settings = TrainingSettings {
        failure_tolerance: FailureTolerance::MaxFailedUnits(1),
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(faulty.clone(), Box::new(alpha_search()), settings, None);
    assert_eq!(trainer.mode(), ExecutionMode::DistributedSearch);

    let result = trainer.train().unwrap();
    assert_eq!(result.metrics.work_units, 6);
    assert_eq!(result.metrics.failed_units.len(), 1);
    assert_eq!(result.warnings.len(), 1);
    assert!(
        result.warnings[0].contains("(combination 1 {alpha=1}, fold 0)"),
        "{}",
        result.warnings[0]
    );
    let search = result.metrics.search.as_ref().unwrap();
    assert_eq!(search.cv_results.len(), 3);
    assert_eq!(search.cv_results[1].fold_scores[0], None);
    assert!(result.predict(&first_rows(2)).unwrap().len() == 2);
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn search_failures_beyond_tolerance_fail_the_call() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(100)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    faulty.fail_calls(|call: &ProcedureCall| call.args.get("fold") == Some(&json!(1)));
    let mut trainer = remote_trainer(
        faulty,
        Box::new(alpha_search()),
        TrainingSettings::default(),
        Some(ExecutionMode::DistributedSearch),
    );
    let err = trainer.train().unwrap_err();
    match err {
        TrainingError::DistributedTraining { failed, total_units } => {
            assert_eq!(total_units, 6);
            let pairs: Vec<(usize, usize)> = failed.iter().map(|f| (f.candidate, f.fold)).collect();
            assert_eq!(pairs, vec![(0, 1), (1, 1), (2, 1)]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn failing_chunk_stops_training_and_leaves_nothing_staged() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(40)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    faulty.fail_calls(|call: &ProcedureCall| {
        call.args
            .get("input_table")
            .and_then(|table| table.as_str())
            .is_some_and(|table| table.ends_with("_CHUNK_3"))
    });
    let settings = TrainingSettings {
        chunk_rows: 10,
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(
        faulty.clone(),
        Box::new(BoostedStumps::default()),
        settings,
        Some(ExecutionMode::ExternalMemory),
    );
    let err = trainer.train().unwrap_err();
    assert!(
        matches!(err, TrainingError::ChunkFailed { chunk_index: 3, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(faulty.submitted(), 4);
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn chunked_fit_consumes_every_chunk() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(40)).unwrap();
    let settings = TrainingSettings {
        chunk_rows: 10,
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(
        Arc::new(sqlite.clone()),
        Box::new(BoostedStumps::default()),
        settings,
        Some(ExecutionMode::ExternalMemory),
    );
    let result = trainer.train().unwrap();
    assert_eq!(result.metrics.chunks, 4);
    assert_eq!(result.metrics.rows, Some(40));
    assert_eq!(result.predict(&first_rows(5)).unwrap().len(), 5);
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn chunk_copy_failure_is_attributed_to_its_chunk() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(40)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    faulty.fail_copy_to("_CHUNK_2");
    let settings = TrainingSettings {
        chunk_rows: 10,
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(
        faulty,
        Box::new(BoostedStumps::default()),
        settings,
        Some(ExecutionMode::ExternalMemory),
    );
    let err = trainer.train().unwrap_err();
    assert!(matches!(err, TrainingError::ChunkFailed { chunk_index: 2, .. }));
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn environment_mismatch_is_detected_before_submission() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(50)).unwrap();
    sqlite.install_package("xgboost", "1.8.0").unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    let settings = TrainingSettings {
        extra_requirements: vec!["xgboost>=2.0,<3.0".to_string()],
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(
        faulty.clone(),
        Box::new(RidgeRegression::default()),
        settings,
        None,
    );
    let err = trainer.train().unwrap_err();
    match err {
        TrainingError::EnvironmentMismatch {
            package, installed, ..
        } => {
            assert_eq!(package, "xgboost");
            assert_eq!(installed.as_deref(), Some("1.8.0"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(faulty.submitted(), 0);
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn cancellation_during_submission_cleans_up() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(50)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    faulty.fail_calls(move |_| {
        trigger.cancel();
        false
    });
    let estimator = Box::new(RidgeRegression::default());
    let spec = spec_for(&sqlite, estimator.as_ref());
    let mut trainer = TrainerBuilder::new(DatasetHandle::remote("TRAIN"), spec, estimator)
        .session(faulty)
        .cancellation(cancel)
        .build()
        .unwrap();
    let err = trainer.train().unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(staged_objects(&sqlite).is_empty());
    trainer.cleanup().unwrap();
}

#[test]
fn cancelled_before_start_stages_nothing() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(20)).unwrap();
    let mut trainer = remote_trainer(
        Arc::new(sqlite.clone()),
        Box::new(RidgeRegression::default()),
        TrainingSettings::default(),
        None,
    );
    trainer.cancellation_token().cancel();
    assert!(trainer.train().unwrap_err().is_cancelled());
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn search_cancelled_between_waves_stops_and_cleans_up() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(60)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    let settings = TrainingSettings {
        max_concurrent_units: 2,
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(
        faulty.clone(),
        Box::new(alpha_search()),
        settings,
        Some(ExecutionMode::DistributedSearch),
    );
    let trigger = trainer.cancellation_token();
    faulty.fail_calls(move |call: &ProcedureCall| {
        if call.args.get("candidate") == Some(&json!(1)) {
            trigger.cancel();
        }
        false
    });

    let err = trainer.train().unwrap_err();
    assert!(
        matches!(err, TrainingError::Cancelled),
        "unexpected error: {err}"
    );
    assert_eq!(faulty.submitted(), 4);
    assert!(staged_objects(&sqlite).is_empty());
    trainer.cleanup().unwrap();
}

#[test]
fn chunked_fit_cancelled_midway_reports_cancelled() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(40)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    let settings = TrainingSettings {
        chunk_rows: 10,
        ..TrainingSettings::default()
    };
    let mut trainer = remote_trainer(
        faulty.clone(),
        Box::new(BoostedStumps::default()),
        settings,
        Some(ExecutionMode::ExternalMemory),
    );
    let trigger = trainer.cancellation_token();
    faulty.fail_calls(move |call: &ProcedureCall| {
        let on_second_chunk = call
            .args
            .get("input_table")
            .and_then(|table| table.as_str())
            .is_some_and(|table| table.ends_with("_CHUNK_1"));
        if on_second_chunk {
            trigger.cancel();
        }
        false
    });

    let err = trainer.train().unwrap_err();
    assert!(
        matches!(err, TrainingError::Cancelled),
        "unexpected error: {err}"
    );
    assert_eq!(faulty.submitted(), 2);
    assert!(staged_objects(&sqlite).is_empty());
    trainer.cleanup().unwrap();
}

#[test]
fn search_folds_are_checked_before_anything_is_staged() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(20)).unwrap();
    let faulty = Arc::new(FaultInjectingSession::new(sqlite.clone()));
    for cv in [0, 1, 21] {
        let mut grid = ParamGrid::new();
        grid.insert("alpha".into(), vec![ParamValue::Float(0.1), ParamValue::Float(1.0)]);
        let search = GridSearchCV::new(Box::new(RidgeRegression::default()), grid, cv, Scoring::R2);
        let spec = spec_for(&sqlite, &search);
        let session: Arc<dyn Session> = faulty.clone();
        let result = TrainerBuilder::new(DatasetHandle::remote("TRAIN"), spec, Box::new(search))
            .session(session)
            .mode(Some(ExecutionMode::DistributedSearch))
            .build();
        match result {
            Err(TrainingError::InvalidSpecification(_)) => {}
            Err(other) => panic!("cv={cv}: unexpected error: {other}"),
            Ok(_) => panic!("cv={cv}: trainer was built"),
        }
    }
    assert_eq!(faulty.submitted(), 0);
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn concurrent_calls_use_separate_prefixes() {
    let (_dir, sqlite) = substrate();
    sqlite.write_table("TRAIN", &linear_table(50)).unwrap();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let mut trainer = remote_trainer(
                Arc::new(sqlite.clone()),
                Box::new(RidgeRegression::default()),
                TrainingSettings::default(),
                None,
            );
            std::thread::spawn(move || trainer.train().map(|result| result.metrics.rows))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), Some(50));
    }
    assert!(staged_objects(&sqlite).is_empty());
}

#[test]
fn search_ranking_ignores_completion_order() {
    let candidates: Vec<Params> = [0.1, 1.0, 10.0, 100.0]
        .iter()
        .map(|alpha| {
            let mut params = Params::new();
            params.insert("alpha".into(), ParamValue::Float(*alpha));
            params
        })
        .collect();
    let mut scores: Vec<FoldScore> = (0..4)
        .flat_map(|candidate| {
            (0..3).map(move |fold| FoldScore {
                candidate,
                fold,
                score: if candidate == 3 { f64::NAN } else { 0.5 + (candidate % 2) as f64 * 0.1 },
            })
        })
        .collect();
    let expected = aggregate(&candidates, 3, &scores, Scoring::R2).unwrap();
    assert_eq!(expected.best_index, 1);
    assert_eq!(expected.cv_results[3].rank, None);

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        scores.shuffle(&mut rng);
        assert_eq!(aggregate(&candidates, 3, &scores, Scoring::R2).unwrap(), expected);
    }
}
