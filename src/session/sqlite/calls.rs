//! Blocking procedure execution on worker threads.
//!
//! A call counts as submitted once its worker thread is spawned. On timeout or
//! cancellation the worker's abort token is tripped and the caller waits up to
//! [`ABORT_GRACE`] for it to acknowledge; a worker that ignores the abort is
//! detached and its late result discarded.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::SqliteSession;
use crate::cancel::CancellationToken;
use crate::session::{
    CallOutcome, ProcedureCall, ProcedureContext, ProcedureError, Session, SessionError,
    SubmitOptions,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub(super) const ABORT_GRACE: Duration = Duration::from_millis(500);

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

fn interrupted(options: &SubmitOptions, started: Instant) -> Option<Interrupt> {
    if options.cancel.is_cancelled() {
        return Some(Interrupt::Cancelled);
    }
    match options.timeout {
        Some(timeout) if started.elapsed() >= timeout => Some(Interrupt::TimedOut(timeout)),
        _ => None,
    }
}

fn interrupt_error(interrupt: Interrupt, procedure: &str) -> SessionError {
    match interrupt {
        Interrupt::Cancelled => SessionError::Cancelled {
            procedure: procedure.to_string(),
        },
        Interrupt::TimedOut(after) => SessionError::Timeout {
            procedure: procedure.to_string(),
            after,
        },
    }
}

/// Trip the abort token and give workers a moment to stop.
fn abort_workers(abort: &CancellationToken, workers: &[JoinHandle<()>]) {
    abort.cancel();
    let deadline = Instant::now() + ABORT_GRACE;
    while Instant::now() < deadline && workers.iter().any(|worker| !worker.is_finished()) {
        thread::sleep(POLL_INTERVAL);
    }
    let lingering = workers.iter().filter(|worker| !worker.is_finished()).count();
    if lingering > 0 {
        warn!(lingering, "Procedure workers did not acknowledge abort; detaching");
    }
}

/// Execute one call on the current thread.
fn run(session: &SqliteSession, call: &ProcedureCall, cancel: CancellationToken) -> CallOutcome {
    let procedure = session.procedure(&call.procedure)?;
    let ctx = ProcedureContext::new(
        call.procedure.clone(),
        Arc::new(session.clone()) as Arc<dyn Session>,
        cancel,
    );
    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| procedure.call(&ctx, call.args.clone())));
    debug!(
        procedure = %call.procedure,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = matches!(result, Ok(Ok(_))),
        "Procedure finished"
    );
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(ProcedureError::Cancelled)) => Err(SessionError::Cancelled {
            procedure: call.procedure.clone(),
        }),
        Ok(Err(err)) => Err(SessionError::ProcedureFailed {
            procedure: call.procedure.clone(),
            message: err.to_string(),
        }),
        Err(_) => Err(SessionError::ProcedureFailed {
            procedure: call.procedure.clone(),
            message: "procedure panicked".to_string(),
        }),
    }
}

fn spawn_worker(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, SessionError> {
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(SessionError::Spawn)
}

pub(super) fn call_one(
    session: &SqliteSession,
    call: &ProcedureCall,
    options: &SubmitOptions,
) -> Result<serde_json::Value, SessionError> {
    session.procedure(&call.procedure)?;
    let abort = options.cancel.child();
    let (tx, rx) = mpsc::channel();
    let worker = {
        let session = session.clone();
        let call = call.clone();
        let cancel = abort.clone();
        spawn_worker(format!("rf-proc-{}", call.procedure), move || {
            let _ = tx.send(run(&session, &call, cancel));
        })?
    };
    let started = Instant::now();
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(outcome) => return outcome,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SessionError::ProcedureFailed {
                    procedure: call.procedure.clone(),
                    message: "worker exited without a result".to_string(),
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(interrupt) = interrupted(options, started) {
                    abort_workers(&abort, std::slice::from_ref(&worker));
                    return Err(interrupt_error(interrupt, &call.procedure));
                }
            }
        }
    }
}

pub(super) fn call_batch(
    session: &SqliteSession,
    calls: &[ProcedureCall],
    options: &SubmitOptions,
) -> Result<Vec<CallOutcome>, SessionError> {
    if calls.is_empty() {
        return Ok(Vec::new());
    }
    let calls: Arc<Vec<ProcedureCall>> = Arc::new(calls.to_vec());
    let next = Arc::new(AtomicUsize::new(0));
    let abort = options.cancel.child();
    let (tx, rx) = mpsc::channel::<(usize, CallOutcome)>();
    let width = session.max_concurrent().min(calls.len());
    debug!(units = calls.len(), width, "Submitting procedure batch");

    let mut workers = Vec::with_capacity(width);
    for worker_idx in 0..width {
        let session = session.clone();
        let calls = Arc::clone(&calls);
        let next = Arc::clone(&next);
        let worker_abort = abort.clone();
        let tx = tx.clone();
        let spawned = spawn_worker(format!("rf-batch-{worker_idx}"), move || {
            let abort = worker_abort;
            loop {
                if abort.is_cancelled() {
                    break;
                }
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(call) = calls.get(idx) else {
                    break;
                };
                let outcome = run(&session, call, abort.child());
                if tx.send((idx, outcome)).is_err() {
                    break;
                }
            }
        });
        match spawned {
            Ok(worker) => workers.push(worker),
            Err(err) => {
                abort_workers(&abort, &workers);
                return Err(err);
            }
        }
    }
    drop(tx);
    collect(&rx, calls.len(), options, &abort, &workers, &calls[0].procedure)
}

fn collect(
    rx: &Receiver<(usize, CallOutcome)>,
    total: usize,
    options: &SubmitOptions,
    abort: &CancellationToken,
    workers: &[JoinHandle<()>],
    label: &str,
) -> Result<Vec<CallOutcome>, SessionError> {
    let mut slots: Vec<Option<CallOutcome>> = (0..total).map(|_| None).collect();
    let mut received = 0usize;
    let started = Instant::now();
    while received < total {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((idx, outcome)) => {
                if slots[idx].replace(outcome).is_none() {
                    received += 1;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(interrupt) = interrupted(options, started) {
                    return Err(interrupt_error(interrupt, label));
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if received < total
            && let Some(interrupt) = interrupted(options, started)
        {
            abort_workers(abort, workers);
            return Err(interrupt_error(interrupt, label));
        }
    }
    Ok(slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                Err(SessionError::ProcedureFailed {
                    procedure: label.to_string(),
                    message: "worker exited without a result".to_string(),
                })
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StoredProcedure;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};

    struct Echo;
    impl StoredProcedure for Echo {
        fn call(
            &self,
            _ctx: &ProcedureContext,
            args: serde_json::Value,
        ) -> Result<serde_json::Value, ProcedureError> {
            Ok(args)
        }
    }

    /// Sleeps for `args.ms` milliseconds, polling for abort.
    struct Sleepy {
        aborted: Arc<AtomicUsize>,
    }
    impl StoredProcedure for Sleepy {
        fn call(
            &self,
            ctx: &ProcedureContext,
            args: serde_json::Value,
        ) -> Result<serde_json::Value, ProcedureError> {
            let ms = args["ms"].as_u64().unwrap_or(0);
            let started = Instant::now();
            while started.elapsed() < Duration::from_millis(ms) {
                if ctx.checkpoint().is_err() {
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(ProcedureError::Cancelled);
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(args)
        }
    }

    struct Failing;
    impl StoredProcedure for Failing {
        fn call(
            &self,
            _ctx: &ProcedureContext,
            args: serde_json::Value,
        ) -> Result<serde_json::Value, ProcedureError> {
            if args["fail"].as_bool().unwrap_or(false) {
                Err(ProcedureError::Failed("boom".into()))
            } else {
                Ok(args)
            }
        }
    }

    fn session() -> (TempDir, SqliteSession, Arc<AtomicUsize>) {
        let dir = tempdir().unwrap();
        let session = SqliteSession::open_in_memory(dir.path())
            .unwrap()
            .with_max_concurrent(3);
        let aborted = Arc::new(AtomicUsize::new(0));
        session.register_procedure("ECHO", Arc::new(Echo)).unwrap();
        session
            .register_procedure(
                "SLEEPY",
                Arc::new(Sleepy {
                    aborted: Arc::clone(&aborted),
                }),
            )
            .unwrap();
        session.register_procedure("FAILING", Arc::new(Failing)).unwrap();
        (dir, session, aborted)
    }

    #[test]
    fn single_call_returns_value() {
        let (_dir, session, _) = session();
        let out = session
            .call_procedure(
                &ProcedureCall::new("ECHO", json!({"a": 1})),
                &SubmitOptions::default(),
            )
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
        assert!(matches!(
            session.call_procedure(&ProcedureCall::new("NOPE", json!(null)), &SubmitOptions::default()),
            Err(SessionError::ProcedureNotFound(_))
        ));
    }

    #[test]
    fn batch_outcomes_follow_submission_order() {
        let (_dir, session, _) = session();
        let calls: Vec<ProcedureCall> = (0..6u64)
            .map(|i| ProcedureCall::new("SLEEPY", json!({"ms": (6 - i) * 10, "i": i})))
            .collect();
        let outcomes = session.call_procedures(&calls, &SubmitOptions::default()).unwrap();
        let order: Vec<u64> = outcomes
            .iter()
            .map(|outcome| outcome.as_ref().unwrap()["i"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn failures_stay_per_call() {
        let (_dir, session, _) = session();
        let calls = vec![
            ProcedureCall::new("FAILING", json!({"fail": false})),
            ProcedureCall::new("FAILING", json!({"fail": true})),
            ProcedureCall::new("NOPE", json!({})),
        ];
        let outcomes = session.call_procedures(&calls, &SubmitOptions::default()).unwrap();
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            &outcomes[1],
            Err(SessionError::ProcedureFailed { message, .. }) if message == "boom"
        ));
        assert!(matches!(&outcomes[2], Err(SessionError::ProcedureNotFound(_))));
    }

    #[test]
    fn timeout_aborts_running_procedure() {
        let (_dir, session, aborted) = session();
        let options = SubmitOptions {
            timeout: Some(Duration::from_millis(50)),
            ..SubmitOptions::default()
        };
        let err = session
            .call_procedure(&ProcedureCall::new("SLEEPY", json!({"ms": 5_000})), &options)
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caller_cancellation_stops_the_batch() {
        let (_dir, session, aborted) = session();
        let options = SubmitOptions::default();
        let cancel = options.cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let calls: Vec<ProcedureCall> = (0..6)
            .map(|_| ProcedureCall::new("SLEEPY", json!({"ms": 5_000})))
            .collect();
        let err = session.call_procedures(&calls, &options).unwrap_err();
        canceller.join().unwrap();
        assert!(err.is_cancelled());
        assert_eq!(aborted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn batch_submitted_after_cancellation_reports_cancelled() {
        let (_dir, session, _) = session();
        let options = SubmitOptions::default();
        options.cancel.cancel();
        let calls: Vec<ProcedureCall> = (0..4)
            .map(|i| ProcedureCall::new("ECHO", json!({"i": i})))
            .collect();
        let err = session.call_procedures(&calls, &options).unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");
    }
}
