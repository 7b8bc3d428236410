#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use remotefit::dataset::{Schema, Table};
use remotefit::session::{
    CallOutcome, ProcedureCall, Session, SessionError, StoredProcedure, SubmitOptions,
};
use remotefit::SqliteSession;
use tempfile::TempDir;

type CallFault = Box<dyn Fn(&ProcedureCall) -> bool + Send + Sync>;

/// Session wrapper that fails chosen operations and counts submissions.
pub struct FaultInjectingSession {
    inner: SqliteSession,
    call_faults: Mutex<Vec<CallFault>>,
    copy_faults: Mutex<Vec<String>>,
    submitted: AtomicUsize,
}

impl FaultInjectingSession {
    pub fn new(inner: SqliteSession) -> Self {
        Self {
            inner,
            call_faults: Mutex::new(Vec::new()),
            copy_faults: Mutex::new(Vec::new()),
            submitted: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &SqliteSession {
        &self.inner
    }

    /// Fail every procedure call `matches` accepts.
    pub fn fail_calls(&self, matches: impl Fn(&ProcedureCall) -> bool + Send + Sync + 'static) {
        self.call_faults.lock().unwrap().push(Box::new(matches));
    }

    /// Fail copies whose target name ends with `suffix`.
    pub fn fail_copy_to(&self, suffix: &str) {
        self.copy_faults.lock().unwrap().push(suffix.to_string());
    }

    /// Procedure calls submitted so far, batch members included.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    fn faulted(&self, call: &ProcedureCall) -> bool {
        self.call_faults
            .lock()
            .unwrap()
            .iter()
            .any(|fault| fault(call))
    }

    fn injected(call: &ProcedureCall) -> SessionError {
        SessionError::ProcedureFailed {
            procedure: call.procedure.clone(),
            message: "injected failure".to_string(),
        }
    }
}

impl Session for FaultInjectingSession {
    fn describe_table(&self, table: &str) -> Result<Schema, SessionError> {
        self.inner.describe_table(table)
    }

    fn row_count(&self, table: &str) -> Result<Option<u64>, SessionError> {
        self.inner.row_count(table)
    }

    fn read_table(
        &self,
        table: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<Table, SessionError> {
        self.inner.read_table(table, columns, rows)
    }

    fn write_table(&self, name: &str, table: &Table) -> Result<(), SessionError> {
        self.inner.write_table(name, table)
    }

    fn copy_table(
        &self,
        source: &str,
        target: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<u64, SessionError> {
        let faulted = self
            .copy_faults
            .lock()
            .unwrap()
            .iter()
            .any(|suffix| target.ends_with(suffix.as_str()));
        if faulted {
            return Err(SessionError::Busy);
        }
        self.inner.copy_table(source, target, columns, rows)
    }

    fn drop_table(&self, name: &str) -> Result<bool, SessionError> {
        self.inner.drop_table(name)
    }

    fn list_tables(&self) -> Result<Vec<String>, SessionError> {
        self.inner.list_tables()
    }

    fn execute(&self, sql: &str) -> Result<usize, SessionError> {
        self.inner.execute(sql)
    }

    fn create_stage(&self, name: &str) -> Result<(), SessionError> {
        self.inner.create_stage(name)
    }

    fn drop_stage(&self, name: &str) -> Result<bool, SessionError> {
        self.inner.drop_stage(name)
    }

    fn list_stages(&self) -> Result<Vec<String>, SessionError> {
        self.inner.list_stages()
    }

    fn put(&self, stage: &str, file: &str, bytes: &[u8]) -> Result<(), SessionError> {
        self.inner.put(stage, file, bytes)
    }

    fn get(&self, stage: &str, file: &str) -> Result<Vec<u8>, SessionError> {
        self.inner.get(stage, file)
    }

    fn installed_packages(&self) -> Result<BTreeMap<String, String>, SessionError> {
        self.inner.installed_packages()
    }

    fn register_procedure(
        &self,
        name: &str,
        procedure: Arc<dyn StoredProcedure>,
    ) -> Result<(), SessionError> {
        self.inner.register_procedure(name, procedure)
    }

    fn drop_procedure(&self, name: &str) -> Result<bool, SessionError> {
        self.inner.drop_procedure(name)
    }

    fn list_procedures(&self) -> Result<Vec<String>, SessionError> {
        self.inner.list_procedures()
    }

    fn call_procedure(
        &self,
        call: &ProcedureCall,
        options: &SubmitOptions,
    ) -> Result<serde_json::Value, SessionError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if self.faulted(call) {
            return Err(Self::injected(call));
        }
        self.inner.call_procedure(call, options)
    }

    fn call_procedures(
        &self,
        calls: &[ProcedureCall],
        options: &SubmitOptions,
    ) -> Result<Vec<CallOutcome>, SessionError> {
        self.submitted.fetch_add(calls.len(), Ordering::SeqCst);
        let faulted: Vec<bool> = calls.iter().map(|call| self.faulted(call)).collect();
        let passed: Vec<ProcedureCall> = calls
            .iter()
            .zip(&faulted)
            .filter(|(_, faulted)| !**faulted)
            .map(|(call, _)| call.clone())
            .collect();
        let mut outcomes = self.inner.call_procedures(&passed, options)?.into_iter();
        Ok(calls
            .iter()
            .zip(faulted)
            .map(|(call, faulted)| {
                if faulted {
                    Err(Self::injected(call))
                } else {
                    outcomes
                        .next()
                        .unwrap_or_else(|| Err(SessionError::ProcedureNotFound(call.procedure.clone())))
                }
            })
            .collect())
    }
}

/// Fresh in-memory substrate with its stage root in a temp dir.
pub fn substrate() -> (TempDir, SqliteSession) {
    let dir = tempfile::tempdir().unwrap();
    let session = SqliteSession::open_in_memory(dir.path().join("stages")).unwrap();
    (dir, session)
}

/// `rows` rows of `X1`, `X2` and `Y = 2*X1 - X2 + 3`.
pub fn linear_table(rows: usize) -> Table {
    let x1: Vec<f64> = (0..rows).map(|i| i as f64 / 10.0).collect();
    let x2: Vec<f64> = (0..rows).map(|i| ((i * 7) % 13) as f64).collect();
    let y = x1.iter().zip(&x2).map(|(a, b)| 2.0 * a - b + 3.0).collect();
    Table::from_f64_columns(&[("X1", x1), ("X2", x2), ("Y", y)]).unwrap()
}

/// Objects a training call may have staged under prefix `RF`.
pub fn staged_objects(session: &dyn Session) -> Vec<String> {
    let mut names: Vec<String> = session
        .list_tables()
        .unwrap()
        .into_iter()
        .chain(session.list_stages().unwrap())
        .chain(session.list_procedures().unwrap())
        .filter(|name| name.starts_with("RF_"))
        .collect();
    names.sort();
    names
}

pub fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
