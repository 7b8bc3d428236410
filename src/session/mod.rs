//! Contract with the query/compute substrate.
//!
//! Trainers only talk to the substrate through [`Session`]: table reads and
//! writes, file stages, package introspection and stored procedures. The
//! handle is passed explicitly to every trainer; nothing reaches it through
//! global state.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::dataset::{DatasetError, Schema, Table};

pub mod identifier;
mod procedure;
pub mod sqlite;

pub use identifier::RequestPrefix;
pub use procedure::{ProcedureContext, ProcedureError, StoredProcedure};
pub use sqlite::SqliteSession;

/// Errors reported by a substrate session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A remote dataset was referenced without a session.
    #[error("No substrate session available")]
    Unavailable,
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Table already exists: {0}")]
    TableExists(String),
    #[error("Stage not found: {0}")]
    StageNotFound(String),
    #[error("Stage already exists: {0}")]
    StageExists(String),
    #[error("File {file} not found in stage {stage}")]
    FileNotFound { stage: String, file: String },
    #[error("Procedure not registered: {0}")]
    ProcedureNotFound(String),
    /// Name is not usable for the requested object.
    #[error("Invalid object name: {0}")]
    InvalidName(String),
    /// The substrate rejected a value it cannot represent.
    #[error("Unsupported value in {table}.{column}")]
    UnsupportedValue { table: String, column: String },
    /// The stored procedure itself failed.
    #[error("Procedure {procedure} failed: {message}")]
    ProcedureFailed { procedure: String, message: String },
    #[error("Procedure {procedure} timed out after {after:?}")]
    Timeout { procedure: String, after: Duration },
    #[error("Procedure {procedure} was cancelled")]
    Cancelled { procedure: String },
    /// Database is locked or busy.
    #[error("Database is busy, please retry")]
    Busy,
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Could not access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to start procedure worker: {0}")]
    Spawn(std::io::Error),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl SessionError {
    /// Whether this error came from a caller or substrate cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// One stored-procedure invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    pub procedure: String,
    pub args: serde_json::Value,
}

impl ProcedureCall {
    pub fn new(procedure: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            procedure: procedure.into(),
            args,
        }
    }
}

/// Blocking-call controls for procedure submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Give up waiting after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Caller cancellation observed while waiting.
    pub cancel: CancellationToken,
}

/// Outcome of one call inside a batch, in submission order.
pub type CallOutcome = Result<serde_json::Value, SessionError>;

/// Operations the core consumes from the substrate.
///
/// A session may be shared by the trainers of one training call. Independent
/// calls use independent staging prefixes, see [`RequestPrefix`].
pub trait Session: Send + Sync {
    /// Column names and types of a table, without reading rows.
    fn describe_table(&self, table: &str) -> Result<Schema, SessionError>;

    /// Row count, `None` when the substrate cannot tell cheaply.
    fn row_count(&self, table: &str) -> Result<Option<u64>, SessionError>;

    /// Read columns (all when empty) of a row window in source order.
    fn read_table(
        &self,
        table: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<Table, SessionError>;

    /// Create `name` from an in-memory table. Fails when it already exists.
    fn write_table(&self, name: &str, table: &Table) -> Result<(), SessionError>;

    /// Create `target` from a column subset and row window of `source`,
    /// preserving source order. Returns the number of rows copied.
    fn copy_table(
        &self,
        source: &str,
        target: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<u64, SessionError>;

    /// Drop a table; `Ok(false)` when it did not exist.
    fn drop_table(&self, name: &str) -> Result<bool, SessionError>;

    fn list_tables(&self) -> Result<Vec<String>, SessionError>;

    /// Run ad-hoc SQL, returning affected rows.
    fn execute(&self, sql: &str) -> Result<usize, SessionError>;

    fn create_stage(&self, name: &str) -> Result<(), SessionError>;

    /// Drop a stage and its files; `Ok(false)` when it did not exist.
    fn drop_stage(&self, name: &str) -> Result<bool, SessionError>;

    fn list_stages(&self) -> Result<Vec<String>, SessionError>;

    /// Upload a file into an existing stage.
    fn put(&self, stage: &str, file: &str, bytes: &[u8]) -> Result<(), SessionError>;

    fn get(&self, stage: &str, file: &str) -> Result<Vec<u8>, SessionError>;

    /// Installed package versions keyed by canonical package name.
    fn installed_packages(&self) -> Result<BTreeMap<String, String>, SessionError>;

    fn register_procedure(
        &self,
        name: &str,
        procedure: Arc<dyn StoredProcedure>,
    ) -> Result<(), SessionError>;

    /// Remove a procedure; `Ok(false)` when it was not registered.
    fn drop_procedure(&self, name: &str) -> Result<bool, SessionError>;

    fn list_procedures(&self) -> Result<Vec<String>, SessionError>;

    /// Run one procedure and block until it returns, times out or is cancelled.
    fn call_procedure(
        &self,
        call: &ProcedureCall,
        options: &SubmitOptions,
    ) -> Result<serde_json::Value, SessionError>;

    /// Run a batch concurrently and block until every call has an outcome.
    ///
    /// Outcomes are returned in the order of `calls`. The outer error is used
    /// for batch-wide conditions: timeout or cancellation.
    fn call_procedures(
        &self,
        calls: &[ProcedureCall],
        options: &SubmitOptions,
    ) -> Result<Vec<CallOutcome>, SessionError>;
}
