use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;

use super::{Session, SessionError};
use crate::cancel::CancellationToken;
use crate::dataset::{Schema, Table};

/// Failure raised inside a stored procedure.
#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Aborted")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<serde_json::Error> for ProcedureError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

/// Routine registered with the substrate and executed there.
pub trait StoredProcedure: Send + Sync {
    fn call(
        &self,
        ctx: &ProcedureContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ProcedureError>;
}

/// What a running procedure can see: substrate data and its abort signal.
pub struct ProcedureContext {
    procedure: String,
    session: Arc<dyn Session>,
    cancel: CancellationToken,
}

impl fmt::Debug for ProcedureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureContext")
            .field("procedure", &self.procedure)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ProcedureContext {
    pub fn new(
        procedure: impl Into<String>,
        session: Arc<dyn Session>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            session,
            cancel,
        }
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Cancelled)` once an abort was requested.
    pub fn checkpoint(&self) -> Result<(), ProcedureError> {
        if self.is_cancelled() {
            Err(ProcedureError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn describe_table(&self, table: &str) -> Result<Schema, ProcedureError> {
        Ok(self.session.describe_table(table)?)
    }

    pub fn read_table(
        &self,
        table: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<Table, ProcedureError> {
        self.checkpoint()?;
        Ok(self.session.read_table(table, columns, rows)?)
    }

    pub fn get(&self, stage: &str, file: &str) -> Result<Vec<u8>, ProcedureError> {
        Ok(self.session.get(stage, file)?)
    }

    pub fn put(&self, stage: &str, file: &str, bytes: &[u8]) -> Result<(), ProcedureError> {
        self.checkpoint()?;
        Ok(self.session.put(stage, file, bytes)?)
    }
}
