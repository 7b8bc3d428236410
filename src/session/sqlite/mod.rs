//! SQLite-backed substrate.
//!
//! Tables live in one SQLite database, stages are directories under a stage
//! root, and stored procedures run on worker threads that reach the data only
//! through a [`ProcedureContext`](super::ProcedureContext).

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rusqlite::Connection;
use tracing::warn;

use super::{
    CallOutcome, ProcedureCall, Session, SessionError, StoredProcedure, SubmitOptions,
};
use crate::dataset::{Schema, Table};

mod calls;
mod packages;
mod stages;
mod tables;

/// Packages every fresh substrate reports as installed.
pub const BUILTIN_PACKAGES: &[&str] = &["remotefit", "remotefit-linear", "remotefit-boost"];

/// Default number of procedures a batch runs at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Cheap-to-clone handle; clones share the connection, stages and procedures.
#[derive(Clone)]
pub struct SqliteSession {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Mutex<Connection>,
    stage_root: PathBuf,
    procedures: RwLock<BTreeMap<String, Arc<dyn StoredProcedure>>>,
    max_concurrent: usize,
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("stage_root", &self.inner.stage_root)
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish()
    }
}

impl SqliteSession {
    /// Open (or create) a database file, with stages under `stage_root`.
    pub fn open(db_path: impl AsRef<Path>, stage_root: impl AsRef<Path>) -> Result<Self, SessionError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|source| SessionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let connection = Connection::open(db_path)?;
        connection
            .execute_batch(
                "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA temp_store=MEMORY;",
            )
            .map_err(map_sql_error)?;
        Self::from_connection(connection, stage_root.as_ref())
    }

    /// Database held in memory, stages still on disk.
    pub fn open_in_memory(stage_root: impl AsRef<Path>) -> Result<Self, SessionError> {
        let connection = Connection::open_in_memory()?;
        Self::from_connection(connection, stage_root.as_ref())
    }

    fn from_connection(connection: Connection, stage_root: &Path) -> Result<Self, SessionError> {
        std::fs::create_dir_all(stage_root).map_err(|source| SessionError::Io {
            path: stage_root.to_path_buf(),
            source,
        })?;
        packages::apply_schema(&connection)?;
        Ok(Self {
            inner: Arc::new(Inner {
                connection: Mutex::new(connection),
                stage_root: stage_root.to_path_buf(),
                procedures: RwLock::new(BTreeMap::new()),
                max_concurrent: DEFAULT_MAX_CONCURRENT,
            }),
        })
    }

    /// Same substrate with a different batch width. Only valid before the
    /// handle is cloned.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.max_concurrent = max_concurrent.max(1);
        } else {
            warn!("Session already shared; keeping batch width {}", self.inner.max_concurrent);
        }
        self
    }

    pub fn stage_root(&self) -> &Path {
        &self.inner.stage_root
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Record a package version in the substrate environment.
    pub fn install_package(&self, name: &str, version: &str) -> Result<(), SessionError> {
        packages::install(&self.lock_connection(), name, version)
    }

    /// Remove a package from the substrate environment.
    pub fn uninstall_package(&self, name: &str) -> Result<bool, SessionError> {
        packages::uninstall(&self.lock_connection(), name)
    }

    fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        self.inner.connection.lock().unwrap_or_else(|poisoned| {
            warn!("Session connection lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }

    fn procedure(&self, name: &str) -> Result<Arc<dyn StoredProcedure>, SessionError> {
        let procedures = self
            .inner
            .procedures
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        procedures
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::ProcedureNotFound(name.to_string()))
    }
}

impl Session for SqliteSession {
    fn describe_table(&self, table: &str) -> Result<Schema, SessionError> {
        tables::describe(&self.lock_connection(), table)
    }

    fn row_count(&self, table: &str) -> Result<Option<u64>, SessionError> {
        tables::row_count(&self.lock_connection(), table).map(Some)
    }

    fn read_table(
        &self,
        table: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<Table, SessionError> {
        tables::read(&self.lock_connection(), table, columns, rows)
    }

    fn write_table(&self, name: &str, table: &Table) -> Result<(), SessionError> {
        tables::write(&mut self.lock_connection(), name, table)
    }

    fn copy_table(
        &self,
        source: &str,
        target: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<u64, SessionError> {
        tables::copy(&self.lock_connection(), source, target, columns, rows)
    }

    fn drop_table(&self, name: &str) -> Result<bool, SessionError> {
        tables::drop(&self.lock_connection(), name)
    }

    fn list_tables(&self) -> Result<Vec<String>, SessionError> {
        tables::list(&self.lock_connection())
    }

    fn execute(&self, sql: &str) -> Result<usize, SessionError> {
        self.lock_connection()
            .execute(sql, [])
            .map_err(map_sql_error)
    }

    fn create_stage(&self, name: &str) -> Result<(), SessionError> {
        stages::create(&self.inner.stage_root, name)
    }

    fn drop_stage(&self, name: &str) -> Result<bool, SessionError> {
        stages::remove(&self.inner.stage_root, name)
    }

    fn list_stages(&self) -> Result<Vec<String>, SessionError> {
        stages::list(&self.inner.stage_root)
    }

    fn put(&self, stage: &str, file: &str, bytes: &[u8]) -> Result<(), SessionError> {
        stages::put(&self.inner.stage_root, stage, file, bytes)
    }

    fn get(&self, stage: &str, file: &str) -> Result<Vec<u8>, SessionError> {
        stages::get(&self.inner.stage_root, stage, file)
    }

    fn installed_packages(&self) -> Result<BTreeMap<String, String>, SessionError> {
        packages::list(&self.lock_connection())
    }

    fn register_procedure(
        &self,
        name: &str,
        procedure: Arc<dyn StoredProcedure>,
    ) -> Result<(), SessionError> {
        if !super::identifier::is_plain_identifier(name) {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        self.inner
            .procedures
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), procedure);
        Ok(())
    }

    fn drop_procedure(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self
            .inner
            .procedures
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some())
    }

    fn list_procedures(&self) -> Result<Vec<String>, SessionError> {
        Ok(self
            .inner
            .procedures
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    fn call_procedure(
        &self,
        call: &ProcedureCall,
        options: &SubmitOptions,
    ) -> Result<serde_json::Value, SessionError> {
        calls::call_one(self, call, options)
    }

    fn call_procedures(
        &self,
        calls: &[ProcedureCall],
        options: &SubmitOptions,
    ) -> Result<Vec<CallOutcome>, SessionError> {
        calls::call_batch(self, calls, options)
    }
}

/// Translate rusqlite errors into friendlier session variants.
pub(super) fn map_sql_error(err: rusqlite::Error) -> SessionError {
    match err {
        rusqlite::Error::SqliteFailure(sql_err, _)
            if sql_err.extended_code == rusqlite::ffi::SQLITE_BUSY =>
        {
            SessionError::Busy
        }
        other => SessionError::Sql(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_database_persists_tables_and_packages() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("data").join("substrate.db");
        let stages = dir.path().join("stages");
        {
            let session = SqliteSession::open(&db_path, &stages).unwrap();
            let table = Table::from_f64_columns(&[("A", vec![1.0, 2.0])]).unwrap();
            session.write_table("T", &table).unwrap();
            session.install_package("xgboost", "1.8").unwrap();
        }
        let reopened = SqliteSession::open(&db_path, &stages).unwrap();
        assert_eq!(reopened.row_count("T").unwrap(), Some(2));
        assert_eq!(
            reopened.installed_packages().unwrap().get("xgboost"),
            Some(&"1.8".to_string())
        );
    }

    #[test]
    fn batch_width_is_adjustable_before_sharing() {
        let dir = tempdir().unwrap();
        let session = SqliteSession::open_in_memory(dir.path())
            .unwrap()
            .with_max_concurrent(0);
        assert_eq!(session.max_concurrent(), 1);
    }

    #[test]
    fn procedure_names_must_be_identifiers() {
        struct Noop;
        impl StoredProcedure for Noop {
            fn call(
                &self,
                _ctx: &super::super::ProcedureContext,
                args: serde_json::Value,
            ) -> Result<serde_json::Value, super::super::ProcedureError> {
                Ok(args)
            }
        }
        let dir = tempdir().unwrap();
        let session = SqliteSession::open_in_memory(dir.path()).unwrap();
        assert!(matches!(
            session.register_procedure("bad name", Arc::new(Noop)),
            Err(SessionError::InvalidName(_))
        ));
        session.register_procedure("RF_NOOP", Arc::new(Noop)).unwrap();
        assert_eq!(session.list_procedures().unwrap(), vec!["RF_NOOP".to_string()]);
        assert!(session.drop_procedure("RF_NOOP").unwrap());
        assert!(!session.drop_procedure("RF_NOOP").unwrap());
    }
}
