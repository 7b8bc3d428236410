//! Request-scoped staged resources.
//!
//! Every table, stage and procedure a trainer creates goes through a
//! [`StagingArea`], which names it under the request prefix and records it
//! before asking the substrate to create it. A creation that failed halfway
//! is therefore still dropped, unless the substrate reports the name was
//! already taken. Release runs in reverse creation order and is idempotent.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dataset::Table;
use crate::error::TrainingError;
use crate::session::{RequestPrefix, Session, SessionError, StoredProcedure};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Table(String),
    Stage(String),
    Procedure(String),
}

impl Resource {
    fn name(&self) -> &str {
        match self {
            Self::Table(name) | Self::Stage(name) | Self::Procedure(name) => name,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Table(name) => format!("table {name}"),
            Self::Stage(name) => format!("stage {name}"),
            Self::Procedure(name) => format!("procedure {name}"),
        }
    }

    fn release(&self, session: &dyn Session) -> Result<bool, SessionError> {
        match self {
            Self::Table(name) => session.drop_table(name),
            Self::Stage(name) => session.drop_stage(name),
            Self::Procedure(name) => session.drop_procedure(name),
        }
    }
}

pub struct StagingArea {
    session: Arc<dyn Session>,
    prefix: RequestPrefix,
    resources: Vec<Resource>,
}

impl std::fmt::Debug for StagingArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingArea")
            .field("prefix", &self.prefix)
            .field("resources", &self.resources)
            .finish()
    }
}

impl StagingArea {
    pub fn new(session: Arc<dyn Session>, prefix: RequestPrefix) -> Self {
        Self {
            session,
            prefix,
            resources: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &RequestPrefix {
        &self.prefix
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Names of resources still held, in creation order.
    pub fn held(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn track(&mut self, resource: Resource) {
        debug!(resource = %resource.describe(), "Staging");
        self.resources.push(resource);
    }

    /// Settle the creation of the resource tracked last.
    ///
    /// An "already exists" failure means the object belongs to someone else,
    /// so it is untracked instead of being dropped at release.
    fn created<T>(&mut self, result: Result<T, SessionError>) -> Result<T, TrainingError> {
        if let Err(SessionError::TableExists(_) | SessionError::StageExists(_)) = &result
            && let Some(resource) = self.resources.pop()
        {
            warn!(resource = %resource.describe(), "Name already taken; not tracking it");
        }
        result.map_err(TrainingError::from)
    }

    /// Upload an in-memory table as `<prefix>_<kind>`.
    pub fn write_table(&mut self, kind: &str, table: &Table) -> Result<String, TrainingError> {
        let name = self.prefix.object(kind);
        self.track(Resource::Table(name.clone()));
        let written = self.session.write_table(&name, table);
        self.created(written)?;
        Ok(name)
    }

    /// Copy a column subset and row window of `source` into a staged table.
    /// Returns the staged name and the number of rows copied.
    pub fn copy_table(
        &mut self,
        name: String,
        source: &str,
        columns: &[String],
        rows: Option<Range<u64>>,
    ) -> Result<(String, u64), TrainingError> {
        self.track(Resource::Table(name.clone()));
        let copied = self.session.copy_table(source, &name, columns, rows);
        let copied = self.created(copied)?;
        Ok((name, copied))
    }

    pub fn create_stage(&mut self, kind: &str) -> Result<String, TrainingError> {
        let name = self.prefix.object(kind);
        self.track(Resource::Stage(name.clone()));
        let created = self.session.create_stage(&name);
        self.created(created)?;
        Ok(name)
    }

    pub fn register_procedure(
        &mut self,
        kind: &str,
        procedure: Arc<dyn StoredProcedure>,
    ) -> Result<String, TrainingError> {
        let name = self.prefix.object(kind);
        self.track(Resource::Procedure(name.clone()));
        self.session.register_procedure(&name, procedure)?;
        Ok(name)
    }

    /// Release one resource now, ahead of the final cleanup.
    pub fn release(&mut self, name: &str) -> Result<(), TrainingError> {
        let Some(position) = self.resources.iter().position(|r| r.name() == name) else {
            return Ok(());
        };
        let resource = self.resources.remove(position);
        if let Err(err) = resource.release(self.session.as_ref()) {
            warn!(resource = %resource.describe(), error = %err, "Failed to release");
            self.resources.insert(position, resource);
            return Err(TrainingError::Cleanup(vec![name.to_string()]));
        }
        Ok(())
    }

    /// Release everything still held, newest first.
    ///
    /// Every resource is attempted even when an earlier one fails; the ones
    /// that failed stay held so a later call retries them.
    pub fn release_all(&mut self) -> Result<(), TrainingError> {
        let mut failed = Vec::new();
        while let Some(resource) = self.resources.pop() {
            match resource.release(self.session.as_ref()) {
                Ok(existed) => debug!(resource = %resource.describe(), existed, "Released"),
                Err(err) => {
                    warn!(resource = %resource.describe(), error = %err, "Failed to release");
                    failed.push(resource);
                }
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        let names = failed.iter().rev().map(|r| r.name().to_string()).collect();
        failed.reverse();
        self.resources = failed;
        Err(TrainingError::Cleanup(names))
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            warn!(prefix = self.prefix.as_str(), held = ?self.held(), "Releasing staged resources on drop");
            let _ = self.release_all();
        }
    }
}

/// Run `work`, then release everything staged, on success and failure alike.
///
/// A failure from `work` takes precedence over a cleanup failure. A cancelled
/// token turns any outcome into [`TrainingError::Cancelled`].
pub(crate) fn scoped<T>(
    staging: &mut StagingArea,
    cancel: &crate::cancel::CancellationToken,
    work: impl FnOnce(&mut StagingArea) -> Result<T, TrainingError>,
) -> Result<T, TrainingError> {
    let outcome = work(staging);
    let released = staging.release_all();
    if cancel.is_cancelled() {
        if let Err(err) = released {
            warn!(error = %err, "Cleanup after cancellation was incomplete");
        }
        return Err(TrainingError::Cancelled);
    }
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup)) => {
            warn!(error = %cleanup, "Cleanup after failure was incomplete");
            Err(err)
        }
    }
}
