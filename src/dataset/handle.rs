use serde::{Deserialize, Serialize};

use super::{Schema, Table};
use crate::session::{Session, SessionError};

/// Where the rows of a dataset live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    /// Rows are held by the caller.
    InMemory,
    /// Rows live in the substrate behind a table name.
    Remote,
}

/// Reference to training data.
#[derive(Debug, Clone)]
pub enum DatasetHandle {
    /// Fully materialized rows.
    InMemory(Table),
    /// A table or view inside the substrate.
    Remote {
        /// Table or view name.
        table: String,
        /// Caller-supplied row estimate; the substrate is asked when absent.
        approx_rows: Option<u64>,
    },
}

impl DatasetHandle {
    pub fn in_memory(table: Table) -> Self {
        Self::InMemory(table)
    }

    pub fn remote(table: impl Into<String>) -> Self {
        Self::Remote {
            table: table.into(),
            approx_rows: None,
        }
    }

    /// Attach a row-count estimate to a remote handle. No-op for in-memory data.
    pub fn with_row_estimate(self, rows: u64) -> Self {
        match self {
            Self::Remote { table, .. } => Self::Remote {
                table,
                approx_rows: Some(rows),
            },
            other => other,
        }
    }

    pub fn locality(&self) -> Locality {
        match self {
            Self::InMemory(_) => Locality::InMemory,
            Self::Remote { .. } => Locality::Remote,
        }
    }

    /// Remote table name, if any.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Self::InMemory(_) => None,
            Self::Remote { table, .. } => Some(table),
        }
    }

    /// Resolve the schema without pulling rows for remote data.
    pub fn resolve_schema(&self, session: Option<&dyn Session>) -> Result<Schema, SessionError> {
        match self {
            Self::InMemory(table) => Ok(table.schema().clone()),
            Self::Remote { table, .. } => {
                let session = session.ok_or(SessionError::Unavailable)?;
                session.describe_table(table)
            }
        }
    }

    /// Size facts the dispatcher consults.
    ///
    /// `columns` restricts the row-width estimate to the columns training reads.
    pub fn profile(
        &self,
        session: Option<&dyn Session>,
        columns: &[String],
    ) -> Result<DatasetProfile, SessionError> {
        let schema = self.resolve_schema(session)?;
        let row_width = schema.estimated_row_width(columns);
        let row_count = match self {
            Self::InMemory(table) => Some(table.num_rows() as u64),
            Self::Remote {
                approx_rows: Some(rows),
                ..
            } => Some(*rows),
            Self::Remote { table, .. } => match session {
                Some(session) => session.row_count(table)?,
                None => None,
            },
        };
        Ok(DatasetProfile {
            locality: self.locality(),
            row_count,
            estimated_bytes: row_count.map(|rows| rows.saturating_mul(row_width)),
            substrate_available: session.is_some(),
        })
    }
}

/// Locality and size summary of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetProfile {
    pub locality: Locality,
    /// Row count when known.
    pub row_count: Option<u64>,
    /// Estimated in-memory size of the training columns.
    pub estimated_bytes: Option<u64>,
    /// Whether a substrate session accompanies the request.
    pub substrate_available: bool,
}

impl DatasetProfile {
    /// Whether the data exceeds a memory threshold. Unknown sizes count as exceeding.
    pub fn exceeds(&self, threshold_bytes: u64) -> bool {
        self.estimated_bytes
            .is_none_or(|bytes| bytes > threshold_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_profile_counts_rows() {
        let table = Table::from_f64_columns(&[("A", vec![1.0, 2.0]), ("B", vec![0.0, 1.0])])
            .unwrap();
        let profile = DatasetHandle::in_memory(table)
            .profile(None, &["A".to_string()])
            .unwrap();
        assert_eq!(profile.locality, Locality::InMemory);
        assert_eq!(profile.row_count, Some(2));
        assert_eq!(profile.estimated_bytes, Some(16));
        assert!(!profile.substrate_available);
    }

    #[test]
    fn remote_schema_requires_session() {
        let handle = DatasetHandle::remote("TRAIN");
        assert!(matches!(
            handle.resolve_schema(None),
            Err(SessionError::Unavailable)
        ));
    }

    #[test]
    fn unknown_size_exceeds_any_threshold() {
        let profile = DatasetProfile {
            locality: Locality::Remote,
            row_count: None,
            estimated_bytes: None,
            substrate_available: true,
        };
        assert!(profile.exceeds(u64::MAX));
    }
}
