//! Tabular data model shared by every trainer.
//!
//! Data lives either in memory ([`Table`]) or in the substrate behind a table
//! name. Both resolve to a [`Schema`] so column validation never needs the
//! full rows.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod handle;
mod table;
mod training_data;

pub use handle::{DatasetHandle, DatasetProfile, Locality};
pub use table::Table;
pub use training_data::TrainingData;
pub(crate) use training_data::feature_matrix;

/// Errors raised while shaping tabular data.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A referenced column does not exist.
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    /// The same column name appears twice in a schema.
    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),
    /// A row has a different number of values than the schema.
    #[error("Row {row} has {found} values, schema has {expected}")]
    RowWidth {
        /// Row index.
        row: usize,
        /// Number of values found.
        found: usize,
        /// Number of columns in the schema.
        expected: usize,
    },
    /// A value cannot be used as a number for training.
    #[error("Column {column} row {row} is not numeric")]
    NotNumeric {
        /// Column name.
        column: String,
        /// Row index.
        row: usize,
    },
    /// A label or weight value is missing.
    #[error("Column {column} row {row} is null")]
    NullValue {
        /// Column name.
        column: String,
        /// Row index.
        row: usize,
    },
}

/// Logical column type understood by every substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit float.
    Float,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text.
    Text,
}

impl ColumnType {
    /// Return true when values of this type can feed an estimator.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Float | Self::Integer)
    }

    /// Estimated width of one value in bytes, used for memory sizing.
    pub fn estimated_width(self) -> u64 {
        match self {
            Self::Float | Self::Integer => 8,
            Self::Text => 32,
        }
    }

    /// SQL type affinity name.
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Float => "REAL",
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
        }
    }

    /// Map a declared SQL type back to a column type using SQLite affinity rules.
    pub fn from_sql_name(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else {
            Self::Float
        }
    }
}

/// One cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing value.
    Null,
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Text value.
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Null | Self::Text(_) => None,
        }
    }

    /// Return true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column list of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(fields: Vec<Field>) -> Result<Self, DatasetError> {
        let mut seen = std::collections::BTreeSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(DatasetError::DuplicateColumn(field.name.clone()));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Field lookup by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Column names in schema order.
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    /// Sub-schema with the given columns, in the given order.
    pub fn project(&self, columns: &[String]) -> Result<Self, DatasetError> {
        let fields = columns
            .iter()
            .map(|name| {
                self.field(name)
                    .cloned()
                    .ok_or_else(|| DatasetError::UnknownColumn(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields)
    }

    /// Estimated bytes for one row of the given columns (all columns when empty).
    pub fn estimated_row_width(&self, columns: &[String]) -> u64 {
        let width: u64 = if columns.is_empty() {
            self.fields
                .iter()
                .map(|field| field.column_type.estimated_width())
                .sum()
        } else {
            columns
                .iter()
                .filter_map(|name| self.field(name))
                .map(|field| field.column_type.estimated_width())
                .sum()
        };
        width.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_rejects_duplicate_names() {
        let result = Schema::new(vec![
            Field::new("A", ColumnType::Float),
            Field::new("A", ColumnType::Integer),
        ]);
        assert!(matches!(result, Err(DatasetError::DuplicateColumn(name)) if name == "A"));
    }

    #[test]
    fn declared_sql_types_map_by_affinity() {
        assert_eq!(ColumnType::from_sql_name("BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_sql_name("varchar(10)"), ColumnType::Text);
        assert_eq!(ColumnType::from_sql_name("DOUBLE"), ColumnType::Float);
    }

    #[test]
    fn row_width_counts_only_selected_columns() {
        let schema = Schema::new(vec![
            Field::new("X", ColumnType::Float),
            Field::new("NAME", ColumnType::Text),
        ])
        .unwrap();
        assert_eq!(schema.estimated_row_width(&["X".to_string()]), 8);
        assert_eq!(schema.estimated_row_width(&[]), 40);
    }
}
