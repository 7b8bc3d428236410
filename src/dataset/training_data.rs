use serde::{Deserialize, Serialize};

use super::{DatasetError, Table};

/// Dense numeric view handed to estimators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    /// Feature matrix, row-major.
    pub x: Vec<Vec<f32>>,
    /// Targets, one vector of label values per row.
    pub y: Vec<Vec<f32>>,
    /// Optional per-row weights aligned with `x`.
    pub sample_weight: Option<Vec<f32>>,
}

impl TrainingData {
    /// Extract features, labels and weights from a table.
    ///
    /// Missing feature values become `NaN`; missing labels or weights are an error.
    pub fn from_table(
        table: &Table,
        input_cols: &[String],
        label_cols: &[String],
        sample_weight_col: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let x = feature_matrix(table, input_cols)?;
        let y = strict_matrix(table, label_cols)?;
        let sample_weight = match sample_weight_col {
            Some(column) => Some(
                strict_matrix(table, &[column.to_string()])?
                    .into_iter()
                    .map(|row| row[0])
                    .collect(),
            ),
            None => None,
        };
        Ok(Self {
            x,
            y,
            sample_weight,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.x.len()
    }

    pub fn n_features(&self) -> usize {
        self.x.first().map(Vec::len).unwrap_or(0)
    }

    pub fn n_targets(&self) -> usize {
        self.y.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// First target column, the common single-output case.
    pub fn first_target(&self) -> Vec<f32> {
        self.y.iter().map(|row| row.first().copied().unwrap_or(f32::NAN)).collect()
    }

    /// Weight for a row, `1.0` when unweighted.
    pub fn weight(&self, row: usize) -> f32 {
        self.sample_weight
            .as_ref()
            .and_then(|weights| weights.get(row).copied())
            .unwrap_or(1.0)
    }

    /// Rows at the given indices, in index order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            x: indices.iter().map(|&idx| self.x[idx].clone()).collect(),
            y: indices.iter().map(|&idx| self.y[idx].clone()).collect(),
            sample_weight: self
                .sample_weight
                .as_ref()
                .map(|weights| indices.iter().map(|&idx| weights[idx]).collect()),
        }
    }
}

/// Feature matrix for prediction; nulls become `NaN`.
pub(crate) fn feature_matrix(
    table: &Table,
    columns: &[String],
) -> Result<Vec<Vec<f32>>, DatasetError> {
    let indices = column_indices(table, columns)?;
    let mut out = Vec::with_capacity(table.num_rows());
    for (row_idx, row) in table.rows().iter().enumerate() {
        let mut values = Vec::with_capacity(indices.len());
        for (&col_idx, name) in indices.iter().zip(columns) {
            let value = &row[col_idx];
            if value.is_null() {
                values.push(f32::NAN);
                continue;
            }
            let number = value.as_f64().ok_or_else(|| DatasetError::NotNumeric {
                column: name.clone(),
                row: row_idx,
            })?;
            values.push(number as f32);
        }
        out.push(values);
    }
    Ok(out)
}

fn strict_matrix(table: &Table, columns: &[String]) -> Result<Vec<Vec<f32>>, DatasetError> {
    let indices = column_indices(table, columns)?;
    let mut out = Vec::with_capacity(table.num_rows());
    for (row_idx, row) in table.rows().iter().enumerate() {
        let mut values = Vec::with_capacity(indices.len());
        for (&col_idx, name) in indices.iter().zip(columns) {
            let value = &row[col_idx];
            if value.is_null() {
                return Err(DatasetError::NullValue {
                    column: name.clone(),
                    row: row_idx,
                });
            }
            let number = value.as_f64().ok_or_else(|| DatasetError::NotNumeric {
                column: name.clone(),
                row: row_idx,
            })?;
            values.push(number as f32);
        }
        out.push(values);
    }
    Ok(out)
}

fn column_indices(table: &Table, columns: &[String]) -> Result<Vec<usize>, DatasetError> {
    columns
        .iter()
        .map(|name| {
            table
                .schema()
                .index_of(name)
                .ok_or_else(|| DatasetError::UnknownColumn(name.clone()))
        })
        .collect()
}
