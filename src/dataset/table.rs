use super::{DatasetError, Field, Schema, Value};

/// Row-major in-memory table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table, checking every row against the schema width.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Result<Self, DatasetError> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                return Err(DatasetError::RowWidth {
                    row: idx,
                    found: row.len(),
                    expected: schema.len(),
                });
            }
        }
        Ok(Self { schema, rows })
    }

    /// Convenience constructor for all-float tables.
    pub fn from_f64_columns(columns: &[(&str, Vec<f64>)]) -> Result<Self, DatasetError> {
        let fields = columns
            .iter()
            .map(|(name, _)| Field::new(*name, super::ColumnType::Float))
            .collect();
        let schema = Schema::new(fields)?;
        let n_rows = columns.first().map(|(_, values)| values.len()).unwrap_or(0);
        let mut rows = Vec::with_capacity(n_rows);
        for row_idx in 0..n_rows {
            let row = columns
                .iter()
                .map(|(_, values)| {
                    values
                        .get(row_idx)
                        .map(|v| Value::Float(*v))
                        .unwrap_or(Value::Null)
                })
                .collect();
            rows.push(row);
        }
        Self::new(schema, rows)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.len()
    }

    /// Keep only the named columns, in the given order.
    pub fn select(&self, columns: &[String]) -> Result<Self, DatasetError> {
        let schema = self.schema.project(columns)?;
        let indices: Vec<usize> = columns
            .iter()
            .filter_map(|name| self.schema.index_of(name))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&idx| row[idx].clone()).collect())
            .collect();
        Ok(Self { schema, rows })
    }

    /// Copy of the rows in `[start, start + len)`, clamped to the table.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        let start = start.min(self.rows.len());
        let end = start.saturating_add(len).min(self.rows.len());
        Self {
            schema: self.schema.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// Append a float column, one value per row.
    pub fn with_f64_column(mut self, name: &str, values: &[f64]) -> Result<Self, DatasetError> {
        if values.len() != self.rows.len() {
            return Err(DatasetError::RowWidth {
                row: values.len().min(self.rows.len()),
                found: values.len(),
                expected: self.rows.len(),
            });
        }
        let mut fields = self.schema.fields().to_vec();
        fields.push(Field::new(name, super::ColumnType::Float));
        self.schema = Schema::new(fields)?;
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(Value::Float(*value));
        }
        Ok(self)
    }

    /// All values of one column.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>, DatasetError> {
        let idx = self
            .schema
            .index_of(name)
            .ok_or_else(|| DatasetError::UnknownColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_f64_columns(&[("A", vec![1.0, 2.0, 3.0]), ("B", vec![4.0, 5.0, 6.0])])
            .unwrap()
    }

    #[test]
    fn select_reorders_columns() {
        let table = sample().select(&["B".to_string(), "A".to_string()]).unwrap();
        assert_eq!(table.schema().names(), vec!["B", "A"]);
        assert_eq!(table.rows()[0], vec![Value::Float(4.0), Value::Float(1.0)]);
    }

    #[test]
    fn slice_clamps_to_available_rows() {
        let table = sample();
        assert_eq!(table.slice(2, 10).num_rows(), 1);
        assert_eq!(table.slice(5, 1).num_rows(), 0);
    }

    #[test]
    fn new_rejects_ragged_rows() {
        let schema = sample().schema().clone();
        let result = Table::new(schema, vec![vec![Value::Float(1.0)]]);
        assert!(matches!(result, Err(DatasetError::RowWidth { row: 0, .. })));
    }
}
