//! Model specification: which estimator, which columns, which fit method.
//!
//! Built once per training request from the caller's estimator and the
//! dataset schema, then read by every trainer so switching strategies never
//! changes which columns are read or written.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{DatasetError, Schema, Table, feature_matrix};
use crate::estimator::{CapabilitySet, Estimator, EstimatorError, Params};
use crate::session::identifier::concat_identifiers;

/// Reasons a specification is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("No input columns given")]
    EmptyInputs,
    #[error("No label columns given")]
    EmptyLabels,
    #[error("Column {0} is listed more than once")]
    DuplicateColumn(String),
    #[error("Column {0} is used both as an input and a label")]
    Overlap(String),
    #[error("Column {0} is not in the dataset schema")]
    UnknownColumn(String),
    #[error("Column {0} is not numeric")]
    NotNumeric(String),
    #[error("Expected {expected} output columns, got {found}")]
    OutputCount { expected: usize, found: usize },
    #[error("Output column {0} already exists in the dataset")]
    OutputExists(String),
    #[error("{class} does not support {labels} label columns")]
    MultiOutputUnsupported { class: String, labels: usize },
    #[error("{0} does not accept sample weights")]
    SampleWeightUnsupported(String),
    #[error("{0} has no chunked fit method")]
    PartialFitUnsupported(String),
    #[error("Specification was built for {spec}, got estimator {estimator}")]
    EstimatorMismatch { spec: String, estimator: String },
    #[error("Cross-validation needs at least 2 folds, got {0}")]
    TooFewFolds(usize),
    #[error("Cannot split {rows} rows into {folds} folds")]
    FoldsExceedRows { folds: usize, rows: u64 },
}

/// Immutable description of one training request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecification {
    estimator_class: String,
    constructor_params: Params,
    input_cols: Vec<String>,
    label_cols: Vec<String>,
    output_cols: Vec<String>,
    sample_weight_col: Option<String>,
    is_fit_method_partial: bool,
}

impl ModelSpecification {
    /// Start a specification for `estimator`.
    pub fn builder(estimator: &dyn Estimator) -> SpecBuilder {
        SpecBuilder {
            estimator_class: estimator.class_name().to_string(),
            constructor_params: estimator.params(),
            capabilities: CapabilitySet::probe(estimator),
            input_cols: Vec::new(),
            label_cols: Vec::new(),
            output_cols: Vec::new(),
            sample_weight_col: None,
            partial: false,
        }
    }

    pub fn estimator_class(&self) -> &str {
        &self.estimator_class
    }

    pub fn constructor_params(&self) -> &Params {
        &self.constructor_params
    }

    pub fn input_cols(&self) -> &[String] {
        &self.input_cols
    }

    pub fn label_cols(&self) -> &[String] {
        &self.label_cols
    }

    pub fn output_cols(&self) -> &[String] {
        &self.output_cols
    }

    pub fn sample_weight_col(&self) -> Option<&str> {
        self.sample_weight_col.as_deref()
    }

    pub fn is_fit_method_partial(&self) -> bool {
        self.is_fit_method_partial
    }

    /// Fail unless `estimator` is the class this specification was built for.
    pub fn check_estimator(&self, estimator: &dyn Estimator) -> Result<(), SpecError> {
        if estimator.class_name() == self.estimator_class {
            Ok(())
        } else {
            Err(SpecError::EstimatorMismatch {
                spec: self.estimator_class.clone(),
                estimator: estimator.class_name().to_string(),
            })
        }
    }

    /// Every column training reads: inputs, labels, then the weight column.
    pub fn training_columns(&self) -> Vec<String> {
        let mut columns = self.input_cols.clone();
        columns.extend(self.label_cols.iter().cloned());
        columns.extend(self.sample_weight_col.iter().cloned());
        columns
    }
}

/// Collects columns before validating them against a schema.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    estimator_class: String,
    constructor_params: Params,
    capabilities: CapabilitySet,
    input_cols: Vec<String>,
    label_cols: Vec<String>,
    output_cols: Vec<String>,
    sample_weight_col: Option<String>,
    partial: bool,
}

impl SpecBuilder {
    pub fn input_cols<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_cols = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn label_cols<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_cols = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Prediction column names; defaults to `OUTPUT_<label>` per label.
    pub fn output_cols<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_cols = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sample_weight_col(mut self, column: impl Into<String>) -> Self {
        self.sample_weight_col = Some(column.into());
        self
    }

    /// Fit through the chunked `partial_fit` method.
    pub fn partial_fit(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Validate against the dataset schema and freeze.
    pub fn build(self, schema: &Schema) -> Result<ModelSpecification, SpecError> {
        if self.input_cols.is_empty() {
            return Err(SpecError::EmptyInputs);
        }
        if self.label_cols.is_empty() {
            return Err(SpecError::EmptyLabels);
        }

        let mut seen = BTreeSet::new();
        for column in self.input_cols.iter().chain(&self.label_cols) {
            if !seen.insert(column.as_str()) {
                return Err(if self.input_cols.contains(column) && self.label_cols.contains(column)
                {
                    SpecError::Overlap(column.clone())
                } else {
                    SpecError::DuplicateColumn(column.clone())
                });
            }
        }
        if let Some(weight) = &self.sample_weight_col
            && seen.contains(weight.as_str())
        {
            return Err(SpecError::DuplicateColumn(weight.clone()));
        }

        for column in self
            .input_cols
            .iter()
            .chain(&self.label_cols)
            .chain(self.sample_weight_col.iter())
        {
            let field = schema
                .field(column)
                .ok_or_else(|| SpecError::UnknownColumn(column.clone()))?;
            if !field.column_type.is_numeric() {
                return Err(SpecError::NotNumeric(column.clone()));
            }
        }

        if self.label_cols.len() > 1 && !self.capabilities.multi_output {
            return Err(SpecError::MultiOutputUnsupported {
                class: self.estimator_class,
                labels: self.label_cols.len(),
            });
        }
        if self.sample_weight_col.is_some() && !self.capabilities.sample_weight {
            return Err(SpecError::SampleWeightUnsupported(self.estimator_class));
        }
        if self.partial && !self.capabilities.external_memory {
            return Err(SpecError::PartialFitUnsupported(self.estimator_class));
        }

        let output_cols = if self.output_cols.is_empty() {
            self.label_cols
                .iter()
                .map(|label| concat_identifiers(&["OUTPUT_", label]))
                .collect()
        } else {
            self.output_cols
        };
        if output_cols.len() != self.label_cols.len() {
            return Err(SpecError::OutputCount {
                expected: self.label_cols.len(),
                found: output_cols.len(),
            });
        }
        let mut outputs = BTreeSet::new();
        for column in &output_cols {
            if schema.field(column).is_some() {
                return Err(SpecError::OutputExists(column.clone()));
            }
            if !outputs.insert(column.as_str()) {
                return Err(SpecError::DuplicateColumn(column.clone()));
            }
        }

        Ok(ModelSpecification {
            estimator_class: self.estimator_class,
            constructor_params: self.constructor_params,
            input_cols: self.input_cols,
            label_cols: self.label_cols,
            output_cols,
            sample_weight_col: self.sample_weight_col,
            is_fit_method_partial: self.partial,
        })
    }
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Estimator(#[from] EstimatorError),
    #[error("Estimator returned {found} values per row, expected {expected}")]
    OutputWidth { expected: usize, found: usize },
}

/// Predict on `table` and append the specification's output columns.
pub fn predict_table(
    estimator: &dyn Estimator,
    spec: &ModelSpecification,
    table: &Table,
) -> Result<Table, PredictionError> {
    let x = feature_matrix(table, spec.input_cols())?;
    let predictions = estimator.predict(&x)?;
    let expected = spec.output_cols().len();
    if let Some(row) = predictions.iter().find(|row| row.len() != expected) {
        return Err(PredictionError::OutputWidth {
            expected,
            found: row.len(),
        });
    }
    let mut out = table.clone();
    for (idx, column) in spec.output_cols().iter().enumerate() {
        let values: Vec<f64> = predictions.iter().map(|row| f64::from(row[idx])).collect();
        out = out.with_f64_column(column, &values)?;
    }
    Ok(out)
}
