//! Estimator contract and the built-in estimators.
//!
//! An estimator exposes `fit`/`predict` plus a handful of optional behaviors
//! (chunked fitting, sample weights, multi-output targets, wrapping a
//! hyperparameter search). Optional behaviors are discovered once through
//! [`CapabilitySet::probe`] and consumed as plain data afterwards.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::TrainingData;

pub mod boosted_stumps;
pub mod capabilities;
pub mod folds;
pub mod logreg;
pub mod metrics;
mod registry;
pub mod ridge;
pub mod search;

pub use boosted_stumps::BoostedStumps;
pub use capabilities::CapabilitySet;
pub use logreg::LogisticRegression;
pub use metrics::Scoring;
pub use registry::EstimatorRegistry;
pub use ridge::RidgeRegression;
pub use search::{
    CandidateResult, FoldScore, GridSearchCV, ParamGrid, SearchOutcome, SearchStrategy,
    SearchWrapper,
};

/// Constructor parameters keyed by name, sorted for a canonical order.
pub type Params = BTreeMap<String, ParamValue>;

/// One hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Render params as `a=1, b=0.5` for logs and error messages.
pub fn format_params(params: &Params) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by estimators.
#[derive(Debug, Error)]
pub enum EstimatorError {
    /// A parameter name is not accepted by the estimator.
    #[error("{class} has no parameter named {param}")]
    UnknownParam {
        class: &'static str,
        param: String,
    },
    /// A parameter value has the wrong type or range.
    #[error("Invalid value for {param}: {reason}")]
    InvalidParam { param: String, reason: String },
    /// Prediction or state export before `fit`.
    #[error("{0} is not fitted")]
    NotFitted(&'static str),
    /// An optional operation is not implemented by the estimator.
    #[error("{class} does not support {operation}")]
    Unsupported {
        class: &'static str,
        operation: &'static str,
    },
    /// Training data does not fit the estimator's expectations.
    #[error("Invalid training data: {0}")]
    InvalidData(String),
    /// Fitting failed.
    #[error("Fit failed: {0}")]
    Fit(String),
    /// Estimator state could not be encoded or decoded.
    #[error("Invalid estimator state: {0}")]
    State(#[from] serde_json::Error),
    /// The registry does not know the estimator class.
    #[error("Unknown estimator class {0}")]
    UnknownClass(String),
}

/// Common `fit`/`predict` contract.
///
/// `predict` returns one row of outputs per input row. Implementations must be
/// deterministic for a fixed parameter set so remote and local fits agree.
pub trait Estimator: Send + Sync + fmt::Debug {
    /// Stable class identifier used by the registry.
    fn class_name(&self) -> &'static str;

    /// Current constructor parameters.
    fn params(&self) -> Params;

    /// Override a subset of constructor parameters.
    fn set_params(&mut self, params: &Params) -> Result<(), EstimatorError>;

    /// Fit on the full dataset, replacing any previous fitted state.
    fn fit(&mut self, data: &TrainingData) -> Result<(), EstimatorError>;

    fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, EstimatorError>;

    fn is_fitted(&self) -> bool;

    fn boxed_clone(&self) -> Box<dyn Estimator>;

    /// Serializable state beyond constructor params (`None` when there is nothing to carry).
    fn state(&self) -> Result<Option<serde_json::Value>, EstimatorError>;

    /// Restore state produced by [`Estimator::state`].
    fn load_state(
        &mut self,
        state: serde_json::Value,
        registry: &EstimatorRegistry,
    ) -> Result<(), EstimatorError>;

    /// Packages the estimator needs on the substrate, as requirement strings.
    fn requirements(&self) -> Vec<String> {
        Vec::new()
    }

    fn accepts_sample_weight(&self) -> bool {
        false
    }

    fn supports_multi_output(&self) -> bool {
        false
    }

    /// Whether [`Estimator::partial_fit`] is implemented.
    fn supports_partial_fit(&self) -> bool {
        false
    }

    /// Continue fitting on one chunk, keeping previously learned state.
    fn partial_fit(&mut self, _chunk: &TrainingData) -> Result<(), EstimatorError> {
        Err(EstimatorError::Unsupported {
            class: self.class_name(),
            operation: "partial_fit",
        })
    }

    /// Search-wrapper view when the estimator explores a hyperparameter space.
    fn search(&self) -> Option<&dyn SearchWrapper> {
        None
    }

    fn search_mut(&mut self) -> Option<&mut dyn SearchWrapper> {
        None
    }
}

impl Clone for Box<dyn Estimator> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Serialized estimator: class, params and optional fitted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorBlob {
    pub class: String,
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

impl EstimatorBlob {
    pub fn from_estimator(estimator: &dyn Estimator) -> Result<Self, EstimatorError> {
        Ok(Self {
            class: estimator.class_name().to_string(),
            params: estimator.params(),
            state: estimator.state()?,
        })
    }
}

/// Reads typed values out of a [`Params`] map for `set_params` implementations.
pub(crate) struct ParamReader<'a> {
    class: &'static str,
    params: &'a Params,
}

impl<'a> ParamReader<'a> {
    pub(crate) fn new(class: &'static str, params: &'a Params) -> Self {
        Self { class, params }
    }

    /// Reject names outside `known`.
    pub(crate) fn only(&self, known: &[&str]) -> Result<(), EstimatorError> {
        match self.params.keys().find(|key| !known.contains(&key.as_str())) {
            Some(key) => Err(EstimatorError::UnknownParam {
                class: self.class,
                param: key.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn f32(&self, name: &str) -> Result<Option<f32>, EstimatorError> {
        self.read(name, "a number", |value| value.as_f64().map(|v| v as f32))
    }

    pub(crate) fn usize(&self, name: &str) -> Result<Option<usize>, EstimatorError> {
        self.read(name, "a non-negative integer", |value| {
            value.as_i64().and_then(|v| usize::try_from(v).ok())
        })
    }

    pub(crate) fn u64(&self, name: &str) -> Result<Option<u64>, EstimatorError> {
        self.read(name, "a non-negative integer", |value| {
            value.as_i64().and_then(|v| u64::try_from(v).ok())
        })
    }

    pub(crate) fn bool(&self, name: &str) -> Result<Option<bool>, EstimatorError> {
        self.read(name, "a boolean", ParamValue::as_bool)
    }

    pub(crate) fn text(&self, name: &str) -> Result<Option<String>, EstimatorError> {
        self.read(name, "a string", |value| value.as_str().map(str::to_string))
    }

    fn read<T>(
        &self,
        name: &str,
        expected: &str,
        convert: impl Fn(&ParamValue) -> Option<T>,
    ) -> Result<Option<T>, EstimatorError> {
        match self.params.get(name) {
            None => Ok(None),
            Some(value) => convert(value).map(Some).ok_or_else(|| {
                EstimatorError::InvalidParam {
                    param: name.to_string(),
                    reason: format!("expected {expected}, got {value}"),
                }
            }),
        }
    }
}

/// Shared input checks for `fit` implementations.
pub(crate) fn check_training_data(data: &TrainingData) -> Result<(), EstimatorError> {
    if data.is_empty() {
        return Err(EstimatorError::InvalidData("empty training set".to_string()));
    }
    if data.x.len() != data.y.len() {
        return Err(EstimatorError::InvalidData(
            "mismatched feature and label row counts".to_string(),
        ));
    }
    let width = data.n_features();
    if width == 0 {
        return Err(EstimatorError::InvalidData("no feature columns".to_string()));
    }
    if data.x.iter().any(|row| row.len() != width) {
        return Err(EstimatorError::InvalidData(
            "inconsistent feature row length".to_string(),
        ));
    }
    if let Some(weights) = &data.sample_weight {
        if weights.len() != data.x.len() {
            return Err(EstimatorError::InvalidData(
                "sample weights do not match row count".to_string(),
            ));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EstimatorError::InvalidData(
                "sample weights must be finite and non-negative".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_params_keep_integer_and_float_apart() {
        let params: Params = serde_json::from_str(r#"{"a": 1, "b": 0.5, "c": true, "d": "x"}"#)
            .unwrap();
        assert_eq!(params["a"], ParamValue::Int(1));
        assert_eq!(params["b"], ParamValue::Float(0.5));
        assert_eq!(params["c"], ParamValue::Bool(true));
        assert_eq!(params["d"], ParamValue::Text("x".into()));
        assert_eq!(format_params(&params), "a=1, b=0.5, c=true, d=\"x\"");
    }

    #[test]
    fn reader_rejects_unknown_and_mistyped_params() {
        let mut params = Params::new();
        params.insert("alpha".into(), ParamValue::Text("big".into()));
        let reader = ParamReader::new("Test", &params);
        assert!(reader.only(&["alpha"]).is_ok());
        assert!(matches!(
            reader.only(&["beta"]),
            Err(EstimatorError::UnknownParam { .. })
        ));
        assert!(matches!(
            reader.f32("alpha"),
            Err(EstimatorError::InvalidParam { .. })
        ));
    }
}
