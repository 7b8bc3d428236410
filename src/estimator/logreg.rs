//! Multinomial logistic regression trained with mini-batch gradient descent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use super::{
    Estimator, EstimatorError, EstimatorRegistry, ParamReader, ParamValue, Params,
    check_training_data,
};
use crate::dataset::TrainingData;

const CLASS: &str = "LogisticRegression";

/// Softmax classifier over numeric class labels.
///
/// Labels are read from the first target column and rounded to integers; the
/// distinct values become the class list in ascending order.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
    pub batch_size: usize,
    pub seed: u64,
    /// Reweight classes inversely to their frequency.
    pub balance_classes: bool,
    fitted: Option<LogRegState>,
}

/// Learned weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRegState {
    /// Class label values, ascending.
    pub classes: Vec<i64>,
    pub n_features: usize,
    /// Row-major `[n_classes][n_features]`.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.1,
            l2: 1e-4,
            batch_size: 128,
            seed: 42,
            balance_classes: false,
            fitted: None,
        }
    }
}

impl LogisticRegression {
    pub fn fitted_state(&self) -> Option<&LogRegState> {
        self.fitted.as_ref()
    }

    /// Class probabilities for one row.
    pub fn predict_proba_row(&self, row: &[f32]) -> Result<Vec<f32>, EstimatorError> {
        let state = self.fitted.as_ref().ok_or(EstimatorError::NotFitted(CLASS))?;
        if row.len() != state.n_features {
            return Err(EstimatorError::InvalidData(format!(
                "expected {} features, got {}",
                state.n_features,
                row.len()
            )));
        }
        Ok(softmax(&logits(state, row)))
    }
}

impl Estimator for LogisticRegression {
    fn class_name(&self) -> &'static str {
        CLASS
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("epochs".into(), ParamValue::Int(self.epochs as i64));
        params.insert(
            "learning_rate".into(),
            ParamValue::Float(self.learning_rate as f64),
        );
        params.insert("l2".into(), ParamValue::Float(self.l2 as f64));
        params.insert("batch_size".into(), ParamValue::Int(self.batch_size as i64));
        params.insert("seed".into(), ParamValue::Int(self.seed as i64));
        params.insert(
            "balance_classes".into(),
            ParamValue::Bool(self.balance_classes),
        );
        params
    }

    fn set_params(&mut self, params: &Params) -> Result<(), EstimatorError> {
        let reader = ParamReader::new(CLASS, params);
        reader.only(&[
            "epochs",
            "learning_rate",
            "l2",
            "batch_size",
            "seed",
            "balance_classes",
        ])?;
        if let Some(epochs) = reader.usize("epochs")? {
            self.epochs = epochs;
        }
        if let Some(learning_rate) = reader.f32("learning_rate")? {
            if !(learning_rate > 0.0) {
                return Err(EstimatorError::InvalidParam {
                    param: "learning_rate".into(),
                    reason: format!("must be > 0, got {learning_rate}"),
                });
            }
            self.learning_rate = learning_rate;
        }
        if let Some(l2) = reader.f32("l2")? {
            self.l2 = l2.max(0.0);
        }
        if let Some(batch_size) = reader.usize("batch_size")? {
            self.batch_size = batch_size.max(1);
        }
        if let Some(seed) = reader.u64("seed")? {
            self.seed = seed;
        }
        if let Some(balance) = reader.bool("balance_classes")? {
            self.balance_classes = balance;
        }
        Ok(())
    }

    fn fit(&mut self, data: &TrainingData) -> Result<(), EstimatorError> {
        check_training_data(data)?;
        let labels: Vec<i64> = data
            .first_target()
            .into_iter()
            .map(|v| v.round() as i64)
            .collect();
        let mut classes = labels.clone();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(EstimatorError::InvalidData(
                "need at least 2 classes".to_string(),
            ));
        }
        let y: Vec<usize> = labels
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();
        self.fitted = Some(train(data, &y, classes, self)?);
        Ok(())
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, EstimatorError> {
        let state = self.fitted.as_ref().ok_or(EstimatorError::NotFitted(CLASS))?;
        x.iter()
            .map(|row| {
                let proba = self.predict_proba_row(row)?;
                let mut best = 0usize;
                let mut best_val = f32::NEG_INFINITY;
                for (idx, &p) in proba.iter().enumerate() {
                    if p > best_val {
                        best_val = p;
                        best = idx;
                    }
                }
                Ok(vec![state.classes[best] as f32])
            })
            .collect()
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn state(&self) -> Result<Option<serde_json::Value>, EstimatorError> {
        self.fitted
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(EstimatorError::from)
    }

    fn load_state(
        &mut self,
        state: serde_json::Value,
        _registry: &EstimatorRegistry,
    ) -> Result<(), EstimatorError> {
        let state: LogRegState = serde_json::from_value(state)?;
        if state.weights.len() != state.classes.len() * state.n_features
            || state.bias.len() != state.classes.len()
        {
            return Err(EstimatorError::InvalidData(
                "logistic regression state has inconsistent shapes".to_string(),
            ));
        }
        self.fitted = Some(state);
        Ok(())
    }

    fn requirements(&self) -> Vec<String> {
        vec!["remotefit-linear>=0.3".to_string()]
    }

    fn accepts_sample_weight(&self) -> bool {
        true
    }
}

fn train(
    data: &TrainingData,
    y: &[usize],
    classes: Vec<i64>,
    options: &LogisticRegression,
) -> Result<LogRegState, EstimatorError> {
    let n_classes = classes.len();
    let dim = data.n_features();
    if data.x.iter().flatten().any(|v| !v.is_finite()) {
        return Err(EstimatorError::InvalidData(
            "features contain missing or non-finite values".to_string(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut state = LogRegState {
        classes,
        n_features: dim,
        weights: vec![0.0f32; n_classes * dim],
        bias: vec![0.0f32; n_classes],
    };
    for w in &mut state.weights {
        *w = (rng.random::<f32>() - 0.5) * 0.01;
    }

    let class_weights = if options.balance_classes {
        let mut counts = vec![0f32; n_classes];
        for &label in y {
            counts[label] += 1.0;
        }
        let total: f32 = counts.iter().sum();
        counts
            .into_iter()
            .map(|count| {
                if count == 0.0 {
                    0.0
                } else {
                    total / (n_classes as f32 * count)
                }
            })
            .collect()
    } else {
        vec![1.0; n_classes]
    };

    let mut indices: Vec<usize> = (0..data.n_rows()).collect();
    let batch_size = options.batch_size.max(1);
    let lr = options.learning_rate;
    let l2 = options.l2.max(0.0);

    for _epoch in 0..options.epochs {
        indices.shuffle(&mut rng);
        for chunk in indices.chunks(batch_size) {
            let mut grad_w = vec![0.0f32; state.weights.len()];
            let mut grad_b = vec![0.0f32; n_classes];
            let mut batch_weight = 0.0f32;
            for &idx in chunk {
                let x = &data.x[idx];
                let label = y[idx];
                let weight = class_weights[label] * data.weight(idx);
                if weight == 0.0 {
                    continue;
                }
                let probs = softmax(&logits(&state, x));
                for c in 0..n_classes {
                    let diff = probs[c] - if c == label { 1.0 } else { 0.0 };
                    let base = c * dim;
                    for i in 0..dim {
                        grad_w[base + i] += diff * x[i] * weight;
                    }
                    grad_b[c] += diff * weight;
                }
                batch_weight += weight;
            }
            if batch_weight == 0.0 {
                continue;
            }
            let inv = 1.0 / batch_weight;
            for (idx, w) in state.weights.iter_mut().enumerate() {
                *w -= lr * (grad_w[idx] * inv + l2 * *w);
            }
            for (b, g) in state.bias.iter_mut().zip(&grad_b) {
                *b -= lr * g * inv;
            }
        }
    }
    Ok(state)
}

fn logits(state: &LogRegState, row: &[f32]) -> Vec<f32> {
    let dim = state.n_features;
    (0..state.classes.len())
        .map(|c| {
            let base = c * dim;
            let mut sum = state.bias[c];
            for i in 0..dim {
                sum += state.weights[base + i] * row[i];
            }
            sum
        })
        .collect()
}

/// Numerically stable softmax.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return vec![1.0 / logits.len().max(1) as f32; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}
