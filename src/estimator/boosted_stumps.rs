//! Gradient-boosted regression stumps with chunked fitting.
//!
//! Each call to `partial_fit` runs `rounds` boosting rounds on the given chunk,
//! starting from the predictions of everything learned so far. The result is
//! therefore sensitive to chunk order.

use serde::{Deserialize, Serialize};

use super::{
    Estimator, EstimatorError, EstimatorRegistry, ParamReader, ParamValue, Params,
    check_training_data,
};
use crate::dataset::TrainingData;

const CLASS: &str = "BoostedStumps";

/// Single-split tree used as the weak learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stump {
    pub feature_index: usize,
    /// Rows with `feature <= threshold` take `left_value`; everything else,
    /// including missing values, takes `right_value`.
    pub threshold: f32,
    pub left_value: f32,
    pub right_value: f32,
}

impl Stump {
    pub fn predict(&self, features: &[f32]) -> f32 {
        let value = features.get(self.feature_index).copied().unwrap_or(f32::NAN);
        if value <= self.threshold {
            self.left_value
        } else {
            self.right_value
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedState {
    pub n_features: usize,
    pub init: f32,
    pub learning_rate: f32,
    pub stumps: Vec<Stump>,
    /// Chunks consumed through `partial_fit` (a full `fit` counts as one).
    pub chunks_seen: usize,
}

impl BoostedState {
    fn predict_row(&self, row: &[f32]) -> f32 {
        self.stumps
            .iter()
            .fold(self.init, |acc, stump| acc + self.learning_rate * stump.predict(row))
    }
}

/// Squared-loss booster over decision stumps. Single target, weighted rows.
#[derive(Debug, Clone)]
pub struct BoostedStumps {
    /// Boosting rounds per fit or per chunk. Default: `50`.
    pub rounds: usize,
    pub learning_rate: f32,
    /// Histogram bins used for split search. Default: `32`.
    pub bins: usize,
    fitted: Option<BoostedState>,
}

impl Default for BoostedStumps {
    fn default() -> Self {
        Self {
            rounds: 50,
            learning_rate: 0.1,
            bins: 32,
            fitted: None,
        }
    }
}

impl BoostedStumps {
    pub fn fitted_state(&self) -> Option<&BoostedState> {
        self.fitted.as_ref()
    }

    fn boost_chunk(&mut self, data: &TrainingData) -> Result<(), EstimatorError> {
        check_training_data(data)?;
        if data.n_targets() != 1 {
            return Err(EstimatorError::InvalidData(format!(
                "{CLASS} fits a single target, got {}",
                data.n_targets()
            )));
        }
        let y = data.first_target();
        let weights: Vec<f32> = (0..data.n_rows()).map(|i| data.weight(i)).collect();
        let mut state = match self.fitted.take() {
            Some(state) => {
                if state.n_features != data.n_features() {
                    let expected = state.n_features;
                    self.fitted = Some(state);
                    return Err(EstimatorError::InvalidData(format!(
                        "expected {expected} features, got {}",
                        data.n_features()
                    )));
                }
                state
            }
            None => BoostedState {
                n_features: data.n_features(),
                init: weighted_mean(&y, &weights),
                learning_rate: self.learning_rate,
                stumps: Vec::new(),
                chunks_seen: 0,
            },
        };
        let mut current: Vec<f32> = data.x.iter().map(|row| state.predict_row(row)).collect();
        for _round in 0..self.rounds {
            let residuals: Vec<f32> = y.iter().zip(&current).map(|(t, p)| t - p).collect();
            let stump = fit_stump(&data.x, &residuals, &weights, self.bins);
            for (pred, row) in current.iter_mut().zip(&data.x) {
                *pred += state.learning_rate * stump.predict(row);
            }
            state.stumps.push(stump);
        }
        state.chunks_seen += 1;
        self.fitted = Some(state);
        Ok(())
    }
}

impl Estimator for BoostedStumps {
    fn class_name(&self) -> &'static str {
        CLASS
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("rounds".into(), ParamValue::Int(self.rounds as i64));
        params.insert(
            "learning_rate".into(),
            ParamValue::Float(self.learning_rate as f64),
        );
        params.insert("bins".into(), ParamValue::Int(self.bins as i64));
        params
    }

    fn set_params(&mut self, params: &Params) -> Result<(), EstimatorError> {
        let reader = ParamReader::new(CLASS, params);
        reader.only(&["rounds", "learning_rate", "bins"])?;
        if let Some(rounds) = reader.usize("rounds")? {
            self.rounds = rounds;
        }
        if let Some(learning_rate) = reader.f32("learning_rate")? {
            if !(learning_rate > 0.0 && learning_rate <= 1.0) {
                return Err(EstimatorError::InvalidParam {
                    param: "learning_rate".into(),
                    reason: format!("must be in (0, 1], got {learning_rate}"),
                });
            }
            self.learning_rate = learning_rate;
        }
        if let Some(bins) = reader.usize("bins")? {
            self.bins = bins.clamp(2, 256);
        }
        Ok(())
    }

    fn fit(&mut self, data: &TrainingData) -> Result<(), EstimatorError> {
        self.fitted = None;
        self.boost_chunk(data)
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, EstimatorError> {
        let state = self.fitted.as_ref().ok_or(EstimatorError::NotFitted(CLASS))?;
        x.iter()
            .map(|row| {
                if row.len() != state.n_features {
                    return Err(EstimatorError::InvalidData(format!(
                        "expected {} features, got {}",
                        state.n_features,
                        row.len()
                    )));
                }
                Ok(vec![state.predict_row(row)])
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
        self.fitted = Some(serde_json::from_value(state)?);
        Ok(())
    }

    fn requirements(&self) -> Vec<String> {
        vec!["remotefit-boost>=0.3".to_string()]
    }

    fn accepts_sample_weight(&self) -> bool {
        true
    }

    fn supports_partial_fit(&self) -> bool {
        true
    }

    fn partial_fit(&mut self, chunk: &TrainingData) -> Result<(), EstimatorError> {
        self.boost_chunk(chunk)
    }
}

fn weighted_mean(values: &[f32], weights: &[f32]) -> f32 {
    let total: f64 = weights.iter().map(|w| *w as f64).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let sum: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| *v as f64 * *w as f64)
        .sum();
    (sum / total) as f32
}

/// Best weighted least-squares split over binned feature values.
fn fit_stump(x: &[Vec<f32>], residuals: &[f32], weights: &[f32], bins: usize) -> Stump {
    let bins = bins.clamp(2, 256);
    let n_features = x.first().map(Vec::len).unwrap_or(0);
    let mut best: Option<(f64, usize, f32)> = None;

    for feature in 0..n_features {
        let Some((min, max)) = feature_range(x, feature) else {
            continue;
        };
        let mut bin_sum = vec![0.0f64; bins];
        let mut bin_weight = vec![0.0f64; bins];
        let mut missing_sum = 0.0f64;
        let mut missing_weight = 0.0f64;
        for ((row, r), w) in x.iter().zip(residuals).zip(weights) {
            let value = row[feature];
            let (r, w) = (*r as f64, *w as f64);
            if !value.is_finite() {
                missing_sum += w * r;
                missing_weight += w;
                continue;
            }
            let b = bin_of(value, min, max, bins);
            bin_sum[b] += w * r;
            bin_weight[b] += w;
        }
        let total_sum: f64 = bin_sum.iter().sum::<f64>() + missing_sum;
        let total_weight: f64 = bin_weight.iter().sum::<f64>() + missing_weight;
        let mut left_sum = 0.0f64;
        let mut left_weight = 0.0f64;
        for split in 0..bins - 1 {
            left_sum += bin_sum[split];
            left_weight += bin_weight[split];
            let right_weight = total_weight - left_weight;
            if left_weight <= 0.0 || right_weight <= 0.0 {
                continue;
            }
            let right_sum = total_sum - left_sum;
            // Maximizing explained variance is minimizing SSE.
            let gain = left_sum * left_sum / left_weight + right_sum * right_sum / right_weight;
            if best.is_none_or(|(best_gain, _, _)| gain > best_gain + 1e-12) {
                let threshold = min + (split as f32 + 0.5) / (bins - 1) as f32 * (max - min);
                best = Some((gain, feature, threshold));
            }
        }
    }

    match best {
        Some((_, feature_index, threshold)) => {
            let (left_value, right_value) =
                leaf_means(x, residuals, weights, feature_index, threshold);
            Stump {
                feature_index,
                threshold,
                left_value,
                right_value,
            }
        }
        None => {
            let mean = weighted_mean(residuals, weights);
            Stump {
                feature_index: 0,
                threshold: f32::MAX,
                left_value: mean,
                right_value: mean,
            }
        }
    }
}

fn feature_range(x: &[Vec<f32>], feature: usize) -> Option<(f32, f32)> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for row in x {
        let value = row[feature];
        if value.is_finite() {
            min = min.min(value);
            max = max.max(value);
        }
    }
    (min.is_finite() && max > min).then_some((min, max))
}

fn bin_of(value: f32, min: f32, max: f32, bins: usize) -> usize {
    let t = ((value - min) / (max - min)).clamp(0.0, 1.0);
    ((t * (bins - 1) as f32).round() as usize).min(bins - 1)
}

fn leaf_means(
    x: &[Vec<f32>],
    residuals: &[f32],
    weights: &[f32],
    feature: usize,
    threshold: f32,
) -> (f32, f32) {
    let (mut ls, mut lw, mut rs, mut rw) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for ((row, r), w) in x.iter().zip(residuals).zip(weights) {
        let (r, w) = (*r as f64, *w as f64);
        if row[feature] <= threshold {
            ls += w * r;
            lw += w;
        } else {
            rs += w * r;
            rw += w;
        }
    }
    let left = if lw > 0.0 { ls / lw } else { 0.0 };
    let right = if rw > 0.0 { rs / rw } else { 0.0 };
    (left as f32, right as f32)
}
