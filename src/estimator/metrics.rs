//! Scoring metrics used by the search wrapper.

use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Metric used to rank hyperparameter candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    /// Fraction of rows whose predicted labels all match (rounded to integers).
    Accuracy,
    /// Coefficient of determination, averaged over targets.
    R2,
    MeanSquaredError,
    MeanAbsoluteError,
}

impl Scoring {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::R2 => "r2",
            Self::MeanSquaredError => "mean_squared_error",
            Self::MeanAbsoluteError => "mean_absolute_error",
        }
    }

    /// Direction of the metric.
    pub fn greater_is_better(self) -> bool {
        matches!(self, Self::Accuracy | Self::R2)
    }

    /// Weighted score of `predicted` against `truth`. Returns `NaN` on empty input.
    pub fn score(self, truth: &[Vec<f32>], predicted: &[Vec<f32>], weights: Option<&[f32]>) -> f64 {
        let n = truth.len().min(predicted.len());
        if n == 0 {
            return f64::NAN;
        }
        let weight = |i: usize| weights.and_then(|w| w.get(i)).map_or(1.0, |w| *w as f64);
        let total_weight: f64 = (0..n).map(weight).sum();
        if total_weight <= 0.0 {
            return f64::NAN;
        }
        match self {
            Self::Accuracy => {
                let correct: f64 = (0..n)
                    .filter(|&i| {
                        truth[i]
                            .iter()
                            .zip(&predicted[i])
                            .all(|(t, p)| t.round() == p.round())
                    })
                    .map(weight)
                    .sum();
                correct / total_weight
            }
            Self::MeanSquaredError => mean_error(truth, predicted, &weight, total_weight, |d| d * d),
            Self::MeanAbsoluteError => mean_error(truth, predicted, &weight, total_weight, f64::abs),
            Self::R2 => r2(truth, predicted, &weight, total_weight),
        }
    }

    /// Sort key where smaller is better. `NaN` sorts after every number.
    pub fn rank_key(self, score: f64) -> OrderedFloat<f64> {
        if score.is_nan() {
            OrderedFloat(f64::NAN)
        } else if self.greater_is_better() {
            OrderedFloat(-score)
        } else {
            OrderedFloat(score)
        }
    }
}

impl fmt::Display for Scoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scoring {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accuracy" => Ok(Self::Accuracy),
            "r2" => Ok(Self::R2),
            "mse" | "mean_squared_error" => Ok(Self::MeanSquaredError),
            "mae" | "mean_absolute_error" => Ok(Self::MeanAbsoluteError),
            other => Err(format!("unknown scoring metric {other:?}")),
        }
    }
}

fn mean_error(
    truth: &[Vec<f32>],
    predicted: &[Vec<f32>],
    weight: &dyn Fn(usize) -> f64,
    total_weight: f64,
    loss: impl Fn(f64) -> f64,
) -> f64 {
    let n_targets = truth[0].len().max(1) as f64;
    let sum: f64 = truth
        .iter()
        .zip(predicted)
        .enumerate()
        .map(|(i, (t, p))| {
            let row: f64 = t
                .iter()
                .zip(p)
                .map(|(t, p)| loss(*t as f64 - *p as f64))
                .sum();
            weight(i) * row / n_targets
        })
        .sum();
    sum / total_weight
}

fn r2(
    truth: &[Vec<f32>],
    predicted: &[Vec<f32>],
    weight: &dyn Fn(usize) -> f64,
    total_weight: f64,
) -> f64 {
    let n_targets = truth[0].len();
    if n_targets == 0 {
        return f64::NAN;
    }
    let mut total = 0.0;
    for target in 0..n_targets {
        let mean: f64 = truth
            .iter()
            .enumerate()
            .map(|(i, row)| weight(i) * row[target] as f64)
            .sum::<f64>()
            / total_weight;
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (i, (t, p)) in truth.iter().zip(predicted).enumerate() {
            let w = weight(i);
            ss_res += w * (t[target] as f64 - p[target] as f64).powi(2);
            ss_tot += w * (t[target] as f64 - mean).powi(2);
        }
        total += if ss_tot == 0.0 {
            if ss_res == 0.0 { 1.0 } else { 0.0 }
        } else {
            1.0 - ss_res / ss_tot
        };
    }
    total / n_targets as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(values: &[f32]) -> Vec<Vec<f32>> {
        values.iter().map(|v| vec![*v]).collect()
    }

    #[test]
    fn regression_metrics() {
        let truth = col(&[1.0, 2.0, 3.0]);
        let predicted = col(&[1.0, 2.0, 5.0]);
        assert!((Scoring::MeanSquaredError.score(&truth, &predicted, None) - 4.0 / 3.0).abs() < 1e-9);
        assert!((Scoring::MeanAbsoluteError.score(&truth, &predicted, None) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(Scoring::R2.score(&truth, &truth, None), 1.0);
        assert!((Scoring::R2.score(&truth, &predicted, None) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn accuracy_respects_weights() {
        let truth = col(&[0.0, 1.0, 1.0]);
        let predicted = col(&[0.0, 0.0, 1.0]);
        assert!((Scoring::Accuracy.score(&truth, &predicted, None) - 2.0 / 3.0).abs() < 1e-9);
        let weights = [1.0, 0.0, 1.0];
        assert_eq!(Scoring::Accuracy.score(&truth, &predicted, Some(&weights)), 1.0);
    }

    #[test]
    fn rank_key_follows_direction_and_puts_nan_last() {
        assert!(Scoring::R2.rank_key(0.9) < Scoring::R2.rank_key(0.5));
        assert!(Scoring::MeanSquaredError.rank_key(0.9) > Scoring::MeanSquaredError.rank_key(0.5));
        assert!(Scoring::R2.rank_key(f64::NAN) > Scoring::R2.rank_key(-10.0));
        assert!(Scoring::MeanSquaredError.rank_key(1e9) < Scoring::MeanSquaredError.rank_key(f64::NAN));
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("MSE".parse::<Scoring>().unwrap(), Scoring::MeanSquaredError);
        assert_eq!("r2".parse::<Scoring>().unwrap(), Scoring::R2);
        assert!("f1".parse::<Scoring>().is_err());
    }
}
