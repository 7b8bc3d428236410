//! Closed-form ridge regression.

use serde::{Deserialize, Serialize};

use super::{
    Estimator, EstimatorError, EstimatorRegistry, ParamReader, ParamValue, Params,
    check_training_data,
};
use crate::dataset::TrainingData;

const CLASS: &str = "RidgeRegression";

/// L2-regularized least squares with optional intercept.
///
/// Supports several targets at once and per-row sample weights.
#[derive(Debug, Clone)]
pub struct RidgeRegression {
    /// Regularization strength. Default: `1.0`.
    pub alpha: f32,
    /// Fit an intercept term. Default: `true`.
    pub fit_intercept: bool,
    fitted: Option<RidgeState>,
}

/// Learned coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeState {
    /// Shape: `[n_targets][n_features]`.
    pub coef: Vec<Vec<f64>>,
    /// One intercept per target.
    pub intercept: Vec<f64>,
}

impl Default for RidgeRegression {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            fit_intercept: true,
            fitted: None,
        }
    }
}

impl RidgeRegression {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha,
            ..Self::default()
        }
    }

    /// Learned coefficients, once fitted.
    pub fn coefficients(&self) -> Option<&RidgeState> {
        self.fitted.as_ref()
    }
}

impl Estimator for RidgeRegression {
    fn class_name(&self) -> &'static str {
        CLASS
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("alpha".into(), ParamValue::Float(self.alpha as f64));
        params.insert("fit_intercept".into(), ParamValue::Bool(self.fit_intercept));
        params
    }

    fn set_params(&mut self, params: &Params) -> Result<(), EstimatorError> {
        let reader = ParamReader::new(CLASS, params);
        reader.only(&["alpha", "fit_intercept"])?;
        if let Some(alpha) = reader.f32("alpha")? {
            if !alpha.is_finite() || alpha < 0.0 {
                return Err(EstimatorError::InvalidParam {
                    param: "alpha".into(),
                    reason: format!("must be >= 0, got {alpha}"),
                });
            }
            self.alpha = alpha;
        }
        if let Some(fit_intercept) = reader.bool("fit_intercept")? {
            self.fit_intercept = fit_intercept;
        }
        Ok(())
    }

    fn fit(&mut self, data: &TrainingData) -> Result<(), EstimatorError> {
        check_training_data(data)?;
        if data.x.iter().flatten().any(|v| !v.is_finite()) {
            return Err(EstimatorError::InvalidData(
                "features contain missing or non-finite values".to_string(),
            ));
        }
        self.fitted = Some(solve_ridge(data, self.alpha as f64, self.fit_intercept)?);
        Ok(())
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, EstimatorError> {
        let state = self.fitted.as_ref().ok_or(EstimatorError::NotFitted(CLASS))?;
        let n_features = state.coef.first().map(Vec::len).unwrap_or(0);
        x.iter()
            .map(|row| {
                if row.len() != n_features {
                    return Err(EstimatorError::InvalidData(format!(
                        "expected {n_features} features, got {}",
                        row.len()
                    )));
                }
                Ok(state
                    .coef
                    .iter()
                    .zip(&state.intercept)
                    .map(|(coef, intercept)| {
                        let dot: f64 = coef
                            .iter()
                            .zip(row)
                            .map(|(c, v)| c * *v as f64)
                            .sum();
                        (dot + intercept) as f32
                    })
                    .collect())
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
        vec!["remotefit-linear>=0.3".to_string()]
    }

    fn accepts_sample_weight(&self) -> bool {
        true
    }

    fn supports_multi_output(&self) -> bool {
        true
    }
}

fn solve_ridge(
    data: &TrainingData,
    alpha: f64,
    fit_intercept: bool,
) -> Result<RidgeState, EstimatorError> {
    let n_features = data.n_features();
    let n_targets = data.n_targets();
    let total_weight: f64 = (0..data.n_rows()).map(|i| data.weight(i) as f64).sum();
    if total_weight <= 0.0 {
        return Err(EstimatorError::InvalidData(
            "sample weights sum to zero".to_string(),
        ));
    }

    let mut x_mean = vec![0.0f64; n_features];
    let mut y_mean = vec![0.0f64; n_targets];
    if fit_intercept {
        for (i, (row, target)) in data.x.iter().zip(&data.y).enumerate() {
            let w = data.weight(i) as f64;
            for (mean, v) in x_mean.iter_mut().zip(row) {
                *mean += w * *v as f64;
            }
            for (mean, v) in y_mean.iter_mut().zip(target) {
                *mean += w * *v as f64;
            }
        }
        x_mean.iter_mut().for_each(|m| *m /= total_weight);
        y_mean.iter_mut().for_each(|m| *m /= total_weight);
    }

    // Normal equations: (X'WX + alpha I) B = X'WY on centered data.
    let mut gram = vec![vec![0.0f64; n_features]; n_features];
    let mut rhs = vec![vec![0.0f64; n_targets]; n_features];
    for (i, (row, target)) in data.x.iter().zip(&data.y).enumerate() {
        let w = data.weight(i) as f64;
        let centered: Vec<f64> = row
            .iter()
            .zip(&x_mean)
            .map(|(v, m)| *v as f64 - m)
            .collect();
        for a in 0..n_features {
            let wa = w * centered[a];
            for b in a..n_features {
                gram[a][b] += wa * centered[b];
            }
            for (t, value) in target.iter().enumerate() {
                rhs[a][t] += wa * (*value as f64 - y_mean[t]);
            }
        }
    }
    for a in 0..n_features {
        for b in 0..a {
            gram[a][b] = gram[b][a];
        }
        gram[a][a] += alpha;
    }

    let solution = solve_linear_system(gram, rhs)?;
    let coef: Vec<Vec<f64>> = (0..n_targets)
        .map(|t| solution.iter().map(|row| row[t]).collect())
        .collect();
    let intercept = coef
        .iter()
        .zip(&y_mean)
        .map(|(c, ym)| {
            let shift: f64 = c.iter().zip(&x_mean).map(|(c, m)| c * m).sum();
            ym - shift
        })
        .collect();
    Ok(RidgeState { coef, intercept })
}

/// Gaussian elimination with partial pivoting, several right-hand sides at once.
fn solve_linear_system(
    mut a: Vec<Vec<f64>>,
    mut b: Vec<Vec<f64>>,
) -> Result<Vec<Vec<f64>>, EstimatorError> {
    let n = a.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(EstimatorError::Fit(
                "singular system; increase alpha".to_string(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            for k in 0..b[row].len() {
                b[row][k] -= factor * b[col][k];
            }
        }
    }
    let n_rhs = b.first().map(Vec::len).unwrap_or(0);
    let mut x = vec![vec![0.0f64; n_rhs]; n];
    for row in (0..n).rev() {
        for k in 0..n_rhs {
            let tail: f64 = ((row + 1)..n).map(|j| a[row][j] * x[j][k]).sum();
            x[row][k] = (b[row][k] - tail) / a[row][row];
        }
    }
    Ok(x)
}
