//! Cross-validated hyperparameter search.
//!
//! [`GridSearchCV`] fits locally on its own. The distributed trainer drives the
//! same search through the [`SearchWrapper`] view instead: it enumerates
//! candidates and folds, scores each (candidate, fold) pair remotely, then hands
//! the scores to [`aggregate`] and the refit estimator back to the wrapper.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::folds;
use super::{
    Estimator, EstimatorBlob, EstimatorError, EstimatorRegistry, ParamReader, ParamValue,
    Params, RidgeRegression, Scoring,
};
use crate::dataset::TrainingData;

const CLASS: &str = "GridSearchCV";

/// Candidate values per parameter name.
pub type ParamGrid = BTreeMap<String, Vec<ParamValue>>;

/// How candidates are drawn from the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStrategy {
    /// Every combination, in canonical grid order.
    Grid,
    /// `n_iter` distinct combinations sampled with a seeded generator.
    Random { n_iter: usize, seed: u64 },
}

/// Score of one candidate on one fold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoldScore {
    pub candidate: usize,
    pub fold: usize,
    pub score: f64,
}

/// Per-candidate cross-validation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    /// Position in canonical candidate order.
    pub index: usize,
    pub params: Params,
    /// One slot per fold; `None` when that fold produced no usable score.
    pub fold_scores: Vec<Option<f64>>,
    /// Mean of the available fold scores, `None` when there are none.
    pub mean_score: Option<f64>,
    /// 1-based rank among scored candidates.
    pub rank: Option<usize>,
}

/// Result of ranking all candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best_index: usize,
    pub best_params: Params,
    pub best_score: f64,
    pub cv_results: Vec<CandidateResult>,
}

/// Search-wrapper view used by the distributed trainer.
pub trait SearchWrapper: Send + Sync {
    fn base_estimator(&self) -> &dyn Estimator;

    /// Candidate parameter sets in canonical order.
    fn candidates(&self) -> Result<Vec<Params>, EstimatorError>;

    fn n_folds(&self) -> usize;

    fn scoring(&self) -> Scoring;

    /// Whether the winning candidate is refit on the full data.
    fn refit(&self) -> bool;

    /// Install an externally computed outcome and refit estimator.
    fn install(
        &mut self,
        outcome: SearchOutcome,
        best_estimator: Option<Box<dyn Estimator>>,
    ) -> Result<(), EstimatorError>;

    fn outcome(&self) -> Option<&SearchOutcome>;
}

/// Rank candidates from fold scores.
///
/// The result depends only on the set of scores, never on their order. Fold
/// scores that are not finite are ignored; candidates without any usable fold
/// are left unranked. Ties break on canonical candidate index. Returns `None`
/// when no candidate has a score.
pub fn aggregate(
    candidates: &[Params],
    n_folds: usize,
    scores: &[FoldScore],
    scoring: Scoring,
) -> Option<SearchOutcome> {
    let mut table = vec![vec![None; n_folds]; candidates.len()];
    for score in scores {
        if let Some(slot) = table
            .get_mut(score.candidate)
            .and_then(|row| row.get_mut(score.fold))
            && score.score.is_finite()
        {
            *slot = Some(score.score);
        }
    }

    let mut results: Vec<CandidateResult> = candidates
        .iter()
        .zip(table)
        .enumerate()
        .map(|(index, (params, fold_scores))| {
            let available: Vec<f64> = fold_scores.iter().flatten().copied().collect();
            let mean_score = (!available.is_empty())
                .then(|| available.iter().sum::<f64>() / available.len() as f64);
            CandidateResult {
                index,
                params: params.clone(),
                fold_scores,
                mean_score,
                rank: None,
            }
        })
        .collect();

    let mut order: Vec<usize> = results
        .iter()
        .filter(|result| result.mean_score.is_some())
        .map(|result| result.index)
        .collect();
    order.sort_by_key(|&index| {
        let mean = results[index].mean_score.unwrap_or(f64::NAN);
        (scoring.rank_key(mean), index)
    });
    for (rank, &index) in order.iter().enumerate() {
        results[index].rank = Some(rank + 1);
    }

    let best_index = *order.first()?;
    Some(SearchOutcome {
        best_index,
        best_params: results[best_index].params.clone(),
        best_score: results[best_index].mean_score.unwrap_or(f64::NAN),
        cv_results: results,
    })
}

/// Fit `base` with `params` on the training part of `fold` and score it on
/// the validation part.
pub fn evaluate_candidate(
    base: &dyn Estimator,
    params: &Params,
    data: &TrainingData,
    n_folds: usize,
    fold: usize,
    scoring: Scoring,
) -> Result<f64, EstimatorError> {
    let split = folds::fold(data.n_rows(), n_folds, fold);
    if split.train.is_empty() || split.validation.is_empty() {
        return Err(EstimatorError::InvalidData(format!(
            "fold {fold} of {n_folds} is empty for {} rows",
            data.n_rows()
        )));
    }
    let mut model = base.boxed_clone();
    model.set_params(params)?;
    model.fit(&data.subset(&split.train))?;
    let validation = data.subset(&split.validation);
    let predicted = model.predict(&validation.x)?;
    Ok(scoring.score(
        &validation.y,
        &predicted,
        validation.sample_weight.as_deref(),
    ))
}

/// Expand a grid into candidates, last parameter name varying fastest.
pub fn expand_grid(grid: &ParamGrid) -> Result<Vec<Params>, EstimatorError> {
    if let Some((name, _)) = grid.iter().find(|(_, values)| values.is_empty()) {
        return Err(EstimatorError::InvalidParam {
            param: name.clone(),
            reason: "grid entry has no values".to_string(),
        });
    }
    let total: usize = grid.values().map(Vec::len).product();
    Ok((0..total).map(|index| combination(grid, index)).collect())
}

fn combination(grid: &ParamGrid, mut index: usize) -> Params {
    let mut params = Params::new();
    for (name, values) in grid.iter().rev() {
        params.insert(name.clone(), values[index % values.len()].clone());
        index /= values.len();
    }
    params
}

/// Exhaustive or randomized search with k-fold cross-validation.
#[derive(Debug, Clone)]
pub struct GridSearchCV {
    base: Box<dyn Estimator>,
    pub param_grid: ParamGrid,
    pub cv: usize,
    pub scoring: Scoring,
    pub strategy: SearchStrategy,
    pub refit: bool,
    outcome: Option<SearchOutcome>,
    best_estimator: Option<Box<dyn Estimator>>,
}

#[derive(Serialize, Deserialize)]
struct SearchState {
    base: EstimatorBlob,
    param_grid: ParamGrid,
    #[serde(default)]
    outcome: Option<SearchOutcome>,
    #[serde(default)]
    best_estimator: Option<EstimatorBlob>,
}

impl Default for GridSearchCV {
    fn default() -> Self {
        Self::new(
            Box::new(RidgeRegression::default()),
            ParamGrid::new(),
            5,
            Scoring::R2,
        )
    }
}

impl GridSearchCV {
    pub fn new(base: Box<dyn Estimator>, param_grid: ParamGrid, cv: usize, scoring: Scoring) -> Self {
        Self {
            base,
            param_grid,
            cv,
            scoring,
            strategy: SearchStrategy::Grid,
            refit: true,
            outcome: None,
            best_estimator: None,
        }
    }

    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn best_params(&self) -> Option<&Params> {
        self.outcome.as_ref().map(|outcome| &outcome.best_params)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.outcome.as_ref().map(|outcome| outcome.best_score)
    }

    pub fn best_index(&self) -> Option<usize> {
        self.outcome.as_ref().map(|outcome| outcome.best_index)
    }

    pub fn cv_results(&self) -> Option<&[CandidateResult]> {
        self.outcome.as_ref().map(|outcome| outcome.cv_results.as_slice())
    }

    pub fn best_estimator(&self) -> Option<&dyn Estimator> {
        self.best_estimator.as_deref()
    }

    fn check_folds(&self, n_rows: usize) -> Result<(), EstimatorError> {
        if self.cv < 2 {
            return Err(EstimatorError::InvalidParam {
                param: "cv".into(),
                reason: format!("need at least 2 folds, got {}", self.cv),
            });
        }
        if n_rows < self.cv {
            return Err(EstimatorError::InvalidData(format!(
                "cannot split {n_rows} rows into {} folds",
                self.cv
            )));
        }
        Ok(())
    }
}

impl SearchWrapper for GridSearchCV {
    fn base_estimator(&self) -> &dyn Estimator {
        self.base.as_ref()
    }

    fn candidates(&self) -> Result<Vec<Params>, EstimatorError> {
        let all = expand_grid(&self.param_grid)?;
        match self.strategy {
            SearchStrategy::Grid => Ok(all),
            SearchStrategy::Random { n_iter, .. } if n_iter >= all.len() => Ok(all),
            SearchStrategy::Random { n_iter, seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                Ok(rand::seq::index::sample(&mut rng, all.len(), n_iter)
                    .into_iter()
                    .map(|index| all[index].clone())
                    .collect())
            }
        }
    }

    fn n_folds(&self) -> usize {
        self.cv
    }

    fn scoring(&self) -> Scoring {
        self.scoring
    }

    fn refit(&self) -> bool {
        self.refit
    }

    fn install(
        &mut self,
        outcome: SearchOutcome,
        best_estimator: Option<Box<dyn Estimator>>,
    ) -> Result<(), EstimatorError> {
        if let Some(best) = &best_estimator
            && best.class_name() != self.base.class_name()
        {
            return Err(EstimatorError::InvalidData(format!(
                "refit estimator is {}, expected {}",
                best.class_name(),
                self.base.class_name()
            )));
        }
        self.outcome = Some(outcome);
        self.best_estimator = best_estimator;
        Ok(())
    }

    fn outcome(&self) -> Option<&SearchOutcome> {
        self.outcome.as_ref()
    }
}

impl Estimator for GridSearchCV {
    fn class_name(&self) -> &'static str {
        CLASS
    }

    fn params(&self) -> Params {
        let (n_iter, seed) = match self.strategy {
            SearchStrategy::Grid => (0, 0),
            SearchStrategy::Random { n_iter, seed } => (n_iter, seed),
        };
        let mut params = Params::new();
        params.insert("cv".into(), ParamValue::Int(self.cv as i64));
        params.insert("scoring".into(), ParamValue::Text(self.scoring.to_string()));
        params.insert("refit".into(), ParamValue::Bool(self.refit));
        params.insert("n_iter".into(), ParamValue::Int(n_iter as i64));
        params.insert("seed".into(), ParamValue::Int(seed as i64));
        params
    }

    fn set_params(&mut self, params: &Params) -> Result<(), EstimatorError> {
        let reader = ParamReader::new(CLASS, params);
        reader.only(&["cv", "scoring", "refit", "n_iter", "seed"])?;
        if let Some(cv) = reader.usize("cv")? {
            self.cv = cv;
        }
        if let Some(scoring) = reader.text("scoring")? {
            self.scoring = scoring
                .parse()
                .map_err(|reason| EstimatorError::InvalidParam {
                    param: "scoring".into(),
                    reason,
                })?;
        }
        if let Some(refit) = reader.bool("refit")? {
            self.refit = refit;
        }
        let current_seed = match self.strategy {
            SearchStrategy::Random { seed, .. } => seed,
            SearchStrategy::Grid => 0,
        };
        let seed = reader.u64("seed")?.unwrap_or(current_seed);
        match reader.usize("n_iter")? {
            Some(0) => self.strategy = SearchStrategy::Grid,
            Some(n_iter) => self.strategy = SearchStrategy::Random { n_iter, seed },
            None => {
                if let SearchStrategy::Random { n_iter, .. } = self.strategy {
                    self.strategy = SearchStrategy::Random { n_iter, seed };
                }
            }
        }
        Ok(())
    }

    fn fit(&mut self, data: &TrainingData) -> Result<(), EstimatorError> {
        self.check_folds(data.n_rows())?;
        let candidates = self.candidates()?;
        let mut scores = Vec::with_capacity(candidates.len() * self.cv);
        for (candidate, params) in candidates.iter().enumerate() {
            for fold in 0..self.cv {
                let score =
                    evaluate_candidate(self.base.as_ref(), params, data, self.cv, fold, self.scoring)?;
                scores.push(FoldScore {
                    candidate,
                    fold,
                    score,
                });
            }
        }
        let outcome = aggregate(&candidates, self.cv, &scores, self.scoring).ok_or_else(|| {
            EstimatorError::Fit("no candidate produced a finite score".to_string())
        })?;
        let best_estimator = if self.refit {
            let mut best = self.base.boxed_clone();
            best.set_params(&outcome.best_params)?;
            best.fit(data)?;
            Some(best)
        } else {
            None
        };
        self.install(outcome, best_estimator)
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, EstimatorError> {
        match &self.best_estimator {
            Some(best) => best.predict(x),
            None => Err(EstimatorError::NotFitted(CLASS)),
        }
    }

    fn is_fitted(&self) -> bool {
        self.outcome.is_some()
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn state(&self) -> Result<Option<serde_json::Value>, EstimatorError> {
        let state = SearchState {
            base: EstimatorBlob::from_estimator(self.base.as_ref())?,
            param_grid: self.param_grid.clone(),
            outcome: self.outcome.clone(),
            best_estimator: self
                .best_estimator
                .as_deref()
                .map(EstimatorBlob::from_estimator)
                .transpose()?,
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn load_state(
        &mut self,
        state: serde_json::Value,
        registry: &EstimatorRegistry,
    ) -> Result<(), EstimatorError> {
        let state: SearchState = serde_json::from_value(state)?;
        self.base = registry.build(&state.base)?;
        self.param_grid = state.param_grid;
        self.outcome = state.outcome;
        self.best_estimator = state
            .best_estimator
            .as_ref()
            .map(|blob| registry.build(blob))
            .transpose()?;
        Ok(())
    }

    fn requirements(&self) -> Vec<String> {
        self.base.requirements()
    }

    fn accepts_sample_weight(&self) -> bool {
        self.base.accepts_sample_weight()
    }

    fn supports_multi_output(&self) -> bool {
        self.base.supports_multi_output()
    }

    fn search(&self) -> Option<&dyn SearchWrapper> {
        Some(self)
    }

    fn search_mut(&mut self) -> Option<&mut dyn SearchWrapper> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alpha_grid() -> ParamGrid {
        let mut grid = ParamGrid::new();
        grid.insert(
            "alpha".into(),
            vec![ParamValue::Float(1e-6), ParamValue::Float(1e3), ParamValue::Float(1e6)],
        );
        grid
    }

    fn linear_data(rows: usize) -> TrainingData {
        let x: Vec<Vec<f32>> = (0..rows).map(|i| vec![i as f32, (i % 4) as f32]).collect();
        let y = x.iter().map(|row| vec![3.0 * row[0] + row[1]]).collect();
        TrainingData {
            x,
            y,
            sample_weight: None,
        }
    }

    fn scores_for(candidates: usize, folds: usize, f: impl Fn(usize, usize) -> f64) -> Vec<FoldScore> {
        (0..candidates)
            .flat_map(|c| (0..folds).map(move |fold| (c, fold)))
            .map(|(candidate, fold)| FoldScore {
                candidate,
                fold,
                score: f(candidate, fold),
            })
            .collect()
    }

    #[test]
    fn grid_expands_last_name_fastest() {
        let mut grid = ParamGrid::new();
        grid.insert("a".into(), vec![1i64.into(), 2i64.into()]);
        grid.insert("b".into(), vec!["x".into(), "y".into()]);
        let candidates = expand_grid(&grid).unwrap();
        let rendered: Vec<String> = candidates.iter().map(super::super::format_params).collect();
        assert_eq!(
            rendered,
            vec![
                "a=1, b=\"x\"",
                "a=1, b=\"y\"",
                "a=2, b=\"x\"",
                "a=2, b=\"y\""
            ]
        );
        assert_eq!(expand_grid(&ParamGrid::new()).unwrap(), vec![Params::new()]);
    }

    #[test]
    fn aggregate_is_independent_of_arrival_order() {
        let candidates = expand_grid(&alpha_grid()).unwrap();
        let scores = scores_for(3, 2, |c, _| if c == 0 { 0.5 } else { 0.9 });
        let forward = aggregate(&candidates, 2, &scores, Scoring::R2).unwrap();
        let mut reversed = scores.clone();
        reversed.reverse();
        let backward = aggregate(&candidates, 2, &reversed, Scoring::R2).unwrap();
        assert_eq!(forward, backward);
        // Tie between candidates 1 and 2 goes to the lower canonical index.
        assert_eq!(forward.best_index, 1);
        assert_eq!(forward.cv_results[2].rank, Some(2));
        assert_eq!(forward.cv_results[0].rank, Some(3));
    }

    #[test]
    fn aggregate_respects_lower_is_better_and_missing_folds() {
        let candidates = expand_grid(&alpha_grid()).unwrap();
        let mut scores = scores_for(3, 2, |c, fold| (c * 10 + fold) as f64);
        scores.retain(|s| !(s.candidate == 0));
        let outcome = aggregate(&candidates, 2, &scores, Scoring::MeanSquaredError).unwrap();
        assert_eq!(outcome.best_index, 1);
        assert_eq!(outcome.cv_results[0].mean_score, None);
        assert_eq!(outcome.cv_results[0].rank, None);
        assert_eq!(outcome.cv_results[1].fold_scores, vec![Some(10.0), Some(11.0)]);
        assert!(aggregate(&candidates, 2, &[], Scoring::R2).is_none());
    }

    #[test]
    fn local_fit_selects_least_regularized_alpha() {
        let mut search = GridSearchCV::new(
            Box::new(RidgeRegression::default()),
            alpha_grid(),
            3,
            Scoring::R2,
        );
        search.fit(&linear_data(30)).unwrap();
        assert_eq!(search.best_index(), Some(0));
        assert_eq!(search.cv_results().unwrap().len(), 3);
        let out = search.predict(&[vec![10.0, 2.0]]).unwrap();
        assert!((out[0][0] - 32.0).abs() < 0.1);
    }

    #[test]
    fn random_strategy_is_seeded() {
        let mut grid = ParamGrid::new();
        grid.insert("alpha".into(), (1..=10).map(|v| ParamValue::Int(v)).collect());
        let search = GridSearchCV::new(Box::new(RidgeRegression::default()), grid, 2, Scoring::R2)
            .with_strategy(SearchStrategy::Random { n_iter: 4, seed: 7 });
        let a = search.candidates().unwrap();
        let b = search.clone().candidates().unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn state_round_trip_keeps_grid_outcome_and_best_estimator() {
        let mut search = GridSearchCV::new(
            Box::new(RidgeRegression::default()),
            alpha_grid(),
            2,
            Scoring::R2,
        );
        search.fit(&linear_data(12)).unwrap();
        let blob = EstimatorBlob::from_estimator(&search).unwrap();
        let restored = EstimatorRegistry::with_builtins().build(&blob).unwrap();
        let restored_search = restored.search().unwrap();
        assert_eq!(restored_search.outcome(), search.outcome.as_ref());
        assert_eq!(
            restored.predict(&[vec![1.0, 1.0]]).unwrap(),
            search.predict(&[vec![1.0, 1.0]]).unwrap()
        );
    }

    #[test]
    fn too_few_rows_for_folds_is_an_error() {
        let mut search = GridSearchCV::new(
            Box::new(RidgeRegression::default()),
            alpha_grid(),
            5,
            Scoring::R2,
        );
        assert!(matches!(
            search.fit(&linear_data(3)),
            Err(EstimatorError::InvalidData(_))
        ));
    }
}
