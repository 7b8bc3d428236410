use std::collections::BTreeMap;

use super::{
    BoostedStumps, Estimator, EstimatorBlob, EstimatorError, GridSearchCV, LogisticRegression,
    RidgeRegression,
};

type Factory = fn() -> Box<dyn Estimator>;

/// Maps estimator class names to constructors so serialized estimators can be
/// rebuilt on either side of a remote call.
#[derive(Debug, Clone, Default)]
pub struct EstimatorRegistry {
    factories: BTreeMap<String, Factory>,
}

impl EstimatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in estimator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("RidgeRegression", || Box::new(RidgeRegression::default()));
        registry.register("LogisticRegression", || {
            Box::new(LogisticRegression::default())
        });
        registry.register("BoostedStumps", || Box::new(BoostedStumps::default()));
        registry.register("GridSearchCV", || Box::new(GridSearchCV::default()));
        registry
    }

    /// Add or replace a constructor.
    pub fn register(&mut self, class: &str, factory: Factory) {
        self.factories.insert(class.to_string(), factory);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Rebuild an estimator: construct, apply params, then load fitted state.
    pub fn build(&self, blob: &EstimatorBlob) -> Result<Box<dyn Estimator>, EstimatorError> {
        let factory = self
            .factories
            .get(&blob.class)
            .ok_or_else(|| EstimatorError::UnknownClass(blob.class.clone()))?;
        let mut estimator = factory();
        estimator.set_params(&blob.params)?;
        if let Some(state) = &blob.state {
            estimator.load_state(state.clone(), self)?;
        }
        Ok(estimator)
    }
}
