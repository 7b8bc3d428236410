//! Capability probe for estimators.

use serde::{Deserialize, Serialize};

use super::Estimator;

/// Optional behaviors an estimator supports.
///
/// Produced once per request by [`CapabilitySet::probe`]; dispatch and
/// validation read these flags instead of asking the estimator again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// Wraps a base estimator and searches a hyperparameter space.
    pub search_wrapper: bool,
    /// Can be fit chunk by chunk through `partial_fit`.
    pub external_memory: bool,
    /// Accepts more than one label column.
    pub multi_output: bool,
    /// Accepts a per-row sample weight.
    pub sample_weight: bool,
}

impl CapabilitySet {
    /// Inspect an estimator. Never fails; anything not declared is `false`.
    pub fn probe(estimator: &dyn Estimator) -> Self {
        Self {
            search_wrapper: estimator.search().is_some(),
            external_memory: estimator.supports_partial_fit(),
            multi_output: estimator.supports_multi_output(),
            sample_weight: estimator.accepts_sample_weight(),
        }
    }
}
