//! Execution-mode selection.
//!
//! [`select_mode`] is a pure function of the dataset profile, the capability
//! set, the policy and the override. First matching rule wins:
//!
//! 1. an explicit override, when compatible
//! 2. search wrapper over remote data with distributed search enabled
//! 3. external-memory capable estimator over data above the memory threshold
//! 4. remote data
//! 5. local

use crate::config::TrainingSettings;
use crate::dataset::{DatasetProfile, Locality};
use crate::error::TrainingError;
use crate::estimator::CapabilitySet;

use super::ExecutionMode;

/// Settings that influence dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub local_memory_threshold_bytes: u64,
    pub distributed_search_enabled: bool,
}

impl DispatchPolicy {
    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self {
            local_memory_threshold_bytes: settings.local_memory_threshold_bytes,
            distributed_search_enabled: settings.distributed_search_enabled,
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_settings(&TrainingSettings::default())
    }
}

/// Why `mode` cannot run, or `None` when it can.
fn incompatibility(
    mode: ExecutionMode,
    profile: &DatasetProfile,
    capabilities: &CapabilitySet,
) -> Option<&'static str> {
    let needs_substrate = mode != ExecutionMode::Local || profile.locality == Locality::Remote;
    if needs_substrate && !profile.substrate_available {
        return Some("no substrate session is available");
    }
    match mode {
        ExecutionMode::Local | ExecutionMode::RemoteSingleNode => None,
        ExecutionMode::DistributedSearch if !capabilities.search_wrapper => {
            Some("the estimator is not a hyperparameter-search wrapper")
        }
        ExecutionMode::ExternalMemory if !capabilities.external_memory => {
            Some("the estimator has no chunked fit method")
        }
        ExecutionMode::DistributedSearch | ExecutionMode::ExternalMemory => None,
    }
}

pub fn select_mode(
    profile: &DatasetProfile,
    capabilities: &CapabilitySet,
    policy: &DispatchPolicy,
    mode_override: Option<ExecutionMode>,
) -> Result<ExecutionMode, TrainingError> {
    if let Some(mode) = mode_override {
        return match incompatibility(mode, profile, capabilities) {
            None => Ok(mode),
            Some(reason) => Err(TrainingError::UnsupportedMode {
                mode,
                reason: reason.to_string(),
            }),
        };
    }
    let remote = profile.locality == Locality::Remote;
    if capabilities.search_wrapper
        && remote
        && policy.distributed_search_enabled
        && profile.substrate_available
    {
        return Ok(ExecutionMode::DistributedSearch);
    }
    if capabilities.external_memory
        && profile.substrate_available
        && profile.exceeds(policy.local_memory_threshold_bytes)
    {
        return Ok(ExecutionMode::ExternalMemory);
    }
    if remote {
        return match incompatibility(ExecutionMode::RemoteSingleNode, profile, capabilities) {
            None => Ok(ExecutionMode::RemoteSingleNode),
            Some(reason) => Err(TrainingError::UnsupportedMode {
                mode: ExecutionMode::RemoteSingleNode,
                reason: reason.to_string(),
            }),
        };
    }
    Ok(ExecutionMode::Local)
}
