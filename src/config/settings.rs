use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

fn default_local_memory_threshold_bytes() -> u64 {
    512 * MIB
}

fn default_true() -> bool {
    true
}

fn default_chunk_rows() -> u64 {
    10_000
}

fn default_submit_timeout_secs() -> u64 {
    3_600
}

fn default_max_concurrent_units() -> usize {
    8
}

fn default_staging_prefix() -> String {
    "RF".to_string()
}

/// How many distributed-search work units may fail before the search fails.
///
/// Config forms: `failure_tolerance = { max_failed_units = 1 }` or
/// `failure_tolerance = { max_failed_fraction = 0.25 }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTolerance {
    MaxFailedUnits(usize),
    /// Fraction of all units, rounded down.
    MaxFailedFraction(f64),
}

impl Default for FailureTolerance {
    fn default() -> Self {
        Self::MaxFailedUnits(0)
    }
}

impl FailureTolerance {
    /// Number of failures tolerated out of `total` units.
    pub fn allowed(&self, total: usize) -> usize {
        match *self {
            Self::MaxFailedUnits(units) => units,
            Self::MaxFailedFraction(fraction) => {
                (fraction.clamp(0.0, 1.0) * total as f64).floor() as usize
            }
        }
    }

    fn normalized(self) -> Self {
        match self {
            Self::MaxFailedFraction(fraction) if fraction.is_nan() => Self::MaxFailedFraction(0.0),
            Self::MaxFailedFraction(fraction) => Self::MaxFailedFraction(fraction.clamp(0.0, 1.0)),
            other => other,
        }
    }
}

/// Knobs for dispatch, staging and remote execution.
///
/// Config keys (TOML): `local_memory_threshold_bytes`, `distributed_search_enabled`,
/// `failure_tolerance`, `chunk_rows`, `remote_memory_budget_bytes`,
/// `submit_timeout_secs`, `max_concurrent_units`, `staging_prefix`,
/// `extra_requirements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Datasets estimated above this size go through external memory when possible.
    #[serde(default = "default_local_memory_threshold_bytes")]
    pub local_memory_threshold_bytes: u64,
    #[serde(default = "default_true")]
    pub distributed_search_enabled: bool,
    #[serde(default)]
    pub failure_tolerance: FailureTolerance,
    /// Rows per external-memory chunk when no memory budget is set.
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: u64,
    /// Memory available to one remote executor; overrides `chunk_rows`.
    #[serde(default)]
    pub remote_memory_budget_bytes: Option<u64>,
    /// Blocking-call timeout for remote submissions, `0` waits forever.
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_units")]
    pub max_concurrent_units: usize,
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,
    /// Requirement strings added to every dependency manifest.
    #[serde(default)]
    pub extra_requirements: Vec<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            local_memory_threshold_bytes: default_local_memory_threshold_bytes(),
            distributed_search_enabled: true,
            failure_tolerance: FailureTolerance::default(),
            chunk_rows: default_chunk_rows(),
            remote_memory_budget_bytes: None,
            submit_timeout_secs: default_submit_timeout_secs(),
            max_concurrent_units: default_max_concurrent_units(),
            staging_prefix: default_staging_prefix(),
            extra_requirements: Vec::new(),
        }
    }
}

impl TrainingSettings {
    pub fn normalized(mut self) -> Self {
        self.chunk_rows = self.chunk_rows.max(1);
        self.max_concurrent_units = self.max_concurrent_units.max(1);
        self.failure_tolerance = self.failure_tolerance.normalized();
        if self.remote_memory_budget_bytes == Some(0) {
            self.remote_memory_budget_bytes = None;
        }
        if self.staging_prefix.trim().is_empty() {
            self.staging_prefix = default_staging_prefix();
        }
        self
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        (self.submit_timeout_secs > 0).then(|| Duration::from_secs(self.submit_timeout_secs))
    }

    /// Rows per external-memory chunk for rows of `row_width` bytes.
    pub fn chunk_rows_for(&self, row_width: u64) -> u64 {
        match self.remote_memory_budget_bytes {
            Some(budget) => (budget / row_width.max(1)).max(1),
            None => self.chunk_rows.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let settings: TrainingSettings = toml::from_str("chunk_rows = 25").unwrap();
        assert_eq!(settings.chunk_rows, 25);
        assert_eq!(settings.local_memory_threshold_bytes, 512 * MIB);
        assert!(settings.distributed_search_enabled);
        assert_eq!(settings.failure_tolerance, FailureTolerance::MaxFailedUnits(0));
        assert_eq!(settings.submit_timeout(), Some(Duration::from_secs(3_600)));
    }

    #[test]
    fn tolerance_forms_parse() {
        let settings: TrainingSettings =
            toml::from_str("failure_tolerance = { max_failed_fraction = 0.25 }").unwrap();
        assert_eq!(settings.failure_tolerance.allowed(6), 1);
        let settings: TrainingSettings =
            toml::from_str("failure_tolerance = { max_failed_units = 2 }").unwrap();
        assert_eq!(settings.failure_tolerance.allowed(6), 2);
    }

    #[test]
    fn normalized_clamps_nonsense() {
        let settings = TrainingSettings {
            chunk_rows: 0,
            max_concurrent_units: 0,
            failure_tolerance: FailureTolerance::MaxFailedFraction(4.0),
            remote_memory_budget_bytes: Some(0),
            staging_prefix: "  ".into(),
            submit_timeout_secs: 0,
            ..TrainingSettings::default()
        }
        .normalized();
        assert_eq!(settings.chunk_rows, 1);
        assert_eq!(settings.max_concurrent_units, 1);
        assert_eq!(settings.failure_tolerance, FailureTolerance::MaxFailedFraction(1.0));
        assert_eq!(settings.remote_memory_budget_bytes, None);
        assert_eq!(settings.staging_prefix, "RF");
        assert_eq!(settings.submit_timeout(), None);
    }

    #[test]
    fn memory_budget_drives_chunk_size() {
        let mut settings = TrainingSettings::default();
        assert_eq!(settings.chunk_rows_for(24), 10_000);
        settings.remote_memory_budget_bytes = Some(240);
        assert_eq!(settings.chunk_rows_for(24), 10);
        assert_eq!(settings.chunk_rows_for(1_000), 1);
    }
}
