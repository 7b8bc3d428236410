//! Remote execution package: the serialized estimator, fit arguments and
//! dependency manifest shipped to the substrate.
//!
//! The manifest is checked against the substrate's installed packages before
//! anything is submitted, and the serialized estimator carries a SHA-256
//! checksum that the remote driver verifies before fitting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::estimator::{Estimator, EstimatorBlob, EstimatorError, EstimatorRegistry};
use crate::spec::ModelSpecification;

pub mod manifest;

pub use manifest::{
    DependencyManifest, EnvironmentConflict, ManifestError, Requirement, canonical_name,
};

/// Package name of this runtime as reported by the substrate.
pub const RUNTIME_PACKAGE: &str = "remotefit";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Package serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Estimator checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Estimator(#[from] EstimatorError),
}

/// Arguments the remote driver passes to `fit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitArguments {
    pub input_cols: Vec<String>,
    pub label_cols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_weight_col: Option<String>,
    /// Fit with `partial_fit` instead of `fit`.
    #[serde(default)]
    pub partial: bool,
}

impl FitArguments {
    pub fn from_spec(spec: &ModelSpecification) -> Self {
        Self {
            input_cols: spec.input_cols().to_vec(),
            label_cols: spec.label_cols().to_vec(),
            sample_weight_col: spec.sample_weight_col().map(str::to_string),
            partial: spec.is_fit_method_partial(),
        }
    }

    /// Columns read from the staged input.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = self.input_cols.clone();
        columns.extend(self.label_cols.iter().cloned());
        columns.extend(self.sample_weight_col.iter().cloned());
        columns
    }
}

/// Self-contained unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteExecutionPackage {
    /// JSON-encoded [`EstimatorBlob`].
    pub serialized_estimator: String,
    /// Lowercase hex SHA-256 of `serialized_estimator`.
    pub checksum: String,
    pub fit_arguments: FitArguments,
    pub dependency_manifest: DependencyManifest,
    /// Staged table the driver reads, set once input is staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_input_ref: Option<String>,
}

impl RemoteExecutionPackage {
    /// Serialize `estimator` and assemble its manifest.
    ///
    /// The manifest holds the runtime itself (pin relaxed to the major
    /// version), the estimator's declared requirements and `extra`.
    pub fn build(
        spec: &ModelSpecification,
        estimator: &dyn Estimator,
        extra: &[String],
    ) -> Result<Self, PackageError> {
        let blob = EstimatorBlob::from_estimator(estimator)?;
        let serialized_estimator = serde_json::to_string(&blob)?;
        let mut manifest = DependencyManifest::new();
        manifest.add(runtime_requirement()?)?;
        for requirement in estimator.requirements().iter().chain(extra) {
            manifest.add(Requirement::parse(requirement)?)?;
        }
        Ok(Self {
            checksum: checksum(serialized_estimator.as_bytes()),
            serialized_estimator,
            fit_arguments: FitArguments::from_spec(spec),
            dependency_manifest: manifest,
            staged_input_ref: None,
        })
    }

    pub fn with_staged_input(mut self, table: impl Into<String>) -> Self {
        self.staged_input_ref = Some(table.into());
        self
    }

    /// Same package carrying a different estimator (e.g. the fitted one).
    pub fn with_estimator(mut self, estimator: &dyn Estimator) -> Result<Self, PackageError> {
        self.serialized_estimator = serde_json::to_string(&EstimatorBlob::from_estimator(estimator)?)?;
        self.checksum = checksum(self.serialized_estimator.as_bytes());
        Ok(self)
    }

    /// Check the manifest against the substrate's installed packages.
    pub fn check_environment(
        &self,
        installed: &BTreeMap<String, String>,
    ) -> Result<(), EnvironmentConflict> {
        self.dependency_manifest.check(installed)
    }

    /// Fail when the estimator payload does not match its checksum.
    pub fn verify(&self) -> Result<(), PackageError> {
        let actual = checksum(self.serialized_estimator.as_bytes());
        if actual == self.checksum {
            Ok(())
        } else {
            Err(PackageError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            })
        }
    }

    /// Verify and rebuild the estimator.
    pub fn estimator(&self, registry: &EstimatorRegistry) -> Result<Box<dyn Estimator>, PackageError> {
        self.verify()?;
        let blob: EstimatorBlob = serde_json::from_str(&self.serialized_estimator)?;
        Ok(registry.build(&blob)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PackageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PackageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `remotefit==<this version>` relaxed to a major-version range.
pub fn runtime_requirement() -> Result<Requirement, ManifestError> {
    Requirement::parse(&format!("{RUNTIME_PACKAGE}=={}", env!("CARGO_PKG_VERSION")))?.relax()
}

/// Lowercase hex SHA-256 digest.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ColumnType, Field, Schema};
    use crate::estimator::{BoostedStumps, RidgeRegression};

    fn spec_for(estimator: &dyn Estimator) -> ModelSpecification {
        let schema = Schema::new(vec![
            Field::new("X", ColumnType::Float),
            Field::new("Y", ColumnType::Float),
        ])
        .unwrap();
        ModelSpecification::builder(estimator)
            .input_cols(["X"])
            .label_cols(["Y"])
            .build(&schema)
            .unwrap()
    }

    #[test]
    fn build_collects_runtime_estimator_and_extra_requirements() {
        let boost = BoostedStumps::default();
        let package =
            RemoteExecutionPackage::build(&spec_for(&boost), &boost, &["numpy>=1.0".into()])
                .unwrap();
        let names: Vec<&str> = package.dependency_manifest.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["numpy", "remotefit", "remotefit-boost"]);
        assert_eq!(package.fit_arguments.columns(), vec!["X", "Y"]);
        assert!(package.staged_input_ref.is_none());
        package.verify().unwrap();
    }

    #[test]
    fn conflicting_extra_requirement_is_rejected() {
        let ridge = RidgeRegression::default();
        let err = RemoteExecutionPackage::build(
            &spec_for(&ridge),
            &ridge,
            &["remotefit-linear<0.1".into()],
        )
        .unwrap_err();
        assert!(matches!(err, PackageError::Manifest(ManifestError::Duplicate { .. })));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let ridge = RidgeRegression::default();
        let mut package = RemoteExecutionPackage::build(&spec_for(&ridge), &ridge, &[]).unwrap();
        package.serialized_estimator = package.serialized_estimator.replace("1.0", "2.0");
        assert!(matches!(
            package.estimator(&EstimatorRegistry::with_builtins()),
            Err(PackageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bytes_round_trip_rebuilds_estimator() {
        let ridge = RidgeRegression::new(3.0);
        let package = RemoteExecutionPackage::build(&spec_for(&ridge), &ridge, &[])
            .unwrap()
            .with_staged_input("RF_ABC_INPUT");
        let back = RemoteExecutionPackage::from_bytes(&package.to_bytes().unwrap()).unwrap();
        assert_eq!(back, package);
        let rebuilt = back.estimator(&EstimatorRegistry::with_builtins()).unwrap();
        assert_eq!(rebuilt.class_name(), "RidgeRegression");
        assert_eq!(rebuilt.params(), ridge.params());
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
