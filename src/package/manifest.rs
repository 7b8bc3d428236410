//! Requirement strings and the dependency manifest.
//!
//! Requirements use the familiar `name<specifier>` form (`xgboost>=2.0,<3.0`,
//! `scikit-learn==1.3.2`, `numpy!=1.8.*`, bare `numpy`). Specifiers are
//! translated to [`semver::VersionReq`] for matching, with `!=` clauses kept
//! as exclusions; versions are parsed leniently so that `1.8` means `1.8.0`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing requirements or assembling a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("Invalid requirement {requirement:?}: {reason}")]
    InvalidRequirement { requirement: String, reason: String },
    /// The interpreter/runtime itself is not a package.
    #[error("Don't list {0} as a dependency; the runtime is managed separately")]
    RuntimeDependency(String),
    #[error("Duplicate dependency {name}: {first} and {second}")]
    Duplicate {
        name: String,
        first: String,
        second: String,
    },
    #[error("Invalid version {0:?}")]
    InvalidVersion(String),
}

/// Names that may not appear as dependencies.
const RESERVED_NAMES: &[&str] = &["python"];

/// Lowercase, with `_` and `.` folded to `-`.
pub fn canonical_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect()
}

/// Parse `1`, `1.8`, `1.8.0`, `1.8.0.post1` or `2.0rc1` into a semver version,
/// keeping the first three numeric components.
pub fn parse_version(text: &str) -> Result<Version, ManifestError> {
    let text = text.trim().trim_start_matches('v');
    let numeric: String = text
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let parts: Vec<&str> = numeric.split('.').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        return Err(ManifestError::InvalidVersion(text.to_string()));
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| ManifestError::InvalidVersion(text.to_string()))?;
    }
    Ok(Version::new(numbers[0], numbers[1], numbers[2]))
}

/// One `name<specifier>` requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Requirement {
    name: String,
    /// Normalized specifier clauses, e.g. `[">=2.0", "<3.0"]`.
    clauses: Vec<String>,
    req: VersionReq,
    /// Versions ruled out by `!=` clauses.
    excluded: Vec<VersionReq>,
}

impl Requirement {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidRequirement {
            requirement: text.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = text.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(trimmed.len());
        let (name, spec) = trimmed.split_at(split);
        if name.is_empty() {
            return Err(invalid("missing package name"));
        }
        let name = canonical_name(name);
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(ManifestError::RuntimeDependency(name));
        }
        let clauses: Vec<String> = spec
            .split(',')
            .map(|clause| clause.split_whitespace().collect::<String>())
            .filter(|clause| !clause.is_empty())
            .collect();
        if !spec.trim().is_empty() && clauses.is_empty() {
            return Err(invalid("empty specifier"));
        }
        let mut comparators = Vec::new();
        let mut excluded = Vec::new();
        for clause in &clauses {
            match translate_clause(clause).map_err(|reason| invalid(&reason))? {
                Clause::Require(found) => comparators.extend(found),
                Clause::Exclude(found) => excluded.push(
                    VersionReq::parse(&found.join(", ")).map_err(|err| invalid(&err.to_string()))?,
                ),
            }
        }
        let req = if comparators.is_empty() {
            VersionReq::STAR
        } else {
            VersionReq::parse(&comparators.join(", ")).map_err(|err| invalid(&err.to_string()))?
        };
        Ok(Self {
            name,
            clauses,
            req,
            excluded,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Specifier text without the name, empty for "any version".
    pub fn specifier(&self) -> String {
        self.clauses.join(",")
    }

    /// Range the version must fall in; `!=` exclusions are not part of it.
    pub fn version_req(&self) -> &VersionReq {
        &self.req
    }

    /// Whether an installed version string satisfies this requirement.
    pub fn matches(&self, installed: &str) -> Result<bool, ManifestError> {
        let version = parse_version(installed)?;
        Ok(self.req.matches(&version) && !self.excluded.iter().any(|req| req.matches(&version)))
    }

    /// Replace exact pins `==X.Y.Z` with `>=X.Y,<X+1` so compatible upgrades
    /// on the substrate still satisfy the requirement.
    pub fn relax(&self) -> Result<Self, ManifestError> {
        let mut clauses = Vec::new();
        for clause in &self.clauses {
            match clause.strip_prefix("==") {
                Some(version) if !version.starts_with('=') && !version.ends_with(".*") => {
                    let pinned = parse_version(version)?;
                    clauses.push(format!(">={}.{}", pinned.major, pinned.minor));
                    clauses.push(format!("<{}", pinned.major + 1));
                }
                _ => clauses.push(clause.clone()),
            }
        }
        Self::parse(&format!("{}{}", self.name, clauses.join(",")))
    }
}

/// Semver comparators a clause requires, or (for `!=`) rules out.
enum Clause {
    Require(Vec<String>),
    Exclude(Vec<String>),
}

/// Translate one specifier clause into semver comparators.
fn translate_clause(clause: &str) -> Result<Clause, String> {
    const OPERATORS: &[&str] = &["===", "==", "!=", "~=", ">=", "<=", ">", "<", "="];
    let op = OPERATORS
        .iter()
        .find(|op| clause.starts_with(**op))
        .ok_or_else(|| format!("clause {clause:?} has no comparison operator"))?;
    let version_text = &clause[op.len()..];
    if let Some(prefix) = version_text.strip_suffix(".*") {
        if !matches!(*op, "==" | "=" | "!=") {
            return Err(format!("wildcard only allowed with == or !=, got {clause:?}"));
        }
        let base = parse_version(prefix).map_err(|err| err.to_string())?;
        let components = prefix.split('.').count();
        let upper = if components >= 2 {
            Version::new(base.major, base.minor + 1, 0)
        } else {
            Version::new(base.major + 1, 0, 0)
        };
        let range = vec![format!(">={base}"), format!("<{upper}")];
        return Ok(if *op == "!=" {
            Clause::Exclude(range)
        } else {
            Clause::Require(range)
        });
    }
    let version = parse_version(version_text).map_err(|err| err.to_string())?;
    let comparators = match *op {
        "===" | "==" | "=" => vec![format!("={version}")],
        "!=" => return Ok(Clause::Exclude(vec![format!("={version}")])),
        ">=" => vec![format!(">={version}")],
        "<=" => vec![format!("<={version}")],
        ">" => vec![format!(">{version}")],
        "<" => vec![format!("<{version}")],
        "~=" => {
            let components = version_text.split('.').count();
            if components < 2 {
                return Err(format!("~= needs at least two components, got {clause:?}"));
            }
            let upper = if components == 2 {
                Version::new(version.major + 1, 0, 0)
            } else {
                Version::new(version.major, version.minor + 1, 0)
            };
            vec![format!(">={version}"), format!("<{upper}")]
        }
        _ => return Err(format!("operator {op} is not supported")),
    };
    Ok(Clause::Require(comparators))
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.specifier())
    }
}

impl FromStr for Requirement {
    type Err = ManifestError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

impl TryFrom<String> for Requirement {
    type Error = ManifestError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(&text)
    }
}

impl From<Requirement> for String {
    fn from(req: Requirement) -> Self {
        req.to_string()
    }
}

/// First package whose installed version does not satisfy the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConflict {
    pub package: String,
    pub required: String,
    /// `None` when the package is not installed at all.
    pub installed: Option<String>,
}

/// Package name → requirement, one entry per package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyManifest {
    entries: BTreeMap<String, Requirement>,
}

impl DependencyManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and merge a list of requirement strings.
    pub fn from_requirements<I, S>(requirements: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut manifest = Self::new();
        for requirement in requirements {
            manifest.add(Requirement::parse(requirement.as_ref())?)?;
        }
        Ok(manifest)
    }

    /// Add a requirement. Repeating an identical requirement is a no-op;
    /// a different requirement for the same package is an error.
    pub fn add(&mut self, requirement: Requirement) -> Result<(), ManifestError> {
        match self.entries.get(requirement.name()) {
            Some(existing) if existing.specifier() == requirement.specifier() => Ok(()),
            Some(existing) => Err(ManifestError::Duplicate {
                name: requirement.name().to_string(),
                first: existing.to_string(),
                second: requirement.to_string(),
            }),
            None => {
                self.entries.insert(requirement.name().to_string(), requirement);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        self.entries.get(&canonical_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every requirement against installed versions, in name order.
    pub fn check(&self, installed: &BTreeMap<String, String>) -> Result<(), EnvironmentConflict> {
        for requirement in self.entries.values() {
            let found = installed.get(requirement.name());
            let satisfied = found.is_some_and(|version| requirement.matches(version).unwrap_or(false));
            if !satisfied {
                return Err(EnvironmentConflict {
                    package: requirement.name().to_string(),
                    required: requirement.to_string(),
                    installed: found.cloned(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_canonicalises_names() {
        let req = Requirement::parse("XGBoost >= 2.0, < 3.0").unwrap();
        assert_eq!(req.name(), "xgboost");
        assert_eq!(req.to_string(), "xgboost>=2.0,<3.0");
        assert!(req.matches("2.1").unwrap());
        assert!(!req.matches("1.8").unwrap());
        assert!(!req.matches("3.0.0").unwrap());
        assert_eq!(Requirement::parse("Scikit_Learn").unwrap().name(), "scikit-learn");
    }

    #[test]
    fn lenient_versions() {
        assert_eq!(parse_version("1.8").unwrap(), Version::new(1, 8, 0));
        assert_eq!(parse_version("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_version("1.2.3.4").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("2.0rc1").unwrap(), Version::new(2, 0, 0));
        assert!(parse_version("abc").is_err());
    }

    #[test]
    fn rejects_runtime_and_bad_operators() {
        assert!(matches!(
            Requirement::parse("python>=3.8"),
            Err(ManifestError::RuntimeDependency(_))
        ));
        assert!(Requirement::parse("numpy 1.0").is_err());
        assert!(Requirement::parse("numpy>=1.*").is_err());
    }

    #[test]
    fn compatible_release_and_wildcards() {
        let req = Requirement::parse("pandas~=1.4.2").unwrap();
        assert!(req.matches("1.4.9").unwrap());
        assert!(!req.matches("1.5.0").unwrap());
        let req = Requirement::parse("pandas~=1.4").unwrap();
        assert!(req.matches("1.9.0").unwrap());
        assert!(!req.matches("2.0.0").unwrap());
        let req = Requirement::parse("numpy==1.2.*").unwrap();
        assert!(req.matches("1.2.7").unwrap());
        assert!(!req.matches("1.3.0").unwrap());
    }

    #[test]
    fn exclusions_rule_out_versions_inside_the_range() {
        let req = Requirement::parse("numpy>=1.0,!=1.8").unwrap();
        assert_eq!(req.to_string(), "numpy>=1.0,!=1.8");
        assert!(!req.matches("1.8.0").unwrap());
        assert!(req.matches("1.8.1").unwrap());
        assert!(req.matches("1.9").unwrap());
        assert!(!req.matches("0.9").unwrap());

        let req = Requirement::parse("numpy!=1.8.*").unwrap();
        assert!(!req.matches("1.8.4").unwrap());
        assert!(req.matches("1.9.0").unwrap());
        assert!(req.matches("1.7.9").unwrap());

        let manifest = DependencyManifest::from_requirements(["numpy!=1.8.*"]).unwrap();
        let mut installed = BTreeMap::new();
        installed.insert("numpy".to_string(), "1.8.2".to_string());
        let conflict = manifest.check(&installed).unwrap_err();
        assert_eq!(conflict.required, "numpy!=1.8.*");
        installed.insert("numpy".to_string(), "2.0".to_string());
        assert!(manifest.check(&installed).is_ok());
    }

    #[test]
    fn relax_turns_pins_into_major_ranges() {
        let relaxed = Requirement::parse("remotefit==0.3.7").unwrap().relax().unwrap();
        assert_eq!(relaxed.to_string(), "remotefit>=0.3,<1");
        assert!(relaxed.matches("0.9.0").unwrap());
        assert!(!relaxed.matches("0.2.9").unwrap());
        let untouched = Requirement::parse("numpy>=1.0").unwrap().relax().unwrap();
        assert_eq!(untouched.to_string(), "numpy>=1.0");
    }

    #[test]
    fn manifest_rejects_conflicting_duplicates() {
        let mut manifest =
            DependencyManifest::from_requirements(["numpy>=1.0", "numpy>=1.0"]).unwrap();
        assert_eq!(manifest.len(), 1);
        let err = manifest.add(Requirement::parse("NumPy>=2.0").unwrap()).unwrap_err();
        assert!(matches!(err, ManifestError::Duplicate { .. }));
    }

    #[test]
    fn check_names_first_conflict() {
        let manifest =
            DependencyManifest::from_requirements(["xgboost>=2.0,<3.0", "zlib", "abc"]).unwrap();
        let mut installed = BTreeMap::new();
        installed.insert("xgboost".to_string(), "1.8".to_string());
        installed.insert("zlib".to_string(), "1.0".to_string());
        let conflict = manifest.check(&installed).unwrap_err();
        assert_eq!(conflict.package, "abc");
        assert_eq!(conflict.installed, None);

        installed.insert("abc".to_string(), "0.1".to_string());
        let conflict = manifest.check(&installed).unwrap_err();
        assert_eq!(conflict.package, "xgboost");
        assert_eq!(conflict.required, "xgboost>=2.0,<3.0");
        assert_eq!(conflict.installed.as_deref(), Some("1.8"));
    }

    #[test]
    fn manifest_serializes_as_plain_strings() {
        let manifest = DependencyManifest::from_requirements(["numpy>=1.0"]).unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        assert_eq!(json, r#"{"numpy":"numpy>=1.0"}"#);
        let back: DependencyManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
