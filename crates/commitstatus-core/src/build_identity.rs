//! Build identity extraction from workload instances.
//!
//! A build workload (e.g. the pod running a pipeline step) declares who and
//! what it is building through environment variables on its init
//! containers. This module turns those loosely typed key/value pairs into a
//! [`BuildIdentity`], or into a typed [`IdentityError`] explaining why the
//! workload is not something the controller should act on.
//!
//! # Recognized Keys
//!
//! | Variable | Field |
//! |----------|-------|
//! | `REPO_OWNER` | `owner` |
//! | `REPO_NAME` | `repo` |
//! | `PULL_NUMBER` | `pull_request` (as `PR-<n>`) |
//! | `PULL_PULL_SHA` | pull request head sha |
//! | `PULL_BASE_SHA` | base sha |
//! | `JX_BUILD_NUMBER` (configurable) | `build_number` |
//! | `SOURCE_URL` | `source_url` |
//! | `PULL_BASE_REF` | `branch` |
//!
//! # Resolution
//!
//! When a pull request number is declared, the effective commit is the pull
//! request head and the branch label becomes the pull request identifier.
//! Otherwise the effective commit is the base sha and the branch keeps its
//! declared value.
//!
//! Extraction fails closed: a workload missing any required field yields
//! [`IdentityError::IncompleteIdentity`] instead of an identity with empty
//! fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::naming;

/// Label carrying the build name on build workloads.
pub const LABEL_BUILD_NAME: &str = "build-name";

/// Legacy label carrying the build name on older build workloads.
pub const LABEL_LEGACY_BUILD_NAME: &str = "build.knative.dev/buildName";

/// Default environment variable holding the build number.
pub const DEFAULT_BUILD_NUMBER_VAR: &str = "JX_BUILD_NUMBER";

const ENV_REPO_OWNER: &str = "REPO_OWNER";
const ENV_REPO_NAME: &str = "REPO_NAME";
const ENV_PULL_NUMBER: &str = "PULL_NUMBER";
const ENV_PULL_PULL_SHA: &str = "PULL_PULL_SHA";
const ENV_PULL_BASE_SHA: &str = "PULL_BASE_SHA";
const ENV_SOURCE_URL: &str = "SOURCE_URL";
const ENV_PULL_BASE_REF: &str = "PULL_BASE_REF";

// =============================================================================
// Workload Instance
// =============================================================================

/// A declared environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value. Absent values are treated as empty.
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    /// Creates a new environment variable.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An initialization container and its declared environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Container name.
    #[serde(default)]
    pub name: String,
    /// Declared environment, in declaration order.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// A running unit of execution whose environment declares build identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadInstance {
    /// Workload name.
    pub name: String,
    /// Workload labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Initialization containers.
    #[serde(default)]
    pub init_containers: Vec<Container>,
}

impl WorkloadInstance {
    /// Returns the build name label, preferring the current label over the
    /// legacy alias. Empty values count as absent.
    #[must_use]
    pub fn build_name(&self) -> Option<&str> {
        [LABEL_BUILD_NAME, LABEL_LEGACY_BUILD_NAME]
            .iter()
            .filter_map(|label| self.labels.get(*label))
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }

    /// Iterates over every environment variable declared by the init
    /// containers, in declaration order.
    pub fn declared_env(&self) -> impl Iterator<Item = &EnvVar> {
        self.init_containers.iter().flat_map(|c| c.env.iter())
    }
}

// =============================================================================
// Build Identity
// =============================================================================

/// Structured identity of a build, derived from a workload instance.
///
/// `commit_sha` is guaranteed non-empty for every value produced by
/// [`BuildIdentityExtractor::extract`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Branch label: the pull request identifier for PR builds, the declared
    /// base ref otherwise.
    pub branch: String,
    /// Pull request identifier (`PR-<n>`), if this is a pull request build.
    pub pull_request: Option<String>,
    /// Effective commit sha.
    pub commit_sha: String,
    /// Build number.
    pub build_number: String,
    /// Source repository URL.
    pub source_url: String,
}

impl BuildIdentity {
    /// Returns true when this build is for a pull request.
    #[must_use]
    pub const fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    /// Deterministic status record name for one required context.
    #[must_use]
    pub fn record_name(&self, context: &str) -> String {
        naming::record_name(&self.owner, &self.repo, &self.branch, context)
    }

    /// Deterministic name of the pipeline activity for this build.
    #[must_use]
    pub fn activity_name(&self) -> String {
        naming::activity_name(&self.owner, &self.repo, &self.branch, &self.build_number)
    }
}

/// Reasons a workload instance does not yield a usable build identity.
///
/// None of these are failures of the controller: each one means the event is
/// skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentityError {
    /// The workload carries no build name label.
    #[error("workload {workload} is not a build workload")]
    NotBuildWorkload {
        /// Workload name.
        workload: String,
    },

    /// Required identity fields are missing or empty.
    #[error("workload {workload} has an incomplete build identity (missing: {})", .missing.join(", "))]
    IncompleteIdentity {
        /// Workload name.
        workload: String,
        /// Names of the missing variables.
        missing: Vec<String>,
    },

    /// The effective commit sha resolved to an empty value.
    #[error("no commit sha on workload {workload}")]
    MissingCommitSha {
        /// Workload name.
        workload: String,
    },
}

/// Raw values collected from the declared environment.
#[derive(Debug, Default)]
struct DeclaredIdentity {
    owner: String,
    repo: String,
    pull_number: String,
    pull_sha: String,
    base_sha: String,
    build_number: String,
    source_url: String,
    branch: String,
}

/// Extracts [`BuildIdentity`] values from workload instances.
#[derive(Debug, Clone)]
pub struct BuildIdentityExtractor {
    build_number_var: String,
}

impl Default for BuildIdentityExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_BUILD_NUMBER_VAR)
    }
}

impl BuildIdentityExtractor {
    /// Creates an extractor reading the build number from `build_number_var`.
    #[must_use]
    pub fn new(build_number_var: impl Into<String>) -> Self {
        Self {
            build_number_var: build_number_var.into(),
        }
    }

    /// Returns the variable the build number is read from.
    #[must_use]
    pub fn build_number_var(&self) -> &str {
        &self.build_number_var
    }

    /// Extracts the build identity of a workload instance.
    ///
    /// When a variable is declared more than once the last declaration wins.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] when the workload is not a build workload,
    /// when required fields are missing, or when no commit sha resolves.
    pub fn extract(&self, workload: &WorkloadInstance) -> Result<BuildIdentity, IdentityError> {
        if workload.build_name().is_none() {
            return Err(IdentityError::NotBuildWorkload {
                workload: workload.name.clone(),
            });
        }

        let declared = self.collect(workload);

        let mut missing = Vec::new();
        if declared.owner.is_empty() {
            missing.push(ENV_REPO_OWNER.to_string());
        }
        if declared.repo.is_empty() {
            missing.push(ENV_REPO_NAME.to_string());
        }
        if declared.build_number.is_empty() {
            missing.push(self.build_number_var.clone());
        }
        if declared.base_sha.is_empty() && declared.pull_sha.is_empty() {
            missing.push(format!("{ENV_PULL_BASE_SHA}|{ENV_PULL_PULL_SHA}"));
        }
        if !missing.is_empty() {
            return Err(IdentityError::IncompleteIdentity {
                workload: workload.name.clone(),
                missing,
            });
        }

        let pull_request =
            (!declared.pull_number.is_empty()).then(|| format!("PR-{}", declared.pull_number));

        let (commit_sha, branch) = match &pull_request {
            Some(pr) => (declared.pull_sha, pr.clone()),
            None => (declared.base_sha, declared.branch),
        };

        if commit_sha.is_empty() {
            return Err(IdentityError::MissingCommitSha {
                workload: workload.name.clone(),
            });
        }

        Ok(BuildIdentity {
            owner: declared.owner,
            repo: declared.repo,
            branch,
            pull_request,
            commit_sha,
            build_number: declared.build_number,
            source_url: declared.source_url,
        })
    }

    fn collect(&self, workload: &WorkloadInstance) -> DeclaredIdentity {
        let mut declared = DeclaredIdentity::default();
        for var in workload.declared_env() {
            let slot = match var.name.as_str() {
                ENV_REPO_OWNER => &mut declared.owner,
                ENV_REPO_NAME => &mut declared.repo,
                ENV_PULL_NUMBER => &mut declared.pull_number,
                ENV_PULL_PULL_SHA => &mut declared.pull_sha,
                ENV_PULL_BASE_SHA => &mut declared.base_sha,
                ENV_SOURCE_URL => &mut declared.source_url,
                ENV_PULL_BASE_REF => &mut declared.branch,
                name if name == self.build_number_var => &mut declared.build_number,
                _ => continue,
            };
            if !slot.is_empty() && *slot != var.value {
                trace!(workload = %workload.name, var = %var.name, "later declaration overrides earlier value");
            }
            slot.clone_from(&var.value);
        }
        declared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_workload(env: &[(&str, &str)]) -> WorkloadInstance {
        WorkloadInstance {
            name: "acme-widgets-pr-7-1-abcde".to_string(),
            labels: BTreeMap::from([(LABEL_BUILD_NAME.to_string(), "acme-widgets-pr-7-1".to_string())]),
            init_containers: vec![Container {
                name: "build-step-git-source".to_string(),
                env: env.iter().map(|(k, v)| EnvVar::new(*k, *v)).collect(),
            }],
        }
    }

    fn pr_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("REPO_OWNER", "acme"),
            ("REPO_NAME", "widgets"),
            ("PULL_NUMBER", "7"),
            ("PULL_PULL_SHA", "headsha"),
            ("PULL_BASE_SHA", "basesha"),
            ("JX_BUILD_NUMBER", "3"),
            ("SOURCE_URL", "https://github.com/acme/widgets.git"),
            ("PULL_BASE_REF", "master"),
        ]
    }

    #[test]
    fn pull_request_build_uses_head_sha_and_pr_branch() {
        let identity = BuildIdentityExtractor::default()
            .extract(&build_workload(&pr_env()))
            .expect("identity should extract");

        assert_eq!(identity.owner, "acme");
        assert_eq!(identity.repo, "widgets");
        assert_eq!(identity.pull_request.as_deref(), Some("PR-7"));
        assert_eq!(identity.branch, "PR-7");
        assert_eq!(identity.commit_sha, "headsha");
        assert_eq!(identity.build_number, "3");
        assert_eq!(identity.source_url, "https://github.com/acme/widgets.git");
        assert!(identity.is_pull_request());
    }

    #[test]
    fn branch_build_uses_base_sha_and_declared_branch() {
        let env: Vec<_> = pr_env()
            .into_iter()
            .filter(|(k, _)| *k != "PULL_NUMBER" && *k != "PULL_PULL_SHA")
            .collect();
        let identity = BuildIdentityExtractor::default()
            .extract(&build_workload(&env))
            .expect("identity should extract");

        assert_eq!(identity.pull_request, None);
        assert_eq!(identity.branch, "master");
        assert_eq!(identity.commit_sha, "basesha");
    }

    #[test]
    fn empty_pull_number_is_not_a_pull_request() {
        let mut env = pr_env();
        env.retain(|(k, _)| *k != "PULL_NUMBER");
        env.push(("PULL_NUMBER", ""));
        let identity = BuildIdentityExtractor::default()
            .extract(&build_workload(&env))
            .unwrap();

        assert_eq!(identity.pull_request, None);
        assert_eq!(identity.commit_sha, "basesha");
    }

    #[test]
    fn missing_build_number_is_incomplete() {
        let env: Vec<_> = pr_env()
            .into_iter()
            .filter(|(k, _)| *k != "JX_BUILD_NUMBER")
            .collect();
        let err = BuildIdentityExtractor::default()
            .extract(&build_workload(&env))
            .unwrap_err();

        match err {
            IdentityError::IncompleteIdentity { missing, .. } => {
                assert_eq!(missing, vec!["JX_BUILD_NUMBER".to_string()]);
            },
            other => panic!("expected IncompleteIdentity, got {other:?}"),
        }
    }

    #[test]
    fn missing_both_shas_is_incomplete() {
        let env: Vec<_> = pr_env()
            .into_iter()
            .filter(|(k, _)| !k.ends_with("_SHA"))
            .collect();
        let err = BuildIdentityExtractor::default()
            .extract(&build_workload(&env))
            .unwrap_err();

        assert!(matches!(err, IdentityError::IncompleteIdentity { .. }));
    }

    #[test]
    fn pull_request_without_head_sha_is_missing_commit_sha() {
        let env: Vec<_> = pr_env()
            .into_iter()
            .filter(|(k, _)| *k != "PULL_PULL_SHA")
            .collect();
        let err = BuildIdentityExtractor::default()
            .extract(&build_workload(&env))
            .unwrap_err();

        assert!(matches!(err, IdentityError::MissingCommitSha { .. }));
    }

    #[test]
    fn unlabelled_workload_is_not_a_build() {
        let mut workload = build_workload(&pr_env());
        workload.labels.clear();

        let err = BuildIdentityExtractor::default()
            .extract(&workload)
            .unwrap_err();
        assert!(matches!(err, IdentityError::NotBuildWorkload { .. }));
    }

    #[test]
    fn legacy_build_label_is_accepted() {
        let mut workload = build_workload(&pr_env());
        workload.labels = BTreeMap::from([(
            LABEL_LEGACY_BUILD_NAME.to_string(),
            "legacy-build".to_string(),
        )]);

        assert_eq!(workload.build_name(), Some("legacy-build"));
        assert!(BuildIdentityExtractor::default().extract(&workload).is_ok());
    }

    #[test]
    fn custom_build_number_variable() {
        let mut env: Vec<_> = pr_env()
            .into_iter()
            .filter(|(k, _)| *k != "JX_BUILD_NUMBER")
            .collect();
        env.push(("BUILD_ID", "42"));

        let identity = BuildIdentityExtractor::new("BUILD_ID")
            .extract(&build_workload(&env))
            .unwrap();
        assert_eq!(identity.build_number, "42");
    }

    #[test]
    fn later_declarations_win_across_containers() {
        let mut workload = build_workload(&pr_env());
        workload.init_containers.push(Container {
            name: "second".to_string(),
            env: vec![EnvVar::new("JX_BUILD_NUMBER", "4")],
        });

        let identity = BuildIdentityExtractor::default().extract(&workload).unwrap();
        assert_eq!(identity.build_number, "4");
    }

    #[test]
    fn identity_names_are_deterministic() {
        let identity = BuildIdentityExtractor::default()
            .extract(&build_workload(&pr_env()))
            .unwrap();

        assert_eq!(identity.record_name("lint"), "acme-widgets-pr-7-lint");
        assert_eq!(identity.activity_name(), "acme-widgets-pr-7-3");
    }

    #[test]
    fn workload_deserializes_from_camel_case_json() {
        let json = r#"{
            "name": "pod-1",
            "labels": {"build-name": "b1"},
            "initContainers": [{"name": "c", "env": [{"name": "REPO_OWNER", "value": "acme"}, {"name": "EMPTY"}]}]
        }"#;
        let workload: WorkloadInstance = serde_json::from_str(json).unwrap();

        assert_eq!(workload.build_name(), Some("b1"));
        assert_eq!(workload.declared_env().count(), 2);
        assert_eq!(workload.init_containers[0].env[1].value, "");
    }
}
