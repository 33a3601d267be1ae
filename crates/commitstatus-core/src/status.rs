//! Status record data model.
//!
//! A [`StatusRecord`] is the durable aggregate for one
//! `(owner, repo, branch, context)` key. It holds one [`StatusDetail`] per
//! commit sha, each tracking whether the context's check has reported for
//! that commit and with what sub-check outcomes.
//!
//! # Invariants
//!
//! - At most one detail per `commit.sha` within a record.
//! - Every detail references a non-empty sha.
//!
//! Both are checked by [`StatusRecord::validate`], which every store write
//! calls before persisting. A violation is a data-integrity error.
//!
//! The JSON form uses the camelCase field names of the commit status
//! resource schema (`commit.gitUrl`, `pipelineActivity.uid`, `items`, ...).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label recording the sha of the most recently written detail.
pub const LABEL_LAST_COMMIT_SHA: &str = "lastCommitSha";

/// Data-integrity violations of a [`StatusRecord`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecordError {
    /// The record has no name.
    #[error("status record name cannot be empty")]
    EmptyName,

    /// More than one detail references the same commit sha.
    #[error("status record {record} has {} details for sha {sha} (indices {indices:?}), expected at most 1", .indices.len())]
    DuplicateSha {
        /// Record name.
        record: String,
        /// The duplicated sha.
        sha: String,
        /// Indices of the offending details.
        indices: Vec<usize>,
    },

    /// A detail references an empty commit sha.
    #[error("status record {record} has a detail with an empty sha at index {index}")]
    EmptySha {
        /// Record name.
        record: String,
        /// Index of the offending detail.
        index: usize,
    },
}

/// Reference to the commit a status is reported against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    /// Source repository URL.
    #[serde(rename = "gitUrl", default)]
    pub url: String,
    /// Commit sha.
    #[serde(default)]
    pub sha: String,
    /// Pull request identifier (`PR-<n>`), if any.
    #[serde(rename = "pullRequest", default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<String>,
}

impl CommitRef {
    /// Returns the numeric pull request id, if the reference names one.
    #[must_use]
    pub fn pull_request_number(&self) -> Option<u64> {
        self.pull_request
            .as_deref()
            .and_then(|pr| pr.strip_prefix("PR-"))
            .and_then(|n| n.parse().ok())
    }
}

/// Weak reference to the pipeline activity (build run) owning a detail.
///
/// The default (all-empty) value means "no activity found".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineActivityRef {
    /// Activity name.
    #[serde(default)]
    pub name: String,
    /// Resource kind.
    #[serde(default)]
    pub kind: String,
    /// Unique id of this activity instance. Supersession is detected on this
    /// field alone.
    #[serde(default)]
    pub uid: String,
    /// Resource API version.
    #[serde(default)]
    pub api_version: String,
}

impl PipelineActivityRef {
    /// Returns true for the empty reference.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uid.is_empty() && self.name.is_empty()
    }
}

/// Outcome of one sub-check of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCheck {
    /// Sub-check name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Whether the sub-check passed.
    pub pass: bool,
}

impl SubCheck {
    /// Creates a sub-check outcome.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, pass: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            pass,
        }
    }
}

/// Status of one context for one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetail {
    /// Commit the status is reported against.
    pub commit: CommitRef,
    /// Build run that owns this detail.
    #[serde(default)]
    pub pipeline_activity: PipelineActivityRef,
    /// Status context name.
    pub context: String,
    /// Whether the check has reported.
    #[serde(default)]
    pub checked: bool,
    /// Sub-check outcomes, meaningful once `checked` is true.
    #[serde(rename = "items", default)]
    pub sub_checks: Vec<SubCheck>,
}

impl StatusDetail {
    /// Creates an unchecked detail.
    #[must_use]
    pub fn pending(
        commit: CommitRef,
        pipeline_activity: PipelineActivityRef,
        context: impl Into<String>,
    ) -> Self {
        Self {
            commit,
            pipeline_activity,
            context: context.into(),
            checked: false,
            sub_checks: Vec::new(),
        }
    }

    /// Returns true when every sub-check passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.sub_checks.iter().all(|c| c.pass)
    }

    /// Iterates over the failing sub-checks.
    pub fn failing_checks(&self) -> impl Iterator<Item = &SubCheck> {
        self.sub_checks.iter().filter(|c| !c.pass)
    }
}

/// Durable aggregate of status details for one
/// `(owner, repo, branch, context)` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    /// Deterministic record name.
    pub name: String,
    /// Record labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Status details, in insertion order.
    #[serde(rename = "items", default)]
    pub details: Vec<StatusDetail>,
}

impl StatusRecord {
    /// Creates a record holding exactly one detail.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the result violates a record invariant.
    pub fn new(name: impl Into<String>, detail: StatusDetail) -> Result<Self, RecordError> {
        let mut record = Self {
            name: name.into(),
            labels: BTreeMap::new(),
            details: vec![detail],
        };
        record.touch_last_commit_sha(0);
        record.validate()?;
        Ok(record)
    }

    /// Checks the record invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.name.is_empty() {
            return Err(RecordError::EmptyName);
        }

        let mut by_sha: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, detail) in self.details.iter().enumerate() {
            if detail.commit.sha.is_empty() {
                return Err(RecordError::EmptySha {
                    record: self.name.clone(),
                    index,
                });
            }
            by_sha.entry(detail.commit.sha.as_str()).or_default().push(index);
        }

        if let Some((sha, indices)) = by_sha.into_iter().find(|(_, idx)| idx.len() > 1) {
            return Err(RecordError::DuplicateSha {
                record: self.name.clone(),
                sha: sha.to_string(),
                indices,
            });
        }

        Ok(())
    }

    /// Returns the indices of the details referencing `sha`.
    #[must_use]
    pub fn detail_indices_for_sha(&self, sha: &str) -> Vec<usize> {
        self.details
            .iter()
            .enumerate()
            .filter(|(_, d)| d.commit.sha == sha)
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the `lastCommitSha` label, if set.
    #[must_use]
    pub fn last_commit_sha(&self) -> Option<&str> {
        self.labels.get(LABEL_LAST_COMMIT_SHA).map(String::as_str)
    }

    /// Points the `lastCommitSha` label at the detail at `index`.
    pub fn touch_last_commit_sha(&mut self, index: usize) {
        if let Some(detail) = self.details.get(index) {
            self.labels
                .insert(LABEL_LAST_COMMIT_SHA.to_string(), detail.commit.sha.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(sha: &str, uid: &str) -> StatusDetail {
        StatusDetail::pending(
            CommitRef {
                url: "https://github.com/acme/widgets".to_string(),
                sha: sha.to_string(),
                pull_request: Some("PR-7".to_string()),
            },
            PipelineActivityRef {
                name: "acme-widgets-pr-7-1".to_string(),
                kind: "PipelineActivity".to_string(),
                uid: uid.to_string(),
                api_version: "jenkins.io/v1".to_string(),
            },
            "build",
        )
    }

    #[test]
    fn new_record_sets_last_commit_label() {
        let record = StatusRecord::new("acme-widgets-pr-7-build", detail("abc", "u1")).unwrap();

        assert_eq!(record.details.len(), 1);
        assert_eq!(record.last_commit_sha(), Some("abc"));
    }

    #[test]
    fn duplicate_sha_is_rejected() {
        let mut record = StatusRecord::new("r", detail("abc", "u1")).unwrap();
        record.details.push(detail("def", "u2"));
        record.details.push(detail("abc", "u3"));

        let err = record.validate().unwrap_err();
        assert_eq!(
            err,
            RecordError::DuplicateSha {
                record: "r".to_string(),
                sha: "abc".to_string(),
                indices: vec![0, 2],
            }
        );
    }

    #[test]
    fn empty_sha_and_name_are_rejected() {
        assert_eq!(
            StatusRecord::new("", detail("abc", "u1")).unwrap_err(),
            RecordError::EmptyName
        );
        assert!(matches!(
            StatusRecord::new("r", detail("", "u1")).unwrap_err(),
            RecordError::EmptySha { index: 0, .. }
        ));
    }

    #[test]
    fn detail_indices_for_sha() {
        let mut record = StatusRecord::new("r", detail("abc", "u1")).unwrap();
        record.details.push(detail("def", "u2"));

        assert_eq!(record.detail_indices_for_sha("def"), vec![1]);
        assert!(record.detail_indices_for_sha("zzz").is_empty());
    }

    #[test]
    fn pull_request_number_parses_pr_prefix() {
        let mut commit = detail("abc", "u1").commit;
        assert_eq!(commit.pull_request_number(), Some(7));

        commit.pull_request = Some("master".to_string());
        assert_eq!(commit.pull_request_number(), None);

        commit.pull_request = None;
        assert_eq!(commit.pull_request_number(), None);
    }

    #[test]
    fn pass_and_failure_helpers() {
        let mut d = detail("abc", "u1");
        assert!(d.all_passed(), "no sub-checks means nothing failed");

        d.sub_checks = vec![SubCheck::new("unit", "", true), SubCheck::new("lint", "", false)];
        assert!(!d.all_passed());
        assert_eq!(
            d.failing_checks().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["lint"]
        );
    }

    #[test]
    fn json_uses_resource_field_names() {
        let record = StatusRecord::new("r", detail("abc", "u1")).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["items"][0]["commit"]["gitUrl"], "https://github.com/acme/widgets");
        assert_eq!(json["items"][0]["commit"]["pullRequest"], "PR-7");
        assert_eq!(json["items"][0]["pipelineActivity"]["apiVersion"], "jenkins.io/v1");
        assert_eq!(json["items"][0]["checked"], false);
        assert_eq!(json["labels"]["lastCommitSha"], "abc");

        let back: StatusRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
