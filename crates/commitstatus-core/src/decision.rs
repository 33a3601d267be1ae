//! Status decisions.
//!
//! Maps a [`StatusDetail`] to the commit state, description, and optional
//! PR comment that must be published for it. This is the pure half of the
//! status evaluator; delivery lives in the daemon crate.
//!
//! | `checked` | sub-checks | state |
//! |-----------|------------|-------|
//! | false | - | `pending` |
//! | true | all pass | `success` |
//! | true | any fails | `failure` (with a comment table) |

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use crate::status::StatusDetail;

/// Description used when a status update itself failed.
pub const INTERNAL_ERROR_DESCRIPTION: &str = "Internal Error performing commit status updates";

/// Description used for failed contexts.
pub const FAILURE_DESCRIPTION: &str = "Some commit status checks failed";

/// Rerun hint shown next to each failing sub-check.
pub const RERUN_HINT: &str = "`/test this`";

const FAILURE_COMMENT_HEADER: &str = "The following commit status checks **failed**, say `/retest` to rerun them all:\n\
\n\
Name | Description | Commit | Rerun command\n\
--- | --- | --- | ---\n";

const FAILURE_COMMENT_FOOTER: &str = "\n<details>\n\
\n\
Instructions for interacting with me using PR comments are available [here](https://git.k8s.io/community/contributors/guide/pull-requests.md). \
If you have questions or suggestions related to my behavior, please file an issue against the \
[kubernetes/test-infra](https://github.com/kubernetes/test-infra/issues/new?title=Prow%20issue:) repository. \
I understand the commands that are listed [here](https://go.k8s.io/bot-commands).\n\
</details>";

/// Commit status states understood by the source-control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    /// The check has not reported yet.
    Pending,
    /// The check reported and every sub-check passed.
    Success,
    /// The check reported and at least one sub-check failed.
    Failure,
    /// The controller failed to publish the status.
    Error,
}

impl CommitState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What must be published for one status detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDecision {
    /// Commit state.
    pub state: CommitState,
    /// Short description shown next to the status.
    pub description: String,
    /// Markdown comment to attach to the pull request, if any.
    pub comment: Option<String>,
}

impl StatusDecision {
    /// Decision published when a status update failed.
    #[must_use]
    pub fn internal_error() -> Self {
        Self {
            state: CommitState::Error,
            description: INTERNAL_ERROR_DESCRIPTION.to_string(),
            comment: None,
        }
    }
}

/// Decides what must be published for `detail`.
#[must_use]
pub fn decide(detail: &StatusDetail) -> StatusDecision {
    if !detail.checked {
        return StatusDecision {
            state: CommitState::Pending,
            description: format!("Waiting for {} to complete", detail.context),
            comment: None,
        };
    }

    if detail.all_passed() {
        return StatusDecision {
            state: CommitState::Success,
            description: format!("{} completed successfully", detail.context),
            comment: None,
        };
    }

    StatusDecision {
        state: CommitState::Failure,
        description: FAILURE_DESCRIPTION.to_string(),
        comment: Some(failure_comment(detail)),
    }
}

/// Renders the failure table for the failing sub-checks of `detail`.
#[must_use]
pub fn failure_comment(detail: &StatusDetail) -> String {
    let mut comment = String::from(FAILURE_COMMENT_HEADER);
    for check in detail.failing_checks() {
        // Writing to a String cannot fail.
        let _ = writeln!(
            comment,
            "{} | {} | {} | {RERUN_HINT}",
            escape_cell(&check.name),
            escape_cell(&check.description),
            detail.commit.sha,
        );
    }
    comment.push_str(FAILURE_COMMENT_FOOTER);
    comment
}

/// Keeps a value inside its markdown table cell.
fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}
