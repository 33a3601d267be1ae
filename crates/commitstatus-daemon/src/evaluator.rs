//! Status evaluator.
//!
//! Reacts to status record changes by deciding, for every detail, which
//! commit status must be published and handing it to the notifier.
//!
//! When a notification fails, the evaluator makes one best-effort attempt to
//! publish an `error` status for the same commit and context, then returns
//! the original failure. The remaining details of the record are not
//! processed; the record change will be redelivered.

use std::sync::Arc;

use commitstatus_core::decision::{StatusDecision, decide};
use commitstatus_core::status::StatusDetail;
use commitstatus_core::StatusRecord;
use thiserror::Error;
use tracing::{debug, warn};

use crate::notifier::{CommitStatusNotifier, NotifyError, NotifyRequest};

/// Errors returned by the evaluator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvaluatorError {
    /// Publishing a status failed.
    #[error("failed to publish {context} status for record {record}: {source}")]
    Notify {
        /// Record name.
        record: String,
        /// Status context.
        context: String,
        /// The failure of the primary notification.
        #[source]
        source: NotifyError,
    },
}

/// Publishes the decided status of every detail of a record.
pub struct StatusEvaluator {
    notifier: Arc<dyn CommitStatusNotifier>,
}

impl StatusEvaluator {
    /// Creates an evaluator publishing through `notifier`.
    #[must_use]
    pub fn new(notifier: Arc<dyn CommitStatusNotifier>) -> Self {
        Self { notifier }
    }

    /// Handles one status record change, returning the number of statuses
    /// published.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError::Notify`] carrying the first failed
    /// notification, even if the follow-up error status was published.
    pub async fn on_status_record(&self, record: &StatusRecord) -> Result<usize, EvaluatorError> {
        let mut published = 0;
        for detail in &record.details {
            let decision = decide(detail);
            debug!(
                record = %record.name,
                sha = %detail.commit.sha,
                context = %detail.context,
                state = %decision.state,
                "status decided"
            );

            if let Err(source) = self.notifier.notify(&request(detail, decision)).await {
                self.report_internal_error(record, detail, &source).await;
                return Err(EvaluatorError::Notify {
                    record: record.name.clone(),
                    context: detail.context.clone(),
                    source,
                });
            }
            published += 1;
        }
        Ok(published)
    }

    /// Prunes the notifier's delivery bookkeeping older than `ttl_secs`.
    ///
    /// # Errors
    ///
    /// Returns the notifier's [`NotifyError`].
    pub async fn evict_expired(&self, ttl_secs: u64) -> Result<usize, NotifyError> {
        self.notifier.evict_expired(ttl_secs).await
    }

    async fn report_internal_error(
        &self,
        record: &StatusRecord,
        detail: &StatusDetail,
        cause: &NotifyError,
    ) {
        let fallback = request(detail, StatusDecision::internal_error());
        if let Err(err) = self.notifier.notify(&fallback).await {
            warn!(
                record = %record.name,
                context = %detail.context,
                cause = %cause,
                error = %err,
                "failed to publish error status"
            );
        }
    }
}

impl std::fmt::Debug for StatusEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusEvaluator").finish_non_exhaustive()
    }
}

fn request(detail: &StatusDetail, decision: StatusDecision) -> NotifyRequest {
    NotifyRequest {
        commit: detail.commit.clone(),
        state: decision.state,
        description: decision.description,
        comment: decision.comment,
        context: detail.context.clone(),
        generation: detail.pipeline_activity.uid.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use commitstatus_core::status::{CommitRef, PipelineActivityRef, SubCheck};
    use commitstatus_core::CommitState;

    use super::*;

    /// Records every request and fails the states listed in `failing`.
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<NotifyRequest>>,
        failing: Vec<CommitState>,
    }

    impl RecordingNotifier {
        fn failing(states: &[CommitState]) -> Self {
            Self {
                sent: Mutex::default(),
                failing: states.to_vec(),
            }
        }

        fn states(&self) -> Vec<CommitState> {
            self.sent.lock().unwrap().iter().map(|r| r.state).collect()
        }
    }

    #[async_trait]
    impl CommitStatusNotifier for RecordingNotifier {
        async fn notify(&self, request: &NotifyRequest) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(request.clone());
            if self.failing.contains(&request.state) {
                return Err(NotifyError::Network(format!("{} rejected", request.state)));
            }
            Ok(())
        }
    }

    fn detail(sha: &str, checked: bool, checks: Vec<SubCheck>) -> StatusDetail {
        StatusDetail {
            commit: CommitRef {
                url: "https://github.com/acme/widgets".to_string(),
                sha: sha.to_string(),
                pull_request: Some("PR-7".to_string()),
            },
            pipeline_activity: PipelineActivityRef::default(),
            context: "build".to_string(),
            checked,
            sub_checks: checks,
        }
    }

    fn record(details: Vec<StatusDetail>) -> StatusRecord {
        StatusRecord {
            name: "acme-widgets-pr-7-build".to_string(),
            labels: std::collections::BTreeMap::new(),
            details,
        }
    }

    #[tokio::test]
    async fn publishes_one_status_per_detail() {
        let notifier = Arc::new(RecordingNotifier::default());
        let evaluator = StatusEvaluator::new(notifier.clone());

        let published = evaluator
            .on_status_record(&record(vec![
                detail("aaa", false, Vec::new()),
                detail("bbb", true, vec![SubCheck::new("unit", "", true)]),
                detail("ccc", true, vec![SubCheck::new("lint", "style", false)]),
            ]))
            .await
            .unwrap();

        assert_eq!(published, 3);
        assert_eq!(
            notifier.states(),
            vec![CommitState::Pending, CommitState::Success, CommitState::Failure]
        );
        let sent = notifier.sent.lock().unwrap();
        assert!(sent[2].comment.as_deref().unwrap().contains("lint | style | ccc"));
    }

    #[tokio::test]
    async fn failed_notification_reports_error_and_stops() {
        let notifier = Arc::new(RecordingNotifier::failing(&[CommitState::Pending]));
        let evaluator = StatusEvaluator::new(notifier.clone());

        let err = evaluator
            .on_status_record(&record(vec![
                detail("aaa", false, Vec::new()),
                detail("bbb", true, Vec::new()),
            ]))
            .await
            .unwrap_err();

        let EvaluatorError::Notify { context, source, .. } = err;
        assert_eq!(context, "build");
        assert_eq!(source, NotifyError::Network("pending rejected".to_string()));
        assert_eq!(notifier.states(), vec![CommitState::Pending, CommitState::Error]);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent[1].commit.sha, "aaa");
        assert_eq!(
            sent[1].description,
            commitstatus_core::decision::INTERNAL_ERROR_DESCRIPTION
        );
    }

    #[tokio::test]
    async fn original_error_wins_when_error_status_also_fails() {
        let notifier = Arc::new(RecordingNotifier::failing(&[
            CommitState::Success,
            CommitState::Error,
        ]));
        let evaluator = StatusEvaluator::new(notifier.clone());

        let err = evaluator
            .on_status_record(&record(vec![detail("aaa", true, Vec::new())]))
            .await
            .unwrap_err();

        let EvaluatorError::Notify { source, .. } = err;
        assert_eq!(source, NotifyError::Network("success rejected".to_string()));
    }

    #[tokio::test]
    async fn empty_record_publishes_nothing() {
        let notifier = Arc::new(RecordingNotifier::default());
        let evaluator = StatusEvaluator::new(notifier.clone());

        assert_eq!(evaluator.on_status_record(&record(Vec::new())).await.unwrap(), 0);
        assert!(notifier.states().is_empty());
    }

    #[tokio::test]
    async fn requests_carry_the_activity_generation() {
        let notifier = Arc::new(RecordingNotifier::default());
        let evaluator = StatusEvaluator::new(notifier.clone());

        let mut superseding = detail("aaa", false, Vec::new());
        superseding.pipeline_activity.uid = "uid-2".to_string();
        evaluator.on_status_record(&record(vec![superseding])).await.unwrap();

        assert_eq!(notifier.sent.lock().unwrap()[0].generation, "uid-2");
    }
}
