//! Status reconciler.
//!
//! Turns workload instance events into status records. For every context
//! branch protection requires, the reconciler ensures the record for
//! `(owner, repo, branch, context)` holds exactly one detail for the build's
//! commit, owned by the build's current pipeline activity.
//!
//! # Upsert Algorithm
//!
//! 1. Read the record (absent means create).
//! 2. Look up the pipeline activity by its deterministic name. A missing
//!    activity leaves the reference empty.
//! 3. Find the detail for the sha:
//!    - one match with the same activity uid: nothing to do
//!    - one match with a different uid: the build was superseded, replace
//!      the detail in place with a fresh pending one
//!    - no match: leave the record alone, or append a pending detail when
//!      `append_new_commits` is set
//!    - several matches: data-integrity error
//! 4. Write with the revision read in step 1. A lost race re-runs the whole
//!    algorithm, up to `max_conflict_retries` times.
//!
//! A context whose record name normalizes to an empty string is skipped
//! without touching the store.

use std::sync::Arc;

use commitstatus_core::config::ControllerConfig;
use commitstatus_core::status::{CommitRef, PipelineActivityRef, RecordError, StatusDetail};
use commitstatus_core::{BuildIdentity, BuildIdentityExtractor, IdentityError, StatusRecord, WorkloadInstance};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resolver::{ContextResolver, ResolverError};
use crate::store::{ActivityLookup, RecordStore, StoreError, Versioned};

// =============================================================================
// Error Types
// =============================================================================

/// Errors returned by the reconciler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// Required contexts could not be resolved.
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    /// The store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A new record would violate a record invariant.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The stored record already holds several details for one sha.
    #[error("status record {record} has {} details for sha {sha}, expected at most 1", .indices.len())]
    MultipleDetailsForSha {
        /// Record name.
        record: String,
        /// Commit sha.
        sha: String,
        /// Indices of the matching details.
        indices: Vec<usize>,
    },

    /// Every attempt lost a write race.
    #[error("gave up on status record {record} after {attempts} conflicting writes")]
    ConflictRetriesExhausted {
        /// Record name.
        record: String,
        /// Attempts made.
        attempts: u32,
    },
}

// =============================================================================
// Types
// =============================================================================

/// Reconciler policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Also reconcile builds that are not pull requests.
    pub reconcile_branch_builds: bool,
    /// Append a pending detail for a commit the record has not seen.
    pub append_new_commits: bool,
    /// Re-reads allowed after a conflicting write.
    pub max_conflict_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ReconcilerConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            reconcile_branch_builds: config.reconcile_branch_builds,
            append_new_commits: config.append_new_commits,
            max_conflict_retries: config.max_conflict_retries,
        }
    }
}

/// Input of a single upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertRequest {
    /// Status record name.
    pub record_name: String,
    /// Pipeline activity name.
    pub activity_name: String,
    /// Source repository URL.
    pub url: String,
    /// Commit sha.
    pub sha: String,
    /// Pull request identifier, if any.
    pub pull_request: Option<String>,
    /// Status context.
    pub context: String,
}

impl UpsertRequest {
    /// Builds the request for one context of a build.
    #[must_use]
    pub fn for_context(identity: &BuildIdentity, context: &str) -> Self {
        Self {
            record_name: identity.record_name(context),
            activity_name: identity.activity_name(),
            url: identity.source_url.clone(),
            sha: identity.commit_sha.clone(),
            pull_request: identity.pull_request.clone(),
            context: context.to_string(),
        }
    }

    fn pending_detail(&self, activity: PipelineActivityRef) -> StatusDetail {
        StatusDetail::pending(
            CommitRef {
                url: self.url.clone(),
                sha: self.sha.clone(),
                pull_request: self.pull_request.clone(),
            },
            activity,
            self.context.clone(),
        )
    }
}

/// Result of a single upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was created.
    Created {
        /// Revision written.
        revision: u64,
    },
    /// The detail for the sha belonged to another build and was replaced.
    Superseded {
        /// Revision written.
        revision: u64,
        /// Activity uid of the replaced detail.
        previous_uid: String,
    },
    /// A pending detail was appended for a new commit.
    Appended {
        /// Revision written.
        revision: u64,
    },
    /// Nothing was written.
    Unchanged,
    /// The context was not reconciled.
    Skipped(SkipReason),
}

/// Why a workload event was not reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The workload yields no usable build identity.
    NotApplicable(IdentityError),
    /// The build is not a pull request and branch builds are disabled.
    BranchBuildsDisabled,
    /// The repository requires no contexts.
    NoRequiredContexts,
    /// The record name normalizes to an empty string.
    EmptyRecordName,
}

/// Result of handling one workload event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing was done.
    Skipped(SkipReason),
    /// Every required context was upserted.
    Reconciled {
        /// Identity of the build.
        identity: BuildIdentity,
        /// Outcome per context, in resolution order.
        results: Vec<(String, UpsertOutcome)>,
    },
}

// =============================================================================
// StatusReconciler
// =============================================================================

/// Reconciles workload instances into status records.
pub struct StatusReconciler {
    extractor: BuildIdentityExtractor,
    resolver: Arc<dyn ContextResolver>,
    store: Arc<dyn RecordStore>,
    activities: Arc<dyn ActivityLookup>,
    config: ReconcilerConfig,
}

impl StatusReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        extractor: BuildIdentityExtractor,
        resolver: Arc<dyn ContextResolver>,
        store: Arc<dyn RecordStore>,
        activities: Arc<dyn ActivityLookup>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            extractor,
            resolver,
            store,
            activities,
            config,
        }
    }

    /// Returns the reconciler policy.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Handles one workload instance event.
    ///
    /// # Errors
    ///
    /// Returns the first failing context's error; later contexts are not
    /// attempted. Skip conditions are not errors.
    pub async fn on_workload(
        &self,
        workload: &WorkloadInstance,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let identity = match self.extractor.extract(workload) {
            Ok(identity) => identity,
            Err(err) => {
                if matches!(err, IdentityError::MissingCommitSha { .. }) {
                    warn!(workload = %workload.name, error = %err, "skipping build workload");
                } else {
                    debug!(workload = %workload.name, error = %err, "skipping workload");
                }
                return Ok(ReconcileOutcome::Skipped(SkipReason::NotApplicable(err)));
            },
        };

        if !identity.is_pull_request() && !self.config.reconcile_branch_builds {
            debug!(
                workload = %workload.name,
                branch = %identity.branch,
                "skipping branch build"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::BranchBuildsDisabled));
        }

        let contexts = self
            .resolver
            .required_contexts(&identity.owner, &identity.repo)
            .await?;
        if contexts.is_empty() {
            debug!(
                owner = %identity.owner,
                repo = %identity.repo,
                "no required contexts"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::NoRequiredContexts));
        }

        let mut results = Vec::with_capacity(contexts.len());
        for context in contexts {
            let request = UpsertRequest::for_context(&identity, &context);
            let outcome = self.upsert_status_check(&request).await?;
            results.push((context, outcome));
        }

        Ok(ReconcileOutcome::Reconciled { identity, results })
    }

    /// Ensures the record named by `request` holds the right detail for its
    /// sha, retrying on write conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConflictRetriesExhausted`] once every
    /// attempt lost a race, or the first non-conflict error.
    pub async fn upsert_status_check(
        &self,
        request: &UpsertRequest,
    ) -> Result<UpsertOutcome, ReconcileError> {
        if request.record_name.is_empty() {
            warn!(
                sha = %request.sha,
                context = %request.context,
                "record name normalizes to an empty string, skipping context"
            );
            return Ok(UpsertOutcome::Skipped(SkipReason::EmptyRecordName));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_upsert(request).await {
                Err(ReconcileError::Store(err)) if err.is_conflict() => {
                    if attempts > self.config.max_conflict_retries {
                        return Err(ReconcileError::ConflictRetriesExhausted {
                            record: request.record_name.clone(),
                            attempts,
                        });
                    }
                    debug!(
                        record = %request.record_name,
                        attempt = attempts,
                        error = %err,
                        "write conflict, re-reading record"
                    );
                },
                result => return result,
            }
        }
    }

    async fn try_upsert(&self, request: &UpsertRequest) -> Result<UpsertOutcome, ReconcileError> {
        let existing = self.store.get(&request.record_name).await?;
        let activity = self
            .activities
            .get_activity(&request.activity_name)
            .await?
            .unwrap_or_default();

        let Some(Versioned {
            value: mut record,
            revision,
        }) = existing
        else {
            let record = StatusRecord::new(&request.record_name, request.pending_detail(activity))?;
            let revision = self.store.create(&record).await?;
            info!(
                record = %request.record_name,
                sha = %request.sha,
                context = %request.context,
                "status record created"
            );
            return Ok(UpsertOutcome::Created { revision });
        };

        let indices = record.detail_indices_for_sha(&request.sha);
        match indices.as_slice() {
            [] if self.config.append_new_commits => {
                record.details.push(request.pending_detail(activity));
                record.touch_last_commit_sha(record.details.len() - 1);
                let revision = self.store.update(&record, revision).await?;
                info!(
                    record = %request.record_name,
                    sha = %request.sha,
                    "pending detail appended for new commit"
                );
                Ok(UpsertOutcome::Appended { revision })
            },
            [] => {
                debug!(
                    record = %request.record_name,
                    sha = %request.sha,
                    "record has no detail for this commit"
                );
                Ok(UpsertOutcome::Unchanged)
            },
            [index] => {
                let index = *index;
                let current = &record.details[index].pipeline_activity.uid;
                if *current == activity.uid {
                    return Ok(UpsertOutcome::Unchanged);
                }

                let previous_uid = current.clone();
                record.details[index] = request.pending_detail(activity);
                record.touch_last_commit_sha(index);
                let revision = self.store.update(&record, revision).await?;
                info!(
                    record = %request.record_name,
                    sha = %request.sha,
                    previous_uid = %previous_uid,
                    "superseded build detail replaced"
                );
                Ok(UpsertOutcome::Superseded {
                    revision,
                    previous_uid,
                })
            },
            _ => Err(ReconcileError::MultipleDetailsForSha {
                record: request.record_name.clone(),
                sha: request.sha.clone(),
                indices,
            }),
        }
    }
}

impl std::fmt::Debug for StatusReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReconciler")
            .field("extractor", &self.extractor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
