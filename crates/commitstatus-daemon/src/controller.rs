//! Controller loop.
//!
//! The controller tails the workload feed into the [`StatusReconciler`] and
//! the status record feed into the [`StatusEvaluator`], each on its own
//! task. Entries of one feed are handled strictly in order; the two feeds
//! are not ordered relative to each other.
//!
//! # Failure Handling
//!
//! Every entry is handled under a deadline. A failed or timed-out attempt is
//! logged and retried up to `max_event_attempts`; after that the entry is
//! logged as an error and acknowledged so one poison event cannot stall the
//! feed. No handler failure stops the controller.
//!
//! # Retention
//!
//! Every [`EVICTION_INTERVAL_POLLS`] idle polls a feed consumer deletes its
//! acknowledged entries older than the retention window. The status record
//! consumer also prunes the notifier's delivery bookkeeping.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use commitstatus_core::config::ControllerConfig;
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::evaluator::{EvaluatorError, StatusEvaluator};
use crate::feed::{ControllerEvent, FeedEntry, FeedError, FeedKind, FeedTailer};
use crate::notifier::NotifyError;
use crate::reconciler::{ReconcileError, ReconcileOutcome, StatusReconciler};

/// Idle polls between two retention passes over a feed.
pub const EVICTION_INTERVAL_POLLS: u32 = 60;

/// Errors produced while handling an event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// The reconciler failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The evaluator failed.
    #[error(transparent)]
    Evaluate(#[from] EvaluatorError),

    /// A feed could not be read or acknowledged.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Delivery bookkeeping could not be pruned.
    #[error("failed to evict delivery records: {0}")]
    Eviction(#[source] NotifyError),

    /// Handling took longer than the per-event deadline.
    #[error("event handling exceeded the {deadline_secs}s deadline")]
    DeadlineExceeded {
        /// The deadline in seconds.
        deadline_secs: u64,
    },
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A workload event was reconciled (or skipped).
    Reconciled(ReconcileOutcome),
    /// A status record change was evaluated.
    Evaluated {
        /// Number of statuses published.
        published: usize,
    },
}

/// Loop timing and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Sleep between polls of an idle feed.
    pub poll_interval: Duration,
    /// Maximum entries fetched per poll.
    pub batch_size: usize,
    /// Deadline for handling one entry.
    pub event_deadline: Duration,
    /// Attempts per entry before it is skipped.
    pub max_event_attempts: u32,
    /// How long acknowledged entries and delivery records are kept.
    pub retention: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size,
            event_deadline: Duration::from_secs(config.event_deadline_secs),
            max_event_attempts: config.max_event_attempts.max(1),
            retention: Duration::from_secs(config.retention_secs),
        }
    }
}

/// Drives the reconciler and the evaluator from their feeds.
pub struct Controller {
    reconciler: StatusReconciler,
    evaluator: StatusEvaluator,
    settings: ControllerSettings,
}

impl Controller {
    /// Creates a controller.
    #[must_use]
    pub const fn new(
        reconciler: StatusReconciler,
        evaluator: StatusEvaluator,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            reconciler,
            evaluator,
            settings,
        }
    }

    /// Returns the loop settings.
    #[must_use]
    pub const fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Dispatches one event to its handler.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub async fn handle_event(&self, event: &ControllerEvent) -> Result<EventOutcome, ControllerError> {
        match event {
            ControllerEvent::Workload(workload) => Ok(EventOutcome::Reconciled(
                self.reconciler.on_workload(workload).await?,
            )),
            ControllerEvent::StatusRecord(record) => Ok(EventOutcome::Evaluated {
                published: self.evaluator.on_status_record(record).await?,
            }),
        }
    }

    /// Handles one event under the per-event deadline.
    async fn handle_with_deadline(&self, event: &ControllerEvent) -> Result<EventOutcome, ControllerError> {
        tokio::time::timeout(self.settings.event_deadline, self.handle_event(event))
            .await
            .unwrap_or(Err(ControllerError::DeadlineExceeded {
                deadline_secs: self.settings.event_deadline.as_secs(),
            }))
    }

    /// Handles one feed entry, retrying failed attempts. Returns the outcome
    /// of the last attempt.
    async fn handle_entry(&self, entry: &FeedEntry) -> Result<EventOutcome, ControllerError> {
        let event = entry.decode()?;

        let mut attempt = 1;
        loop {
            match self.handle_with_deadline(&event).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.settings.max_event_attempts => {
                    warn!(
                        feed = %entry.kind,
                        seq = entry.seq,
                        attempt,
                        error = %e,
                        "event handling failed, retrying"
                    );
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles the next batch of `tailer`'s feed, acknowledging every entry
    /// once it is done with it. Returns the number of entries consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Feed`] if the feed cannot be read or
    /// acknowledged. Handler failures are logged, not returned.
    pub async fn process_batch(&self, tailer: &mut FeedTailer) -> Result<usize, ControllerError> {
        let entries = tailer.poll_async(self.settings.batch_size).await?;

        for entry in &entries {
            match self.handle_entry(entry).await {
                Ok(outcome) => {
                    debug!(feed = %entry.kind, seq = entry.seq, ?outcome, "event handled");
                },
                Err(e) => {
                    error!(
                        feed = %entry.kind,
                        seq = entry.seq,
                        error = %e,
                        "giving up on event"
                    );
                },
            }
            tailer.acknowledge_async(entry.seq).await?;
        }

        Ok(entries.len())
    }

    /// Deletes acknowledged entries of `tailer`'s feed older than the
    /// retention window. For the status record feed the notifier's delivery
    /// bookkeeping is pruned too. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Feed`] or [`ControllerError::Eviction`] if
    /// rows cannot be deleted.
    pub async fn evict_expired(&self, tailer: &FeedTailer) -> Result<usize, ControllerError> {
        let ttl_secs = self.settings.retention.as_secs();
        let mut evicted = tailer.evict_acknowledged_async(ttl_secs).await?;
        if tailer.kind() == FeedKind::StatusRecords {
            evicted += self
                .evaluator
                .evict_expired(ttl_secs)
                .await
                .map_err(ControllerError::Eviction)?;
        }
        Ok(evicted)
    }

    /// Tails one feed until `shutdown` turns true.
    ///
    /// # Errors
    ///
    /// Only returns errors from shutdown handling; feed failures are logged
    /// and retried after the poll interval.
    pub async fn run_feed(
        &self,
        mut tailer: FeedTailer,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let feed = tailer.kind();
        info!(
            feed = %feed,
            last_seq = tailer.last_seq(),
            batch_size = self.settings.batch_size,
            poll_interval_ms = u64::try_from(self.settings.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "feed consumer starting"
        );

        let mut idle_polls: u32 = 0;
        while !*shutdown.borrow() {
            let idle = match self.process_batch(&mut tailer).await {
                Ok(consumed) => consumed == 0,
                Err(e) => {
                    warn!(feed = %feed, error = %e, "error reading feed");
                    true
                },
            };

            if idle {
                idle_polls = idle_polls.wrapping_add(1);
                if idle_polls % EVICTION_INTERVAL_POLLS == 0 {
                    match self.evict_expired(&tailer).await {
                        Ok(0) => {},
                        Ok(evicted) => debug!(feed = %feed, evicted, "retention pass"),
                        Err(e) => warn!(feed = %feed, error = %e, "error during retention pass"),
                    }
                }

                tokio::select! {
                    () = tokio::time::sleep(self.settings.poll_interval) => {},
                    changed = shutdown.changed() => {
                        // A dropped sender also means shut down.
                        if changed.is_err() {
                            break;
                        }
                    },
                }
            }
        }

        info!(feed = %feed, "feed consumer shutting down");
        Ok(())
    }

    /// Runs both feed consumers on `conn` until `shutdown` turns true.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Feed`] if a tailer cannot be created.
    pub async fn run(
        self: Arc<Self>,
        conn: Arc<Mutex<Connection>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let workloads = FeedTailer::new(Arc::clone(&conn), FeedKind::Workloads)?;
        let records = FeedTailer::new(conn, FeedKind::StatusRecords)?;

        let workload_task = {
            let controller = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run_feed(workloads, shutdown).await })
        };
        let record_task = {
            let controller = Arc::clone(&self);
            tokio::spawn(async move { controller.run_feed(records, shutdown).await })
        };

        for (feed, task) in [
            (FeedKind::Workloads, workload_task),
            (FeedKind::StatusRecords, record_task),
        ] {
            match task.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(feed = %feed, error = %e, "feed consumer failed"),
                Err(e) => error!(feed = %feed, error = %e, "feed consumer task panicked"),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("reconciler", &self.reconciler)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use commitstatus_core::config::BranchProtectionConfig;
    use commitstatus_core::{BuildIdentityExtractor, WorkloadInstance};

    use super::*;
    use crate::notifier::{CommitStatusNotifier, NotifyError, NotifyRequest};
    use crate::reconciler::{ReconcilerConfig, SkipReason};
    use crate::resolver::ConfiguredContextResolver;
    use crate::store::SqliteStore;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyNotifier {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommitStatusNotifier for FlakyNotifier {
        async fn notify(&self, _request: &NotifyRequest) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(NotifyError::Network("unreachable".to_string()));
            }
            Ok(())
        }
    }

    /// Never completes.
    struct HangingNotifier;

    #[async_trait]
    impl CommitStatusNotifier for HangingNotifier {
        async fn notify(&self, _request: &NotifyRequest) -> Result<(), NotifyError> {
            std::future::pending().await
        }
    }

    fn controller(
        store: &SqliteStore,
        notifier: Arc<dyn CommitStatusNotifier>,
        settings: ControllerSettings,
    ) -> Controller {
        let reconciler = StatusReconciler::new(
            BuildIdentityExtractor::default(),
            Arc::new(ConfiguredContextResolver::new(BranchProtectionConfig {
                default_contexts: vec!["build".to_string()],
                repos: Vec::new(),
            })),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            ReconcilerConfig::default(),
        );
        Controller::new(reconciler, StatusEvaluator::new(notifier), settings)
    }

    fn settings(max_event_attempts: u32) -> ControllerSettings {
        ControllerSettings {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
            event_deadline: Duration::from_secs(1),
            max_event_attempts,
            retention: Duration::from_secs(3600),
        }
    }

    fn seed_record(store: &SqliteStore) {
        use commitstatus_core::status::{CommitRef, PipelineActivityRef, StatusDetail};

        let record = commitstatus_core::StatusRecord::new(
            "acme-widgets-pr-7-build",
            StatusDetail::pending(
                CommitRef {
                    url: "https://github.com/acme/widgets".to_string(),
                    sha: "head111".to_string(),
                    pull_request: Some("PR-7".to_string()),
                },
                PipelineActivityRef::default(),
                "build",
            ),
        )
        .unwrap();
        store.insert_record(&record).unwrap();
    }

    #[tokio::test]
    async fn non_build_workload_is_skipped() {
        let store = SqliteStore::in_memory().unwrap();
        let controller = controller(&store, Arc::new(crate::notifier::LogOnlyNotifier), settings(1));

        let outcome = controller
            .handle_event(&ControllerEvent::Workload(WorkloadInstance {
                name: "web-1".to_string(),
                ..WorkloadInstance::default()
            }))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            EventOutcome::Reconciled(ReconcileOutcome::Skipped(SkipReason::NotApplicable(_)))
        ));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_acknowledged() {
        let store = SqliteStore::in_memory().unwrap();
        seed_record(&store);
        let notifier = Arc::new(FlakyNotifier {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let controller = controller(&store, notifier.clone(), settings(3));

        let mut tailer = FeedTailer::new(store.connection(), FeedKind::StatusRecords).unwrap();
        assert_eq!(controller.process_batch(&mut tailer).await.unwrap(), 1);

        // pending fails, error fallback fails, pending succeeds on attempt 2.
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
        assert!(tailer.poll(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_still_acknowledge() {
        let store = SqliteStore::in_memory().unwrap();
        seed_record(&store);
        let notifier = Arc::new(FlakyNotifier {
            failures: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let controller = controller(&store, notifier.clone(), settings(2));

        let mut tailer = FeedTailer::new(store.connection(), FeedKind::StatusRecords).unwrap();
        controller.process_batch(&mut tailer).await.unwrap();

        // Two attempts, each a failed notification plus a failed fallback.
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 4);
        assert_eq!(tailer.last_seq(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_hits_deadline() {
        let store = SqliteStore::in_memory().unwrap();
        seed_record(&store);
        let controller = controller(&store, Arc::new(HangingNotifier), settings(1));

        let record = store
            .load_record("acme-widgets-pr-7-build")
            .unwrap()
            .unwrap()
            .value;
        let err = controller
            .handle_with_deadline(&ControllerEvent::StatusRecord(record))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::DeadlineExceeded { deadline_secs: 1 }));
    }

    #[tokio::test]
    async fn run_feed_stops_on_shutdown() {
        let store = SqliteStore::in_memory().unwrap();
        let controller = Arc::new(controller(
            &store,
            Arc::new(crate::notifier::LogOnlyNotifier),
            settings(1),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let controller = Arc::clone(&controller);
            let conn = store.connection();
            async move { controller.run(conn, rx).await }
        });

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn settings_follow_config() {
        let settings = ControllerSettings::from(&ControllerConfig {
            poll_interval_ms: 250,
            event_deadline_secs: 5,
            max_event_attempts: 0,
            retention_secs: 60,
            ..ControllerConfig::default()
        });
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.event_deadline, Duration::from_secs(5));
        assert_eq!(settings.max_event_attempts, 1);
        assert_eq!(settings.retention, Duration::from_secs(60));
    }

    fn change_rows(store: &SqliteStore) -> i64 {
        store
            .connection()
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM status_record_changes", [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn retention_pass_prunes_consumed_changes_and_deliveries() {
        use crate::notifier::{GitHubNotifierConfig, GitHubStatusNotifier};

        let store = SqliteStore::in_memory().unwrap();
        seed_record(&store);
        let notifier = Arc::new(
            GitHubStatusNotifier::new_mock(
                GitHubNotifierConfig::new("https://api.github.com").unwrap(),
            )
            .unwrap(),
        );
        let controller = controller(
            &store,
            notifier.clone(),
            ControllerSettings {
                retention: Duration::ZERO,
                ..settings(1)
            },
        );

        let mut tailer = FeedTailer::new(store.connection(), FeedKind::StatusRecords).unwrap();
        controller.process_batch(&mut tailer).await.unwrap();
        assert_eq!(notifier.delivered_count().unwrap(), 1);

        // A change written after the batch is not yet consumed.
        store
            .record_check_results("acme-widgets-pr-7-build", "head111", Vec::new())
            .unwrap();

        assert_eq!(controller.evict_expired(&tailer).await.unwrap(), 2);
        assert_eq!(change_rows(&store), 1);
        assert_eq!(notifier.delivered_count().unwrap(), 0);
        assert_eq!(tailer.poll(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn workload_retention_leaves_deliveries_alone() {
        use crate::notifier::{GitHubNotifierConfig, GitHubStatusNotifier};

        let store = SqliteStore::in_memory().unwrap();
        seed_record(&store);
        let notifier = Arc::new(
            GitHubStatusNotifier::new_mock(
                GitHubNotifierConfig::new("https://api.github.com").unwrap(),
            )
            .unwrap(),
        );
        let controller = controller(
            &store,
            notifier.clone(),
            ControllerSettings {
                retention: Duration::ZERO,
                ..settings(1)
            },
        );

        let mut records = FeedTailer::new(store.connection(), FeedKind::StatusRecords).unwrap();
        controller.process_batch(&mut records).await.unwrap();

        let workloads = FeedTailer::new(store.connection(), FeedKind::Workloads).unwrap();
        assert_eq!(controller.evict_expired(&workloads).await.unwrap(), 0);
        assert_eq!(notifier.delivered_count().unwrap(), 1);
    }
}
