#![allow(clippy::doc_markdown)]

//! commitstatus-daemon - commit status controller runtime.
//!
//! Wires the pure domain logic of `commitstatus-core` to its collaborators:
//! a SQLite record store and event feeds, a configuration-backed context
//! resolver, and a GitHub commit status notifier.
//!
//! # Runtime Requirements
//!
//! The store and feeds run blocking SQLite calls on
//! `tokio::task::spawn_blocking`, so a tokio runtime is required. The
//! `commitstatus-daemon` binary uses the multi-threaded runtime.
//!
//! # Modules
//!
//! - [`store`]: status record store, pipeline activity lookup
//! - [`feed`]: workload and status record feeds with persisted watermarks
//! - [`resolver`]: required status contexts per repository
//! - [`reconciler`]: workload events to status records
//! - [`evaluator`]: status records to published commit statuses
//! - [`notifier`]: GitHub and log-only status publishers
//! - [`controller`]: the two feed consumers and their retry policy

pub mod controller;
pub mod evaluator;
pub mod feed;
pub mod notifier;
pub mod reconciler;
pub mod resolver;
pub mod store;

pub use controller::{Controller, ControllerError, ControllerSettings, EventOutcome};
pub use evaluator::{EvaluatorError, StatusEvaluator};
pub use feed::{ControllerEvent, FeedError, FeedKind, FeedTailer};
pub use notifier::{
    CommitStatusNotifier, GitHubNotifierConfig, GitHubStatusNotifier, LogOnlyNotifier,
    NotifyError, NotifyRequest,
};
pub use reconciler::{
    ReconcileError, ReconcileOutcome, ReconcilerConfig, SkipReason, StatusReconciler,
    UpsertOutcome, UpsertRequest,
};
pub use resolver::{ConfiguredContextResolver, ContextResolver, ResolverError};
pub use store::{ActivityLookup, RecordStore, SqliteStore, StoreError, Versioned};
