#![allow(clippy::doc_markdown)]

//! commitstatus-core - domain model for commit status reconciliation.
//!
//! This crate holds the pure, I/O-free parts of the commit status
//! controller. Everything here is deterministic and can be exercised without
//! a runtime, a database, or a network.
//!
//! # Modules
//!
//! - [`build_identity`]: typed extraction of build identity from a workload
//!   instance's declared environment
//! - [`status`]: `StatusRecord` / `StatusDetail` data model and the
//!   one-detail-per-sha invariant
//! - [`naming`]: deterministic record and pipeline-activity names
//! - [`decision`]: mapping a status detail to the commit state and message
//!   that must be published
//! - [`config`]: TOML configuration for the controller

pub mod build_identity;
pub mod config;
pub mod decision;
pub mod naming;
pub mod status;

pub use build_identity::{
    BuildIdentity, BuildIdentityExtractor, Container, EnvVar, IdentityError, WorkloadInstance,
};
pub use decision::{CommitState, StatusDecision, decide};
pub use status::{CommitRef, PipelineActivityRef, RecordError, StatusDetail, StatusRecord, SubCheck};
