//! Configuration parsing.
//!
//! The controller reads a single TOML file (`commitstatus.toml` by default)
//! with three sections:
//!
//! ```toml
//! [controller]
//! database = "/var/lib/commitstatus/state.db"
//! reconcile_branch_builds = false
//!
//! [github]
//! enabled = true
//! token_env = "GITHUB_TOKEN"
//!
//! [branch_protection]
//! default_contexts = ["build"]
//!
//! [[branch_protection.repos]]
//! owner = "acme"
//! repo = "*"
//! contexts = ["build", "lint"]
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::build_identity::DEFAULT_BUILD_NUMBER_VAR;

/// Wildcard accepted in [`RepoContexts::repo`] to match every repository of
/// an owner.
pub const ANY_REPO: &str = "*";

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitStatusConfig {
    /// Controller loop settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// GitHub notifier settings.
    #[serde(default)]
    pub github: GitHubConfig,

    /// Required status contexts per repository.
    #[serde(default)]
    pub branch_protection: BranchProtectionConfig,
}

impl CommitStatusConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let controller = &self.controller;
        if controller.build_number_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "controller.build_number_env cannot be empty".to_string(),
            ));
        }
        if controller.batch_size == 0 {
            return Err(ConfigError::Validation(
                "controller.batch_size must be at least 1".to_string(),
            ));
        }
        if controller.max_event_attempts == 0 {
            return Err(ConfigError::Validation(
                "controller.max_event_attempts must be at least 1".to_string(),
            ));
        }
        if controller.event_deadline_secs == 0 {
            return Err(ConfigError::Validation(
                "controller.event_deadline_secs must be at least 1".to_string(),
            ));
        }

        // A missing token must not silently downgrade to log-only delivery.
        if self.github.enabled
            && self
                .github
                .token_env
                .as_deref()
                .map_or(true, |v| v.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "github.token_env is required when github.enabled = true".to_string(),
            ));
        }

        for (index, entry) in self.branch_protection.repos.iter().enumerate() {
            if entry.owner.trim().is_empty() || entry.repo.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "branch_protection.repos[{index}] needs a non-empty owner and repo"
                )));
            }
        }

        Ok(())
    }
}

/// Controller loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// SQLite database holding status records, activities, and feeds.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Environment variable carrying the build number.
    #[serde(default = "default_build_number_env")]
    pub build_number_env: String,

    /// Also reconcile builds that are not pull requests.
    #[serde(default)]
    pub reconcile_branch_builds: bool,

    /// Append a pending detail when a new commit arrives on an existing
    /// record instead of leaving the record untouched.
    #[serde(default)]
    pub append_new_commits: bool,

    /// Feed poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of events fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deadline for handling a single event, in seconds.
    #[serde(default = "default_event_deadline_secs")]
    pub event_deadline_secs: u64,

    /// Attempts per event before it is logged and skipped.
    #[serde(default = "default_max_event_attempts")]
    pub max_event_attempts: u32,

    /// Re-fetch attempts after a concurrent write to the same record.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// How long consumed feed entries and delivery records are kept, in
    /// seconds.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            build_number_env: default_build_number_env(),
            reconcile_branch_builds: false,
            append_new_commits: false,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            event_deadline_secs: default_event_deadline_secs(),
            max_event_attempts: default_max_event_attempts(),
            max_conflict_retries: default_max_conflict_retries(),
            retention_secs: default_retention_secs(),
        }
    }
}

/// GitHub notifier settings.
///
/// Disabled by default; statuses are then only logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubConfig {
    /// Whether statuses are posted to GitHub.
    #[serde(default)]
    pub enabled: bool,

    /// GitHub API base URL.
    #[serde(default = "default_github_api_url")]
    pub api_url: String,

    /// Name of the environment variable holding the API token.
    ///
    /// Required when `enabled = true`.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Link attached to every posted status.
    #[serde(default)]
    pub target_url: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_github_api_url(),
            token_env: None,
            target_url: None,
        }
    }
}

/// Branch protection policy: which contexts each repository requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchProtectionConfig {
    /// Contexts for repositories without a more specific entry.
    #[serde(default)]
    pub default_contexts: Vec<String>,

    /// Per-repository or per-owner entries.
    #[serde(default)]
    pub repos: Vec<RepoContexts>,
}

/// Required contexts for one repository, or for every repository of an
/// owner when `repo` is [`ANY_REPO`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoContexts {
    /// Repository owner.
    pub owner: String,
    /// Repository name or `*`.
    pub repo: String,
    /// Required contexts, in reporting order.
    #[serde(default)]
    pub contexts: Vec<String>,
}

fn default_database() -> PathBuf {
    PathBuf::from("commitstatus.db")
}

fn default_build_number_env() -> String {
    DEFAULT_BUILD_NUMBER_VAR.to_string()
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_batch_size() -> usize {
    100
}

const fn default_event_deadline_secs() -> u64 {
    30
}

const fn default_max_event_attempts() -> u32 {
    3
}

const fn default_max_conflict_retries() -> u32 {
    5
}

/// Seven days.
const fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
