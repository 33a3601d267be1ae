//! Commit status notifiers.
//!
//! A [`CommitStatusNotifier`] publishes one decided status for one
//! commit and context. Two implementations ship:
//!
//! - [`GitHubStatusNotifier`] posts to the GitHub REST API
//!   (`POST /repos/{owner}/{repo}/statuses/{sha}`, plus an issue comment when
//!   the decision carries one and the commit names a pull request).
//! - [`LogOnlyNotifier`] only logs, for deployments without GitHub
//!   credentials.
//!
//! # Idempotency
//!
//! Status record changes are delivered at least once and every write to a
//! record re-evaluates all of its details, so the same notification is
//! requested many times. The GitHub notifier remembers, per
//! `(owner, repo, sha, context)`, the last status it delivered, as a BLAKE3
//! digest of the request including its generation, state, description and
//! comment. A request matching that last delivery is skipped; anything else
//! is posted.
//!
//! Only the latest delivery counts: after `pending`, `success`, a second
//! `pending` for the same commit (a superseding build) is posted again.
//! The generation is the pipeline activity uid, so a rerun that ends in the
//! same state as the build it replaced is posted as well.
//!
//! The cache is written only after the API accepted the status, so failed
//! deliveries are retried. Entries older than the retention window are
//! removed by [`CommitStatusNotifier::evict_expired`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use commitstatus_core::CommitState;
use commitstatus_core::status::CommitRef;
use http_body_util::Full;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::now_secs;

/// Maximum length of a status description accepted by GitHub.
pub const MAX_DESCRIPTION_LENGTH: usize = 140;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while publishing a status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NotifyError {
    /// GitHub API error.
    #[error("GitHub API error: {message}")]
    GitHubApi {
        /// Error message from the API.
        message: String,
        /// HTTP status code, if available.
        status_code: Option<u16>,
    },

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimitExceeded {
        /// Seconds until rate limit resets.
        retry_after_secs: u64,
    },

    /// The commit URL does not name a repository.
    #[error("cannot determine owner/repo from repository URL {url:?}")]
    InvalidRepositoryUrl {
        /// The offending URL.
        url: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Input validation error.
    #[error("input validation error: {0}")]
    Validation(String),
}

// =============================================================================
// Notifier Trait
// =============================================================================

/// A status to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRequest {
    /// Commit the status is reported against.
    pub commit: CommitRef,
    /// Commit state.
    pub state: CommitState,
    /// Short description.
    pub description: String,
    /// Markdown comment for the pull request, if any.
    pub comment: Option<String>,
    /// Status context.
    pub context: String,
    /// Build generation the status belongs to (the pipeline activity uid).
    pub generation: String,
}

/// Publishes commit statuses to an external system.
#[async_trait]
pub trait CommitStatusNotifier: Send + Sync {
    /// Publishes one status.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the status could not be published.
    async fn notify(&self, request: &NotifyRequest) -> Result<(), NotifyError>;

    /// Drops delivery bookkeeping older than `ttl_secs`, returning the number
    /// of entries removed. Notifiers without bookkeeping remove nothing.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Database`] if the bookkeeping cannot be pruned.
    async fn evict_expired(&self, _ttl_secs: u64) -> Result<usize, NotifyError> {
        Ok(0)
    }
}

/// Notifier that only logs what it would publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyNotifier;

#[async_trait]
impl CommitStatusNotifier for LogOnlyNotifier {
    async fn notify(&self, request: &NotifyRequest) -> Result<(), NotifyError> {
        info!(
            url = %request.commit.url,
            sha = %request.commit.sha,
            context = %request.context,
            state = %request.state,
            description = %request.description,
            has_comment = request.comment.is_some(),
            "commit status"
        );
        Ok(())
    }
}

// =============================================================================
// Repository URLs
// =============================================================================

/// Owner and name of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRepoRef {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
}

impl GitRepoRef {
    /// Parses `https://host/owner/repo(.git)` and `git@host:owner/repo(.git)`
    /// URLs.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::InvalidRepositoryUrl`] when the URL does not
    /// name an owner and a repository.
    pub fn parse(url: &str) -> Result<Self, NotifyError> {
        let invalid = || NotifyError::InvalidRepositoryUrl {
            url: url.to_string(),
        };

        let trimmed = url.trim();
        let path = if let Some((_, rest)) = trimmed.split_once("://") {
            rest.split_once('/').map(|(_, path)| path).ok_or_else(invalid)?
        } else if let Some((_, path)) = trimmed.split_once(':') {
            path
        } else {
            return Err(invalid());
        };

        let mut segments = path
            .split(['/', '?', '#'])
            .take_while(|s| !s.is_empty());
        let owner = segments.next().ok_or_else(invalid)?;
        let repo = segments.next().ok_or_else(invalid)?;
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        if repo.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

// =============================================================================
// NotificationCache (SQLite-backed)
// =============================================================================

/// Schema SQL for the notification cache.
const CACHE_SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS last_delivered_statuses (
        owner TEXT NOT NULL,
        repo TEXT NOT NULL,
        sha TEXT NOT NULL,
        context TEXT NOT NULL,
        key TEXT NOT NULL,
        state TEXT NOT NULL,
        delivered_at INTEGER NOT NULL,
        PRIMARY KEY (owner, repo, sha, context)
    );

    CREATE INDEX IF NOT EXISTS idx_last_delivered_at
        ON last_delivered_statuses(delivered_at);
";

/// `SQLite`-backed record of the last status delivered per commit and
/// context.
#[derive(Clone)]
struct NotificationCache {
    conn: Arc<Mutex<Connection>>,
}

impl NotificationCache {
    /// Opens or creates a cache at the specified path.
    fn open(path: impl AsRef<Path>) -> Result<Self, NotifyError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| NotifyError::Database(e.to_string()))?;
        Self::init(conn)
    }

    /// Creates an in-memory cache for testing.
    fn in_memory() -> Result<Self, NotifyError> {
        let conn =
            Connection::open_in_memory().map_err(|e| NotifyError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, NotifyError> {
        conn.execute_batch(CACHE_SCHEMA_SQL)
            .map_err(|e| NotifyError::Database(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, NotifyError> {
        self.conn
            .lock()
            .map_err(|e| NotifyError::Database(format!("mutex poisoned: {e}")))
    }

    /// Returns true when `key` is the last status delivered for the
    /// request's commit and context.
    fn is_last_delivered(
        &self,
        repo: &GitRepoRef,
        request: &NotifyRequest,
        key: &str,
    ) -> Result<bool, NotifyError> {
        let conn = self.lock()?;
        let last: Option<String> = conn
            .query_row(
                "SELECT key FROM last_delivered_statuses
                 WHERE owner = ?1 AND repo = ?2 AND sha = ?3 AND context = ?4",
                params![&repo.owner, &repo.repo, &request.commit.sha, &request.context],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| NotifyError::Database(e.to_string()))?;
        Ok(last.as_deref() == Some(key))
    }

    fn record_delivery(
        &self,
        key: &str,
        repo: &GitRepoRef,
        request: &NotifyRequest,
    ) -> Result<(), NotifyError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO last_delivered_statuses
             (owner, repo, sha, context, key, state, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &repo.owner,
                &repo.repo,
                &request.commit.sha,
                &request.context,
                key,
                request.state.as_str(),
                now_secs()
            ],
        )
        .map_err(|e| NotifyError::Database(e.to_string()))?;
        Ok(())
    }

    fn evict_expired(&self, ttl_secs: u64) -> Result<usize, NotifyError> {
        let conn = self.lock()?;
        let cutoff = now_secs().saturating_sub(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        let deleted = conn
            .execute(
                "DELETE FROM last_delivered_statuses WHERE delivered_at <= ?1",
                params![cutoff],
            )
            .map_err(|e| NotifyError::Database(e.to_string()))?;
        if deleted > 0 {
            debug!(deleted, ttl_secs, "evicted expired delivery records");
        }
        Ok(deleted)
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn size(&self) -> Result<usize, NotifyError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM last_delivered_statuses", [], |row| {
                row.get(0)
            })
            .map_err(|e| NotifyError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    /// Runs `f` against this cache on the blocking thread pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, NotifyError>
    where
        F: FnOnce(&Self) -> Result<T, NotifyError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || f(&cache))
            .await
            .map_err(|e| NotifyError::Database(format!("blocking task failed: {e}")))?
    }
}

/// Deterministic idempotency key of a notification.
fn notification_key(repo: &GitRepoRef, request: &NotifyRequest) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in [
        repo.owner.as_str(),
        repo.repo.as_str(),
        request.commit.sha.as_str(),
        request.context.as_str(),
        request.generation.as_str(),
        request.state.as_str(),
        request.description.as_str(),
        request.comment.as_deref().unwrap_or(""),
    ] {
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(&[u8::from(request.comment.is_some())]);
    hex::encode(hasher.finalize().as_bytes())
}

/// Truncates a description to [`MAX_DESCRIPTION_LENGTH`] characters.
#[must_use]
pub fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_LENGTH).collect()
}

// =============================================================================
// GitHub HTTP Client
// =============================================================================

/// GitHub notifier configuration.
pub struct GitHubNotifierConfig {
    /// GitHub API base URL (e.g., "<https://api.github.com>").
    pub api_base_url: String,

    /// Link attached to every posted status.
    pub target_url: Option<String>,

    /// API token.
    pub api_token: Option<SecretString>,
}

impl GitHubNotifierConfig {
    /// Creates a configuration for `api_base_url` without credentials.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::InvalidConfiguration`] if the URL is empty or
    /// not http(s).
    pub fn new(api_base_url: impl Into<String>) -> Result<Self, NotifyError> {
        let api_base_url = api_base_url.into();
        if !(api_base_url.starts_with("https://") || api_base_url.starts_with("http://")) {
            return Err(NotifyError::InvalidConfiguration(format!(
                "api base url must be http(s), got {api_base_url:?}"
            )));
        }
        Ok(Self {
            api_base_url,
            target_url: None,
            api_token: None,
        })
    }

    /// Sets the link attached to every posted status.
    #[must_use]
    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Sets the API token.
    #[must_use]
    pub fn with_api_token(mut self, token: SecretString) -> Self {
        self.api_token = Some(token);
        self
    }
}

impl std::fmt::Debug for GitHubNotifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubNotifierConfig")
            .field("api_base_url", &self.api_base_url)
            .field("target_url", &self.target_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// HTTP client for GitHub API calls.
struct GitHubClient {
    config: GitHubNotifierConfig,
    http: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl GitHubClient {
    fn new(config: GitHubNotifierConfig) -> Result<Self, NotifyError> {
        use hyper_rustls::HttpsConnectorBuilder;
        use hyper_util::rt::TokioExecutor;

        if config.api_base_url.is_empty() {
            return Err(NotifyError::InvalidConfiguration(
                "api base url cannot be empty".to_string(),
            ));
        }

        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let http = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self { config, http })
    }

    /// Posts a commit status.
    ///
    /// POST /repos/{owner}/{repo}/statuses/{sha}
    async fn post_commit_status(
        &self,
        repo: &GitRepoRef,
        request: &NotifyRequest,
        description: &str,
    ) -> Result<(), NotifyError> {
        let path = format!(
            "/repos/{}/{}/statuses/{}",
            repo.owner, repo.repo, request.commit.sha
        );
        let body = serde_json::json!({
            "state": request.state.as_str(),
            "context": request.context,
            "description": description,
            "target_url": self.config.target_url,
        });
        self.post_json(&path, &body).await
    }

    /// Posts a pull request comment.
    ///
    /// POST /repos/{owner}/{repo}/issues/{number}/comments
    async fn post_issue_comment(
        &self,
        repo: &GitRepoRef,
        number: u64,
        comment: &str,
    ) -> Result<(), NotifyError> {
        let path = format!("/repos/{}/{}/issues/{number}/comments", repo.owner, repo.repo);
        self.post_json(&path, &serde_json::json!({ "body": comment }))
            .await
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<(), NotifyError> {
        use http::{Request, StatusCode};
        use http_body_util::{BodyExt, Collected};

        let url = format!("{}{path}", self.config.api_base_url.trim_end_matches('/'));
        let body_bytes =
            serde_json::to_vec(body).map_err(|e| NotifyError::Validation(e.to_string()))?;

        let mut request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "commitstatus-daemon/0.1")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(token) = &self.config.api_token {
            request = request.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }

        let request = request
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| NotifyError::Network(e.to_string()))?;

        debug!(url = %url, "posting to GitHub");

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| NotifyError::Network(e.to_string()))?;

        let status_code = response.status();

        if status_code == StatusCode::TOO_MANY_REQUESTS
            || (status_code == StatusCode::FORBIDDEN
                && response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok())
                    == Some("0"))
        {
            let retry_after: u64 = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(NotifyError::RateLimitExceeded {
                retry_after_secs: retry_after,
            });
        }

        if status_code == StatusCode::UNAUTHORIZED {
            return Err(NotifyError::Authentication(
                "GitHub API authentication failed - check API token".to_string(),
            ));
        }

        if !status_code.is_success() {
            let body: Option<Bytes> = response
                .into_body()
                .collect()
                .await
                .map(Collected::to_bytes)
                .ok();
            let message = body
                .and_then(|b| String::from_utf8(b.to_vec()).ok())
                .unwrap_or_else(|| format!("HTTP {status_code}"));

            return Err(NotifyError::GitHubApi {
                message,
                status_code: Some(status_code.as_u16()),
            });
        }

        Ok(())
    }
}

// =============================================================================
// GitHubStatusNotifier
// =============================================================================

/// Publishes commit statuses to GitHub.
///
/// Safe to share across tasks.
pub struct GitHubStatusNotifier {
    cache: NotificationCache,
    client: GitHubClient,
    /// Mock mode: if true, don't actually call GitHub API.
    mock_mode: bool,
}

impl GitHubStatusNotifier {
    /// Creates a notifier with a persistent delivery cache at `cache_path`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the cache cannot be opened or the
    /// configuration is invalid.
    pub fn new(config: GitHubNotifierConfig, cache_path: impl AsRef<Path>) -> Result<Self, NotifyError> {
        Ok(Self {
            cache: NotificationCache::open(cache_path)?,
            client: GitHubClient::new(config)?,
            mock_mode: false,
        })
    }

    /// Creates a notifier that makes no API calls and uses an in-memory
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the in-memory cache cannot be created.
    pub fn new_mock(config: GitHubNotifierConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            cache: NotificationCache::in_memory()?,
            client: GitHubClient::new(config)?,
            mock_mode: true,
        })
    }

    /// Returns whether the notifier is in mock mode.
    #[must_use]
    pub const fn is_mock(&self) -> bool {
        self.mock_mode
    }

    /// Returns the number of commit and context pairs with a delivered
    /// status on record.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Database`] if the count cannot be read.
    pub fn delivered_count(&self) -> Result<usize, NotifyError> {
        self.cache.size()
    }
}

impl std::fmt::Debug for GitHubStatusNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubStatusNotifier")
            .field("config", &self.client.config)
            .field("mock_mode", &self.mock_mode)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CommitStatusNotifier for GitHubStatusNotifier {
    async fn notify(&self, request: &NotifyRequest) -> Result<(), NotifyError> {
        if request.commit.sha.is_empty() {
            return Err(NotifyError::Validation("commit sha cannot be empty".to_string()));
        }
        let repo = GitRepoRef::parse(&request.commit.url)?;
        let key = notification_key(&repo, request);

        let already_delivered = {
            let (repo, request, key) = (repo.clone(), request.clone(), key.clone());
            self.cache
                .blocking(move |cache| cache.is_last_delivered(&repo, &request, &key))
                .await?
        };
        if already_delivered {
            debug!(
                sha = %request.commit.sha,
                context = %request.context,
                state = %request.state,
                "status already delivered"
            );
            return Ok(());
        }

        if !self.mock_mode {
            let description = truncate_description(&request.description);
            self.client
                .post_commit_status(&repo, request, &description)
                .await?;

            if let (Some(comment), Some(number)) =
                (&request.comment, request.commit.pull_request_number())
            {
                self.client.post_issue_comment(&repo, number, comment).await?;
            }
        }

        info!(
            owner = %repo.owner,
            repo = %repo.repo,
            sha = %request.commit.sha,
            context = %request.context,
            state = %request.state,
            "commit status published"
        );

        let request = request.clone();
        self.cache
            .blocking(move |cache| cache.record_delivery(&key, &repo, &request))
            .await
    }

    async fn evict_expired(&self, ttl_secs: u64) -> Result<usize, NotifyError> {
        self.cache
            .blocking(move |cache| cache.evict_expired(ttl_secs))
            .await
    }
}
