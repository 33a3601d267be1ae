//! Required status context resolution.
//!
//! A [`ContextResolver`] answers which named checks branch protection
//! requires for a repository. The shipped [`ConfiguredContextResolver`]
//! answers from the `[branch_protection]` configuration section.

use async_trait::async_trait;
use commitstatus_core::config::{ANY_REPO, BranchProtectionConfig};
use thiserror::Error;

/// Errors returned by a context resolver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolverError {
    /// The policy source could not be consulted.
    #[error("failed to resolve required contexts for {owner}/{repo}: {message}")]
    Unavailable {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Underlying failure.
        message: String,
    },
}

/// Source of the contexts branch protection requires for a repository.
#[async_trait]
pub trait ContextResolver: Send + Sync {
    /// Returns the required contexts, ordered and without duplicates.
    ///
    /// An empty list is valid and means nothing needs reporting.
    async fn required_contexts(&self, owner: &str, repo: &str)
    -> Result<Vec<String>, ResolverError>;
}

/// Resolves required contexts from static configuration.
///
/// Precedence, most specific first: an entry for `owner/repo`, an entry for
/// `owner/*`, then `default_contexts`. The first matching level wins; levels
/// are not merged.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredContextResolver {
    policy: BranchProtectionConfig,
}

impl ConfiguredContextResolver {
    /// Creates a resolver over `policy`.
    #[must_use]
    pub const fn new(policy: BranchProtectionConfig) -> Self {
        Self { policy }
    }

    /// Resolves synchronously; lookups never fail.
    #[must_use]
    pub fn resolve(&self, owner: &str, repo: &str) -> Vec<String> {
        let exact = self
            .policy
            .repos
            .iter()
            .find(|e| e.owner.eq_ignore_ascii_case(owner) && e.repo.eq_ignore_ascii_case(repo));
        let any = || {
            self.policy
                .repos
                .iter()
                .find(|e| e.owner.eq_ignore_ascii_case(owner) && e.repo == ANY_REPO)
        };

        let contexts = exact
            .or_else(any)
            .map_or(&self.policy.default_contexts, |e| &e.contexts);
        dedup_in_order(contexts)
    }
}

#[async_trait]
impl ContextResolver for ConfiguredContextResolver {
    async fn required_contexts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<String>, ResolverError> {
        Ok(self.resolve(owner, repo))
    }
}

fn dedup_in_order(contexts: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(contexts.len());
    for context in contexts {
        let context = context.trim();
        if !context.is_empty() && !out.iter().any(|c| c == context) {
            out.push(context.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use commitstatus_core::config::RepoContexts;

    use super::*;

    fn entry(owner: &str, repo: &str, contexts: &[&str]) -> RepoContexts {
        RepoContexts {
            owner: owner.to_string(),
            repo: repo.to_string(),
            contexts: contexts.iter().map(ToString::to_string).collect(),
        }
    }

    fn resolver() -> ConfiguredContextResolver {
        ConfiguredContextResolver::new(BranchProtectionConfig {
            default_contexts: vec!["build".to_string()],
            repos: vec![
                entry("acme", "*", &["build", "lint"]),
                entry("acme", "widgets", &["build", "test", "build"]),
                entry("other", "quiet", &[]),
            ],
        })
    }

    #[test]
    fn exact_repo_wins_over_owner_wildcard() {
        assert_eq!(resolver().resolve("acme", "widgets"), vec!["build", "test"]);
    }

    #[test]
    fn owner_wildcard_wins_over_default() {
        assert_eq!(resolver().resolve("acme", "gadgets"), vec!["build", "lint"]);
    }

    #[test]
    fn default_applies_to_unknown_repos() {
        assert_eq!(resolver().resolve("someone", "else"), vec!["build"]);
    }

    #[test]
    fn empty_entry_requires_nothing() {
        assert!(resolver().resolve("other", "quiet").is_empty());
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(resolver().resolve("ACME", "Widgets"), vec!["build", "test"]);
    }

    #[tokio::test]
    async fn trait_delegates_to_resolve() {
        let contexts = resolver().required_contexts("acme", "gadgets").await.unwrap();
        assert_eq!(contexts, vec!["build", "lint"]);
    }
}
