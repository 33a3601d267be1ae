//! Deterministic resource names.
//!
//! Status records and pipeline activities are addressed by names derived
//! from build coordinates, so that every event for the same
//! `(owner, repo, branch, context)` lands on the same record.

/// Maximum length of a resource name.
pub const MAX_NAME_LENGTH: usize = 253;

/// Number of hex characters of the digest suffix appended to truncated
/// names.
const DIGEST_SUFFIX_LEN: usize = 12;

/// Normalizes an arbitrary string into a valid resource name.
///
/// The result is lowercase, contains only `[a-z0-9-.]`, has no runs of `-`,
/// and neither starts nor ends with `-` or `.`. Names longer than
/// [`MAX_NAME_LENGTH`] are truncated and suffixed with a BLAKE3 digest of the
/// original input so that distinct long inputs keep distinct names.
#[must_use]
pub fn to_valid_name(input: &str) -> String {
    let mut name = String::with_capacity(input.len());
    for ch in input.chars().flat_map(char::to_lowercase) {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' {
            ch
        } else {
            '-'
        };
        if ch == '-' && name.ends_with('-') {
            continue;
        }
        name.push(ch);
    }

    let trimmed = name.trim_matches(|c| c == '-' || c == '.');
    if trimmed.len() <= MAX_NAME_LENGTH {
        return trimmed.to_string();
    }

    let digest = blake3::hash(input.as_bytes());
    let suffix = &hex::encode(digest.as_bytes())[..DIGEST_SUFFIX_LEN];
    let keep = MAX_NAME_LENGTH - DIGEST_SUFFIX_LEN - 1;
    // Only ASCII remains after normalization, so byte slicing is safe.
    let head = trimmed[..keep].trim_end_matches(|c| c == '-' || c == '.');
    format!("{head}-{suffix}")
}

/// Name of the status record for one context of a branch.
#[must_use]
pub fn record_name(owner: &str, repo: &str, branch: &str, context: &str) -> String {
    to_valid_name(&format!("{owner}-{repo}-{branch}-{context}"))
}

/// Name of the pipeline activity for one build of a branch.
#[must_use]
pub fn activity_name(owner: &str, repo: &str, branch: &str, build_number: &str) -> String {
    to_valid_name(&format!("{owner}-{repo}-{branch}-{build_number}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_replaces_invalid_characters() {
        assert_eq!(to_valid_name("Acme/Widgets_PR-7"), "acme-widgets-pr-7");
        assert_eq!(to_valid_name("ci/lint check"), "ci-lint-check");
    }

    #[test]
    fn collapses_and_trims_dashes() {
        assert_eq!(to_valid_name("--a//b--"), "a-b");
        assert_eq!(to_valid_name(".release.1."), "release.1");
    }

    #[test]
    fn long_names_are_truncated_with_digest() {
        let a = to_valid_name(&format!("{}-a", "x".repeat(400)));
        let b = to_valid_name(&format!("{}-b", "x".repeat(400)));

        assert_eq!(a.len(), MAX_NAME_LENGTH);
        assert_eq!(b.len(), MAX_NAME_LENGTH);
        assert_ne!(a, b);
    }

    #[test]
    fn record_and_activity_names() {
        assert_eq!(
            record_name("acme", "widgets", "PR-7", "build"),
            "acme-widgets-pr-7-build"
        );
        assert_eq!(
            activity_name("acme", "widgets", "master", "12"),
            "acme-widgets-master-12"
        );
    }
}
