//! Branch-name validation and the per-repository default-branch cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::git::GitCli;

/// Lowercase segments joined by single separators; consecutive separators
/// never match because every separator must be followed by a segment.
static BRANCH_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+([._/-][a-z0-9_]+)*$").unwrap());

pub fn validate_branch_name(name: &str) -> CoreResult<()> {
    if BRANCH_NAME.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidArgument(format!(
            "branch name '{name}' must be lowercase segments separated by single '.', '_', '/', or '-'"
        )))
    }
}

/// Fallback candidates tried in order when `origin/HEAD` is unset.
const FALLBACK_BRANCHES: [&str; 3] = ["main", "master", "develop"];

/// In-memory cache of each repository's default branch, detected from its
/// query repo. An absent entry surfaces as an error to callers; nothing
/// ever silently falls back to a hard-coded name.
#[derive(Default)]
pub struct DefaultBranchCache {
    entries: Mutex<HashMap<String, String>>,
}

impl DefaultBranchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, repo_url: &str) -> Option<String> {
        self.entries.lock().unwrap().get(repo_url).cloned()
    }

    /// Record a detection result without touching disk.
    pub fn set(&self, repo_url: &str, branch: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(repo_url.to_string(), branch.to_string());
    }

    /// Detect the default branch inside `query_repo` and update the cache.
    /// `symbolic-ref refs/remotes/origin/HEAD` wins; otherwise the first
    /// existing fallback candidate. No candidate means no cache entry and
    /// an error for the caller.
    pub async fn detect(&self, repo_url: &str, query_repo: &Path) -> CoreResult<String> {
        match GitCli::symbolic_ref(query_repo, "refs/remotes/origin/HEAD").await {
            Ok(full) => {
                let branch = full
                    .strip_prefix("refs/remotes/origin/")
                    .unwrap_or(full.as_str())
                    .to_string();
                debug!(repo_url, branch, "default branch from origin/HEAD");
                self.set(repo_url, &branch);
                return Ok(branch);
            }
            Err(e) => {
                debug!(repo_url, "symbolic-ref failed, trying fallbacks: {e}");
            }
        }

        for candidate in FALLBACK_BRANCHES {
            match GitCli::remote_ref_exists(query_repo, candidate).await {
                Ok(true) => {
                    self.set(repo_url, candidate);
                    return Ok(candidate.to_string());
                }
                Ok(false) => {}
                Err(e) => warn!(repo_url, candidate, "show-ref failed: {e}"),
            }
        }

        Err(CoreError::NotFound(format!(
            "no default branch detectable for {repo_url}"
        )))
    }

    /// Cached value, or detect on miss.
    pub async fn get_or_detect(&self, repo_url: &str, query_repo: &Path) -> CoreResult<String> {
        if let Some(branch) = self.get(repo_url) {
            return Ok(branch);
        }
        self.detect(repo_url, query_repo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_branch_names() {
        for name in ["a", "a.b", "a/b", "a.b/c_d-e", "feature/add_thing", "v1.2.3"] {
            assert!(validate_branch_name(name).is_ok(), "expected valid: {name}");
        }
    }

    #[test]
    fn test_invalid_branch_names() {
        for name in ["a..b", "-a", "a--b", "", "UPPER", "a b", "a/", "/a", "a.-b"] {
            assert!(validate_branch_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn test_cache_set_get() {
        let cache = DefaultBranchCache::new();
        assert!(cache.get("https://github.com/acme/widgets").is_none());

        cache.set("https://github.com/acme/widgets", "develop");
        assert_eq!(
            cache.get("https://github.com/acme/widgets").as_deref(),
            Some("develop")
        );

        // Consecutive reads agree
        assert_eq!(
            cache.get("https://github.com/acme/widgets"),
            cache.get("https://github.com/acme/widgets")
        );
    }
}
