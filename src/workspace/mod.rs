//! Workspace lifecycle: bare clones, worktrees, default-branch cache,
//! git-status refresh, and the metadata watcher.
//!
//! Every mutating git operation for a repository runs under that repo's
//! lock; status polling does not. Lock order is store lock before repo
//! lock before any multiplexer lock.

pub mod branches;
pub mod status;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, ScmMode};
use crate::error::{CoreError, CoreResult};
use crate::git::GitCli;
use crate::state::{Store, Workspace, WorktreeBase};
use branches::{validate_branch_name, DefaultBranchCache};
use watcher::GitMetadataWatcher;

/// Git-safety summary computed before destroying a workspace.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub modified_files: u32,
    pub untracked_files: u32,
    /// Ahead of `@{u}`; zero when no upstream is configured
    pub unpushed_commits: u32,
    pub safe: bool,
}

pub type ChangeNotifier = Arc<dyn Fn() + Send + Sync>;

pub struct WorkspaceManager {
    store: Arc<Store>,
    scm: ScmMode,
    workspace_root: PathBuf,
    base_root: PathBuf,
    query_root: PathBuf,
    repos: Vec<(String, String)>,
    repo_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    branches: DefaultBranchCache,
    watcher: Mutex<Option<GitMetadataWatcher>>,
    on_change: ChangeNotifier,
}

impl WorkspaceManager {
    pub fn new(config: &Config, store: Arc<Store>, on_change: ChangeNotifier) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            scm: config.source_code_management,
            workspace_root: PathBuf::from(&config.workspace_path),
            base_root: PathBuf::from(&config.base_repos_path),
            query_root: PathBuf::from(&config.query_repos_path),
            repos: config
                .repos
                .iter()
                .map(|r| (r.name.clone(), r.url.clone()))
                .collect(),
            repo_locks: Mutex::new(HashMap::new()),
            branches: DefaultBranchCache::new(),
            watcher: Mutex::new(None),
            on_change,
        });

        let weak = Arc::downgrade(&manager);
        match GitMetadataWatcher::new(Arc::new(move |workspace_id: String| {
            if let Some(manager) = weak.upgrade() {
                tokio::spawn(async move {
                    manager.refresh_status(&workspace_id).await;
                });
            }
        })) {
            Ok(w) => {
                *manager.watcher.lock().unwrap() = Some(w);
            }
            Err(e) => warn!("metadata watcher unavailable, relying on polling: {e}"),
        }

        // Existing workspaces resume watching on startup
        for ws in manager.store.workspaces() {
            manager.watch_workspace(&ws);
        }

        manager
    }

    /// Process-wide mutation lock for one repository URL.
    pub fn repo_lock(&self, repo_url: &str) -> Arc<AsyncMutex<()>> {
        self.repo_locks
            .lock()
            .unwrap()
            .entry(repo_url.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn base_path(&self, repo_url: &str) -> PathBuf {
        self.base_root.join(format!("{}.git", repo_slug(repo_url)))
    }

    fn query_path(&self, repo_url: &str) -> PathBuf {
        self.query_root.join(format!("{}.git", repo_slug(repo_url)))
    }

    fn watch_workspace(&self, ws: &Workspace) {
        let base = match self.scm {
            ScmMode::GitWorktree => Some(self.base_path(&ws.repo_url)),
            ScmMode::Git => None,
        };
        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            watcher.add_workspace(&ws.id, &ws.path, base.as_deref());
        }
    }

    // ─── Default branches ────────────────────────────────────────────────

    /// Clone any missing query repo and detect each repo's default branch.
    /// Per-repo failures are logged and skipped; the daemon still starts.
    pub async fn ensure_origin_queries(&self) {
        for (name, url) in &self.repos {
            let query = self.query_path(url);
            if !query.exists() {
                info!(repo = name, "cloning query repo");
                if let Err(e) = GitCli::clone_bare(url, &query).await {
                    warn!(repo = name, "query clone failed: {e}");
                    continue;
                }
            }
            if let Err(e) = self.branches.detect(url, &query).await {
                warn!(repo = name, "default-branch detection failed: {e}");
            }
        }
    }

    /// Periodic fetch of every query repo; re-detects default branches so
    /// a changed `origin/HEAD` propagates.
    pub async fn fetch_queries(&self) {
        for (name, url) in &self.repos {
            let query = self.query_path(url);
            if !query.exists() {
                continue;
            }
            if let Err(e) = GitCli::fetch(&query).await {
                debug!(repo = name, "query fetch failed: {e}");
                continue;
            }
            if let Err(e) = self.branches.detect(url, &query).await {
                warn!(repo = name, "default-branch re-detection failed: {e}");
            }
        }
    }

    /// Cached default branch, detecting lazily on a miss. An undetectable
    /// default branch is the caller's error, never a silent "main".
    pub async fn get_default_branch(&self, repo_url: &str) -> CoreResult<String> {
        if let Some(branch) = self.branches.get(repo_url) {
            return Ok(branch);
        }
        let query = self.query_path(repo_url);
        if !query.exists() {
            GitCli::clone_bare(repo_url, &query)
                .await
                .map_err(|e| CoreError::Unavailable(format!("query clone: {e}")))?;
        }
        self.branches.detect(repo_url, &query).await
    }

    /// Cache-only override used by tests and manual correction.
    pub fn set_default_branch(&self, repo_url: &str, branch: &str) {
        self.branches.set(repo_url, branch);
    }

    // ─── Creation ────────────────────────────────────────────────────────

    /// Create a workspace for `branch` off the repo's default branch (or
    /// `source_branch` when given and present on the remote). Serialized
    /// per repository; failure before registration unwinds the partial
    /// worktree.
    #[instrument(skip(self), fields(repo_url, branch))]
    pub async fn create_workspace(
        &self,
        repo_url: &str,
        branch: &str,
        source_branch: Option<&str>,
    ) -> CoreResult<Workspace> {
        validate_branch_name(branch)?;

        let lock = self.repo_lock(repo_url);
        let _guard = lock.lock().await;

        let id = workspace_id(branch);
        let path = self.workspace_root.join(&id);
        tokio::fs::create_dir_all(&self.workspace_root)
            .await
            .map_err(|e| CoreError::Internal(format!("workspace root: {e}")))?;

        match self.scm {
            ScmMode::GitWorktree => {
                self.create_worktree(repo_url, branch, source_branch, &path)
                    .await?;
            }
            ScmMode::Git => {
                self.create_full_clone(repo_url, branch, source_branch, &path)
                    .await?;
            }
        }

        let workspace = Workspace {
            id: id.clone(),
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            path: path.clone(),
            created_at: Utc::now(),
            remote_host_id: None,
            git_status: None,
        };

        if let Err(e) = self.store.add_workspace(workspace.clone()) {
            // Registration failed: take the checkout back down
            self.unwind_checkout(repo_url, &path).await;
            return Err(e);
        }

        self.watch_workspace(&workspace);
        (self.on_change)();
        info!(id, branch, "workspace created");
        Ok(workspace)
    }

    async fn create_worktree(
        &self,
        repo_url: &str,
        branch: &str,
        source_branch: Option<&str>,
        path: &Path,
    ) -> CoreResult<()> {
        let base = self.base_path(repo_url);
        if !base.exists() {
            GitCli::clone_bare(repo_url, &base)
                .await
                .map_err(|e| CoreError::Unavailable(format!("bare clone: {e}")))?;
        }
        self.store.add_base(WorktreeBase {
            repo_url: repo_url.to_string(),
            path: base.clone(),
        })?;

        let base_ref = self.resolve_base_ref(repo_url, &base, source_branch).await?;
        if let Err(e) = GitCli::fetch(&base).await {
            debug!("base fetch before worktree add failed: {e}");
        }

        if let Err(e) = GitCli::worktree_add(&base, path, branch, &base_ref).await {
            self.unwind_checkout(repo_url, path).await;
            return Err(CoreError::Internal(format!("worktree add: {e}")));
        }
        Ok(())
    }

    async fn create_full_clone(
        &self,
        repo_url: &str,
        branch: &str,
        source_branch: Option<&str>,
        path: &Path,
    ) -> CoreResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| CoreError::Internal("workspace path has no parent".to_string()))?;
        let target = path.to_string_lossy().into_owned();
        let clone = tokio::process::Command::new("git")
            .args(["clone", repo_url, &target])
            .current_dir(parent)
            .output()
            .await
            .map_err(|e| CoreError::Unavailable(format!("git: {e}")))?;
        if !clone.status.success() {
            return Err(CoreError::Internal(format!(
                "clone: {}",
                String::from_utf8_lossy(&clone.stderr).trim()
            )));
        }

        let base_ref = self.resolve_base_ref(repo_url, path, source_branch).await?;
        let checkout = tokio::process::Command::new("git")
            .args(["checkout", "-b", branch, &base_ref])
            .current_dir(path)
            .output()
            .await
            .map_err(|e| CoreError::Unavailable(format!("git: {e}")))?;
        if !checkout.status.success() {
            self.unwind_checkout(repo_url, path).await;
            return Err(CoreError::Internal(format!(
                "checkout: {}",
                String::from_utf8_lossy(&checkout.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn resolve_base_ref(
        &self,
        repo_url: &str,
        refs_repo: &Path,
        source_branch: Option<&str>,
    ) -> CoreResult<String> {
        if let Some(source) = source_branch {
            if GitCli::remote_ref_exists(refs_repo, source)
                .await
                .unwrap_or(false)
            {
                return Ok(format!("origin/{source}"));
            }
            debug!(source, "source branch absent on remote, using default");
        }
        let default = self.get_default_branch(repo_url).await?;
        Ok(format!("origin/{default}"))
    }

    async fn unwind_checkout(&self, repo_url: &str, path: &Path) {
        match self.scm {
            ScmMode::GitWorktree => {
                let base = self.base_path(repo_url);
                if let Err(e) = GitCli::worktree_remove(&base, path, true).await {
                    debug!("unwind worktree remove: {e}");
                }
                let _ = GitCli::worktree_prune(&base).await;
            }
            ScmMode::Git => {}
        }
        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                warn!(path = %path.display(), "unwind directory removal failed: {e}");
            }
        }
    }

    // ─── Disposal ────────────────────────────────────────────────────────

    /// Compute the git-safety report: safe iff no modifications, no
    /// untracked files, and nothing unpushed.
    pub async fn dispose_safety(&self, workspace_id: &str) -> CoreResult<SafetyReport> {
        let ws = self.store.workspace(workspace_id)?;

        let porcelain = GitCli::status_porcelain(&ws.path).await?;
        let modified = porcelain
            .lines()
            .filter(|l| !l.starts_with("??"))
            .count() as u32;
        let untracked = porcelain
            .lines()
            .filter(|l| l.starts_with("??"))
            .count() as u32;

        let unpushed = if GitCli::has_upstream(&ws.path).await {
            GitCli::commits_ahead_of_upstream(&ws.path)
                .await
                .unwrap_or(0)
        } else {
            0
        };

        Ok(SafetyReport {
            modified_files: modified,
            untracked_files: untracked,
            unpushed_commits: unpushed,
            safe: modified == 0 && untracked == 0 && unpushed == 0,
        })
    }

    /// Destroy a workspace. Unsafe workspaces require `force`.
    #[instrument(skip(self), fields(workspace_id, force))]
    pub async fn dispose_workspace(&self, workspace_id: &str, force: bool) -> CoreResult<()> {
        let ws = self.store.workspace(workspace_id)?;

        if !force {
            let report = self.dispose_safety(workspace_id).await?;
            if !report.safe {
                return Err(CoreError::Unsafe(format!(
                    "{} modified, {} untracked, {} unpushed; pass force to dispose",
                    report.modified_files, report.untracked_files, report.unpushed_commits
                )));
            }
        }

        let lock = self.repo_lock(&ws.repo_url);
        let _guard = lock.lock().await;

        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            watcher.remove_workspace(workspace_id);
        }

        match self.scm {
            ScmMode::GitWorktree => {
                let base = self.base_path(&ws.repo_url);
                if let Err(e) = GitCli::worktree_remove(&base, &ws.path, true).await {
                    warn!("worktree remove failed, deleting directory: {e}");
                    if ws.path.exists() {
                        tokio::fs::remove_dir_all(&ws.path)
                            .await
                            .map_err(|e| CoreError::Internal(e.to_string()))?;
                    }
                }
                let _ = GitCli::worktree_prune(&base).await;
            }
            ScmMode::Git => {
                if ws.path.exists() {
                    tokio::fs::remove_dir_all(&ws.path)
                        .await
                        .map_err(|e| CoreError::Internal(e.to_string()))?;
                }
            }
        }

        self.store.remove_workspace(workspace_id)?;
        (self.on_change)();
        info!(workspace_id, "workspace disposed");
        Ok(())
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Refresh one workspace's git status and broadcast. Background
    /// callers swallow errors here; the API path surfaces them.
    pub async fn refresh_status(&self, workspace_id: &str) {
        if let Err(e) = self.try_refresh_status(workspace_id).await {
            debug!(workspace_id, "status refresh failed: {e}");
        }
    }

    pub async fn try_refresh_status(&self, workspace_id: &str) -> CoreResult<()> {
        let ws = self.store.workspace(workspace_id)?;
        let default = self.get_default_branch(&ws.repo_url).await?;
        let git_status = status::git_status(&ws.path, &default).await?;

        self.store.update_workspace(workspace_id, |w| {
            w.git_status = Some(git_status);
        })?;
        self.store.save_batched();
        (self.on_change)();
        Ok(())
    }

    /// Full sweep used by the slow fallback poll.
    pub async fn refresh_all_statuses(&self) {
        for ws in self.store.workspaces() {
            self.refresh_status(&ws.id).await;
        }
    }
}

/// Directory-safe unique workspace ID derived from the branch name.
fn workspace_id(branch: &str) -> String {
    let slug = branch.replace('/', "-");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{slug}-{}", &suffix[..8])
}

/// Namespace GitHub repositories by `owner/repo` so forks with the same
/// name never collide; anything else falls back to a sanitized tail.
fn repo_slug(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");

    let tail = if let Some(rest) = trimmed.strip_prefix("git@") {
        // git@github.com:owner/repo
        rest.split_once(':').map(|(_, path)| path).unwrap_or(rest)
    } else if let Some(idx) = trimmed.find("://") {
        // https://github.com/owner/repo
        let after = &trimmed[idx + 3..];
        after.split_once('/').map(|(_, path)| path).unwrap_or(after)
    } else {
        trimmed
    };

    let mut parts: Vec<&str> = tail.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() > 2 {
        parts = parts.split_off(parts.len() - 2);
    }
    parts
        .join("/")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_slug_github_https() {
        assert_eq!(
            repo_slug("https://github.com/acme/widgets.git"),
            "acme/widgets"
        );
        assert_eq!(repo_slug("https://github.com/acme/widgets"), "acme/widgets");
    }

    #[test]
    fn test_repo_slug_github_ssh() {
        assert_eq!(repo_slug("git@github.com:acme/widgets.git"), "acme/widgets");
    }

    #[test]
    fn test_repo_slug_fork_distinct() {
        assert_ne!(
            repo_slug("https://github.com/acme/widgets"),
            repo_slug("https://github.com/fork-owner/widgets")
        );
    }

    #[test]
    fn test_repo_slug_deep_path_keeps_last_two() {
        assert_eq!(
            repo_slug("https://gitlab.example.com/group/sub/project.git"),
            "sub/project"
        );
    }

    #[test]
    fn test_workspace_id_unique_and_directory_safe() {
        let a = workspace_id("feature/add-auth");
        let b = workspace_id("feature/add-auth");
        assert_ne!(a, b);
        assert!(a.starts_with("feature-add-auth-"));
        assert!(!a.contains('/'));
    }
}
