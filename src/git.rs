//! Git CLI wrapper for bare-clone, worktree, status, and rebase operations.
//!
//! Uses the git CLI directly (rather than libgit2) so worktrees, hooks,
//! and host git configuration behave exactly as they would for the user.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Clone gets the long leash; everything else is a quick local operation
/// or a fetch against an already-warm remote.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Low-level git command wrapper
pub struct GitCli;

impl GitCli {
    /// Execute a git command and return stdout
    async fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
        Self::run_git_timeout(args, cwd, FETCH_TIMEOUT).await
    }

    async fn run_git_timeout(args: &[&str], cwd: &Path, timeout: Duration) -> Result<String> {
        debug!(?args, ?cwd, "Running git command");

        let fut = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| anyhow!("git {} timed out after {:?}", args.first().unwrap_or(&""), timeout))?
            .context("Failed to execute git command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute a git command, returning Ok(()) on success
    async fn run_git_silent(args: &[&str], cwd: &Path) -> Result<()> {
        Self::run_git(args, cwd).await?;
        Ok(())
    }

    // ─── Clones & worktrees ──────────────────────────────────────────────

    /// Bare-clone `url` into `target` and set up remote-tracking refs.
    /// A plain bare clone carries no `refs/remotes/origin/*`, but both
    /// worktree creation and ahead/behind computation address branches as
    /// `origin/<name>`, so the full fetch refspec is configured and
    /// `origin/HEAD` resolved before the clone is considered ready.
    #[instrument(skip_all, fields(url, target = %target.display()))]
    pub async fn clone_bare(url: &str, target: &Path) -> Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("clone target has no parent: {}", target.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create clone parent directory")?;
        let target_str = target.to_string_lossy();
        Self::run_git_timeout(&["clone", "--bare", url, &target_str], parent, CLONE_TIMEOUT)
            .await?;

        Self::run_git_silent(
            &[
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
            target,
        )
        .await?;
        Self::run_git_timeout(&["fetch", "origin"], target, CLONE_TIMEOUT).await?;
        if let Err(e) = Self::run_git(&["remote", "set-head", "origin", "--auto"], target).await {
            // Remote without a HEAD; the fallback candidate chain covers it
            debug!("remote set-head failed: {e}");
        }
        Ok(())
    }

    /// Add a worktree on a new branch starting from `base_ref`
    #[instrument(skip_all, fields(repo = %repo.display(), worktree = %worktree.display(), branch))]
    pub async fn worktree_add(
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base_ref: &str,
    ) -> Result<()> {
        let worktree_str = worktree.to_string_lossy();
        Self::run_git_silent(
            &["worktree", "add", "-b", branch, &worktree_str, base_ref],
            repo,
        )
        .await
    }

    #[instrument(skip_all, fields(repo = %repo.display(), worktree = %worktree.display(), force))]
    pub async fn worktree_remove(repo: &Path, worktree: &Path, force: bool) -> Result<()> {
        let worktree_str = worktree.to_string_lossy();
        if force {
            Self::run_git_silent(&["worktree", "remove", "--force", &worktree_str], repo).await
        } else {
            Self::run_git_silent(&["worktree", "remove", &worktree_str], repo).await
        }
    }

    pub async fn worktree_prune(repo: &Path) -> Result<()> {
        Self::run_git_silent(&["worktree", "prune"], repo).await
    }

    // ─── Refs & branches ─────────────────────────────────────────────────

    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn fetch(path: &Path) -> Result<()> {
        Self::run_git_silent(&["fetch", "origin"], path).await
    }

    pub async fn symbolic_ref(path: &Path, name: &str) -> Result<String> {
        Self::run_git(&["symbolic-ref", name], path).await
    }

    /// True when `refs/remotes/origin/<branch>` exists
    pub async fn remote_ref_exists(path: &Path, branch: &str) -> Result<bool> {
        let full = format!("refs/remotes/origin/{branch}");
        match Self::run_git(&["show-ref", "--verify", "--quiet", &full], path).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    pub async fn rev_parse(path: &Path, rev: &str) -> Result<String> {
        Self::run_git(&["rev-parse", rev], path).await
    }

    /// Subject line of a commit
    pub async fn commit_subject(path: &Path, rev: &str) -> Result<String> {
        Self::run_git(&["log", "-1", "--format=%s", rev], path).await
    }

    /// True when the checked-out branch has an upstream configured
    pub async fn has_upstream(path: &Path) -> bool {
        Self::run_git(&["rev-parse", "--abbrev-ref", "@{u}"], path)
            .await
            .is_ok()
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub async fn status_porcelain(path: &Path) -> Result<String> {
        Self::run_git(&["status", "--porcelain"], path).await
    }

    /// (ahead, behind) of HEAD relative to `upstream`
    pub async fn ahead_behind(path: &Path, upstream: &str) -> Result<(u32, u32)> {
        let range = format!("HEAD...{upstream}");
        let out = Self::run_git(&["rev-list", "--left-right", "--count", &range], path).await?;
        let mut parts = out.split_whitespace();
        let ahead = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("unparseable rev-list output: {out}"))?;
        let behind = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("unparseable rev-list output: {out}"))?;
        Ok((ahead, behind))
    }

    /// Commits in `HEAD..<upstream>` oldest first
    pub async fn commits_behind(path: &Path, upstream: &str) -> Result<Vec<String>> {
        let range = format!("HEAD..{upstream}");
        let out = Self::run_git(&["rev-list", "--reverse", &range], path).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Commits ahead of the configured upstream (0 when none is set)
    pub async fn commits_ahead_of_upstream(path: &Path) -> Result<u32> {
        let out = Self::run_git(&["rev-list", "--count", "@{u}..HEAD"], path).await?;
        out.parse().context("unparseable rev-list count")
    }

    /// `git diff --numstat HEAD` lines: (added, removed, path), with None
    /// counts for binary files
    pub async fn diff_numstat(path: &Path) -> Result<Vec<(Option<u64>, Option<u64>, String)>> {
        let out = Self::run_git(&["diff", "--numstat", "HEAD"], path).await?;
        let mut rows = Vec::new();
        for line in out.lines() {
            let mut parts = line.splitn(3, '\t');
            let added = parts.next().map(|s| s.parse().ok()).unwrap_or(None);
            let removed = parts.next().map(|s| s.parse().ok()).unwrap_or(None);
            if let Some(file) = parts.next() {
                rows.push((added, removed, file.to_string()));
            }
        }
        Ok(rows)
    }

    /// Untracked files honoring .gitignore
    pub async fn untracked_files(path: &Path) -> Result<Vec<String>> {
        let out = Self::run_git(&["ls-files", "--others", "--exclude-standard"], path).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Unmerged (conflicted) paths during a rebase
    pub async fn unmerged_files(path: &Path) -> Result<Vec<String>> {
        let out = Self::run_git(&["diff", "--name-only", "--diff-filter=U"], path).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    pub async fn add_all(path: &Path) -> Result<()> {
        Self::run_git_silent(&["add", "-A"], path).await
    }

    pub async fn add_paths(path: &Path, files: &[String]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend(files.iter().map(String::as_str));
        Self::run_git_silent(&args, path).await
    }

    pub async fn commit(path: &Path, message: &str) -> Result<()> {
        Self::run_git_silent(&["commit", "-m", message], path).await
    }

    /// `git reset --mixed HEAD~1`
    pub async fn reset_mixed_head1(path: &Path) -> Result<()> {
        Self::run_git_silent(&["reset", "--mixed", "HEAD~1"], path).await
    }

    // ─── Rebase ──────────────────────────────────────────────────────────

    pub async fn rebase(path: &Path, onto: &str) -> Result<()> {
        // Conflicts exit non-zero; callers inspect rebase_in_progress
        match Self::run_git(&["rebase", onto], path).await {
            Ok(_) => Ok(()),
            Err(e) if Self::rebase_in_progress(path) => {
                debug!("rebase paused on conflict: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn rebase_continue(path: &Path) -> Result<()> {
        match Self::run_git(&["rebase", "--continue"], path)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if Self::rebase_in_progress(path) => {
                debug!("rebase continue paused again: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn rebase_abort(path: &Path) -> Result<()> {
        Self::run_git_silent(&["rebase", "--abort"], path).await
    }

    /// A paused rebase leaves `rebase-merge/` or `rebase-apply/` inside
    /// the resolved git directory.
    pub fn rebase_in_progress(worktree: &Path) -> bool {
        match resolve_git_dir(worktree) {
            Some(git_dir) => {
                git_dir.join("rebase-merge").is_dir() || git_dir.join("rebase-apply").is_dir()
            }
            None => false,
        }
    }
}

/// Resolve a workspace's git directory: `.git` is either the directory
/// itself or a file containing `gitdir: <path>` (the worktree case).
pub fn resolve_git_dir(worktree: &Path) -> Option<std::path::PathBuf> {
    let dot_git = worktree.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    let contents = std::fs::read_to_string(&dot_git).ok()?;
    let target = contents.strip_prefix("gitdir:")?.trim();
    let resolved = if Path::new(target).is_absolute() {
        std::path::PathBuf::from(target)
    } else {
        worktree.join(target)
    };
    Some(resolved)
}
