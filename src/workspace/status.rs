//! Workspace git-status computation.
//!
//! Fetches, then derives dirtiness, ahead/behind against the default
//! branch, and line counts for tracked and untracked changes. Untracked
//! files are read at most 1 MiB each to bound I/O; binary files count
//! toward files-changed only.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::git::GitCli;
use crate::state::GitStatus;

/// Per-file read cap for untracked line counting.
pub const UNTRACKED_READ_CAP: u64 = 1024 * 1024;

/// Compute the full status tuple for a workspace directory.
/// `default_branch` is the repo's detected default; callers obtain it
/// from the cache (an absent entry is their error to surface).
pub async fn git_status(dir: &Path, default_branch: &str) -> CoreResult<GitStatus> {
    if let Err(e) = GitCli::fetch(dir).await {
        // Offline is fine; counts fall back to the last-fetched refs
        debug!(dir = %dir.display(), "fetch before status failed: {e}");
    }

    let porcelain = GitCli::status_porcelain(dir).await?;
    let dirty = !porcelain.is_empty();

    let upstream = format!("origin/{default_branch}");
    let (ahead, behind) = match GitCli::ahead_behind(dir, &upstream).await {
        Ok(counts) => counts,
        Err(e) => {
            debug!(dir = %dir.display(), upstream, "ahead/behind unavailable: {e}");
            (0, 0)
        }
    };

    let mut lines_added: u64 = 0;
    let mut lines_removed: u64 = 0;
    let mut files_changed: u32 = 0;

    for (added, removed, _file) in GitCli::diff_numstat(dir).await? {
        files_changed += 1;
        // Binary files report no counts
        lines_added += added.unwrap_or(0);
        lines_removed += removed.unwrap_or(0);
    }

    for file in GitCli::untracked_files(dir).await? {
        files_changed += 1;
        match count_lines_capped(&dir.join(&file), UNTRACKED_READ_CAP).await {
            Ok(Some(lines)) => lines_added += lines,
            Ok(None) => {} // binary
            Err(e) => warn!(file, "counting untracked file failed: {e}"),
        }
    }

    Ok(GitStatus {
        dirty,
        ahead,
        behind,
        lines_added,
        lines_removed,
        files_changed,
    })
}

/// Count newline-terminated lines in at most the first `cap` bytes.
/// Returns None for files that look binary (NUL byte in the sample).
async fn count_lines_capped(path: &Path, cap: u64) -> std::io::Result<Option<u64>> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = file.take(cap);
    let mut buf = vec![0u8; 64 * 1024];
    let mut lines: u64 = 0;
    let mut saw_any = false;
    let mut ends_with_newline = false;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if chunk.contains(&0) {
            return Ok(None);
        }
        saw_any = true;
        lines += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        ends_with_newline = chunk.last() == Some(&b'\n');
    }

    if saw_any && !ends_with_newline {
        lines += 1;
    }
    Ok(Some(lines))
}
