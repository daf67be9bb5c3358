//! Integration tests for the git wrapper, default-branch detection, and
//! the workspace manager, against real git repositories in temp dirs.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use schmux::config::Config;
use schmux::error::CoreError;
use schmux::git::{resolve_git_dir, GitCli};
use schmux::state::Store;
use schmux::workspace::WorkspaceManager;

/// Run git with a fixed identity so commits work on bare CI machines.
fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args([
            "-c",
            "user.name=schmux-test",
            "-c",
            "user.email=test@schmux.invalid",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git runs");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// Build an origin repository whose default branch is `branch`, with one
/// committed file. Returns the path usable as a clone URL.
fn make_origin(root: &Path, branch: &str) -> PathBuf {
    let src = root.join("origin-src");
    std::fs::create_dir_all(&src).unwrap();
    git(&src, &["init", "-q"]);
    git(&src, &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")]);
    std::fs::write(src.join("README.md"), "# widgets\n").unwrap();
    git(&src, &["add", "."]);
    git(&src, &["commit", "-q", "-m", "initial"]);

    let bare = root.join("origin.git");
    git(root, &[
        "clone",
        "--bare",
        "-q",
        src.to_str().unwrap(),
        bare.to_str().unwrap(),
    ]);
    bare
}

fn test_manager(root: &Path, repo_url: &str) -> (Arc<WorkspaceManager>, Arc<Store>) {
    let mut config = Config::default();
    config.workspace_path = root.join("workspaces").to_string_lossy().into_owned();
    config.base_repos_path = root.join("bases").to_string_lossy().into_owned();
    config.query_repos_path = root.join("queries").to_string_lossy().into_owned();
    config.logs_path = root.join("logs").to_string_lossy().into_owned();
    config.repos = vec![schmux::config::RepoConfig {
        name: "widgets".to_string(),
        url: repo_url.to_string(),
    }];

    let store = Store::load(root.join("state.json")).unwrap();
    let manager = WorkspaceManager::new(&config, store.clone(), Arc::new(|| {}));
    (manager, store)
}

#[tokio::test]
async fn test_default_branch_detected_from_origin_head() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "develop");
    let url = origin.to_string_lossy().into_owned();
    let (manager, _store) = test_manager(tmp.path(), &url);

    manager.ensure_origin_queries().await;

    let first = manager.get_default_branch(&url).await.unwrap();
    assert_eq!(first, "develop");
    // Second call answers from the cache and agrees
    let second = manager.get_default_branch(&url).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_create_workspace_produces_worktree_on_shared_base() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "main");
    let url = origin.to_string_lossy().into_owned();
    let (manager, store) = test_manager(tmp.path(), &url);

    let ws = manager
        .create_workspace(&url, "fix-auth", None)
        .await
        .unwrap();

    assert!(ws.path.join("README.md").exists());
    assert_eq!(ws.branch, "fix-auth");

    // Worktree's .git file resolves into the registered shared base
    let git_dir = resolve_git_dir(&ws.path).expect("worktree git dir");
    let base = store.base_for(&url).expect("base registered");
    assert!(git_dir.starts_with(&base.path));

    // Persisted
    assert_eq!(store.workspaces().len(), 1);
}

#[tokio::test]
async fn test_create_workspace_rejects_bad_branch_names() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "main");
    let url = origin.to_string_lossy().into_owned();
    let (manager, store) = test_manager(tmp.path(), &url);

    for bad in ["Fix-Auth", "a..b", "-lead", ""] {
        let err = manager.create_workspace(&url, bad, None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)), "{bad}");
    }
    assert!(store.workspaces().is_empty());
}

#[tokio::test]
async fn test_dispose_safety_and_force() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "main");
    let url = origin.to_string_lossy().into_owned();
    let (manager, store) = test_manager(tmp.path(), &url);

    let ws = manager.create_workspace(&url, "scratch", None).await.unwrap();

    // Clean workspace is safe to dispose
    let report = manager.dispose_safety(&ws.id).await.unwrap();
    assert!(report.safe);

    // An untracked file makes it unsafe
    std::fs::write(ws.path.join("notes.txt"), "wip\n").unwrap();
    let report = manager.dispose_safety(&ws.id).await.unwrap();
    assert!(!report.safe);
    assert_eq!(report.untracked_files, 1);
    assert_eq!(report.modified_files, 0);

    let err = manager.dispose_workspace(&ws.id, false).await.unwrap_err();
    assert!(matches!(err, CoreError::Unsafe(_)));
    assert!(ws.path.exists());

    manager.dispose_workspace(&ws.id, true).await.unwrap();
    assert!(!ws.path.exists());
    assert!(store.workspaces().is_empty());
}

#[tokio::test]
async fn test_git_status_counts_changes() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "main");
    let url = origin.to_string_lossy().into_owned();
    let (manager, store) = test_manager(tmp.path(), &url);

    let ws = manager.create_workspace(&url, "counting", None).await.unwrap();

    // One tracked modification, one untracked file
    std::fs::write(ws.path.join("README.md"), "# widgets\nmore\nlines\n").unwrap();
    std::fs::write(ws.path.join("new.txt"), "a\nb\n").unwrap();

    manager.try_refresh_status(&ws.id).await.unwrap();
    let status = store.workspace(&ws.id).unwrap().git_status.unwrap();

    assert!(status.dirty);
    assert_eq!(status.files_changed, 2);
    assert_eq!(status.lines_added, 4); // 2 in README + 2 untracked
    assert_eq!(status.behind, 0);
}

#[tokio::test]
async fn test_status_sees_upstream_advance() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "main");
    let url = origin.to_string_lossy().into_owned();
    let (manager, store) = test_manager(tmp.path(), &url);

    let ws = manager.create_workspace(&url, "behind-check", None).await.unwrap();

    // Advance origin/main from a second clone
    let adv = tmp.path().join("adv");
    git(tmp.path(), &["clone", "-q", &url, adv.to_str().unwrap()]);
    std::fs::write(adv.join("upstream.txt"), "new\n").unwrap();
    git(&adv, &["add", "."]);
    git(&adv, &["commit", "-q", "-m", "upstream change"]);
    git(&adv, &["push", "-q", "origin", "main"]);

    manager.try_refresh_status(&ws.id).await.unwrap();
    let status = store.workspace(&ws.id).unwrap().git_status.unwrap();
    assert_eq!(status.behind, 1);
    assert_eq!(status.ahead, 0);
}

#[tokio::test]
async fn test_untracked_large_file_capped() {
    let tmp = TempDir::new().unwrap();
    let origin = make_origin(tmp.path(), "main");
    let url = origin.to_string_lossy().into_owned();
    let (manager, store) = test_manager(tmp.path(), &url);

    let ws = manager.create_workspace(&url, "bigfile", None).await.unwrap();

    // 2 MiB of 16-byte lines; only the first 1 MiB may count
    let line = "fifteen chars..\n";
    let content = line.repeat(2 * 1024 * 1024 / line.len());
    std::fs::write(ws.path.join("big.txt"), &content).unwrap();

    manager.try_refresh_status(&ws.id).await.unwrap();
    let status = store.workspace(&ws.id).unwrap().git_status.unwrap();
    assert_eq!(status.lines_added, (1024 * 1024 / line.len()) as u64);
    assert_eq!(status.files_changed, 1);
}

#[tokio::test]
async fn test_rebase_in_progress_detection() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("plain");
    std::fs::create_dir_all(&src).unwrap();
    git(&src, &["init", "-q", "-b", "main"]);
    std::fs::write(src.join("f.txt"), "x\n").unwrap();
    git(&src, &["add", "."]);
    git(&src, &["commit", "-q", "-m", "one"]);

    assert!(!GitCli::rebase_in_progress(&src));
}
