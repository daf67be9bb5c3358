//! End-to-end tests for the rebase-with-LLM-conflict-resolution worker,
//! against real git repositories and a canned model.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use schmux::config::Config;
use schmux::hub::Hub;
use schmux::llm::MockLlm;
use schmux::ops::resolve::{start_resolve, ResolveDeps};
use schmux::ops::{OpStatus, OperationRegistry, ResolveOperation};
use schmux::state::{Store, Workspace};
use schmux::workspace::WorkspaceManager;

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

fn git_out(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

struct Fixture {
    _tmp: TempDir,
    workspace_path: PathBuf,
    workspace_id: String,
    deps: Arc<ResolveDeps>,
    llm: Arc<MockLlm>,
    registry: Arc<OperationRegistry>,
}

/// Workspace one commit behind origin/main; that commit touches a file
/// the local branch also changed, so the rebase pauses on a conflict.
fn conflicted_fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    // Origin with one base commit on main
    let src = root.join("origin-src");
    std::fs::create_dir_all(&src).unwrap();
    git(&src, &["init", "-q", "-b", "main"]);
    std::fs::write(src.join("a.go"), "package main\n\nvar greeting = \"base\"\n").unwrap();
    git(&src, &["add", "."]);
    git(&src, &["commit", "-q", "-m", "initial"]);
    let origin = root.join("origin.git");
    git(root, &[
        "clone",
        "--bare",
        "-q",
        src.to_str().unwrap(),
        origin.to_str().unwrap(),
    ]);
    let url = origin.to_string_lossy().into_owned();

    // The workspace: a clone on a feature branch with a conflicting commit
    let ws_path = root.join("workspaces").join("feature-1");
    std::fs::create_dir_all(ws_path.parent().unwrap()).unwrap();
    git(root, &["clone", "-q", &url, ws_path.to_str().unwrap()]);
    // The worker commits and rebases through its own git invocations,
    // which must not depend on the machine's global config
    git(&ws_path, &["config", "user.name", "schmux-test"]);
    git(&ws_path, &["config", "user.email", "test@schmux.invalid"]);
    git(&ws_path, &["config", "commit.gpgsign", "false"]);
    git(&ws_path, &["config", "core.editor", "true"]);
    git(&ws_path, &["checkout", "-q", "-b", "feature"]);
    std::fs::write(
        ws_path.join("a.go"),
        "package main\n\nvar greeting = \"local\"\n",
    )
    .unwrap();
    git(&ws_path, &["add", "."]);
    git(&ws_path, &["commit", "-q", "-m", "use local greeting"]);

    // Advance origin/main with a conflicting change
    let adv = root.join("adv");
    git(root, &["clone", "-q", &url, adv.to_str().unwrap()]);
    std::fs::write(
        adv.join("a.go"),
        "package main\n\nvar greeting = \"upstream\"\n",
    )
    .unwrap();
    git(&adv, &["add", "."]);
    git(&adv, &["commit", "-q", "-m", "use upstream greeting"]);
    git(&adv, &["push", "-q", "origin", "main"]);

    // Core wiring around the fixture
    let mut config = Config::default();
    config.workspace_path = root.join("workspaces").to_string_lossy().into_owned();
    config.base_repos_path = root.join("bases").to_string_lossy().into_owned();
    config.query_repos_path = root.join("queries").to_string_lossy().into_owned();
    config.logs_path = root.join("logs").to_string_lossy().into_owned();

    let store = Store::load(root.join("state.json")).unwrap();
    let workspace_id = "feature-1".to_string();
    store
        .add_workspace(Workspace {
            id: workspace_id.clone(),
            repo_url: url.clone(),
            branch: "feature".to_string(),
            path: ws_path.clone(),
            created_at: Utc::now(),
            remote_host_id: None,
            git_status: None,
        })
        .unwrap();

    let hub = Hub::new(store.clone());
    let manager = WorkspaceManager::new(&config, store, Arc::new(|| {}));
    manager.set_default_branch(&url, "main");
    let registry = OperationRegistry::new(hub);
    let llm = Arc::new(MockLlm::new());

    let deps = Arc::new(ResolveDeps {
        manager,
        registry: registry.clone(),
        llm: llm.clone(),
        llm_target: "resolver".to_string(),
        llm_timeout: Duration::from_secs(5),
    });

    Fixture {
        _tmp: tmp,
        workspace_path: ws_path,
        workspace_id,
        deps,
        llm,
        registry,
    }
}

async fn wait_terminal(registry: &OperationRegistry, workspace_id: &str) -> ResolveOperation {
    for _ in 0..300 {
        if let Some(op) = registry.get(workspace_id) {
            if op.status != OpStatus::InProgress {
                return op;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("operation never reached a terminal state");
}

fn actions(op: &ResolveOperation) -> Vec<&'static str> {
    op.steps.iter().map(|s| s.detail.action()).collect()
}

#[tokio::test]
async fn test_happy_path_resolves_conflict_and_completes() {
    let fx = conflicted_fixture();

    fx.llm.push_response(Ok(serde_json::json!({
        "all_resolved": true,
        "confidence": "high",
        "summary": "kept the upstream greeting and the local structure",
        "files": {
            "a.go": "package main\n\nvar greeting = \"merged\"\n"
        }
    })
    .to_string()));

    start_resolve(fx.deps.clone(), &fx.workspace_id).unwrap();
    let op = wait_terminal(&fx.registry, &fx.workspace_id).await;

    assert_eq!(op.status, OpStatus::Done);
    assert_eq!(
        actions(&op),
        vec![
            "check_behind",
            "wip_commit",
            "rebase_start",
            "conflict_detected",
            "llm_call",
            "write_files",
            "rebase_continue",
            "wip_unwind",
        ]
    );
    assert_eq!(op.resolutions.len(), 1);
    assert_eq!(op.resolutions[0].confidence, "high");
    assert_eq!(op.resolutions[0].files, vec!["a.go".to_string()]);

    // Tree clean, both commits present, resolved contents on disk
    let contents = std::fs::read_to_string(fx.workspace_path.join("a.go")).unwrap();
    assert!(contents.contains("merged"));
    assert!(!contents.contains("<<<<<<<"));
    let log = git_out(&fx.workspace_path, &["log", "--format=%s"]);
    assert!(log.contains("use local greeting"));
    assert!(log.contains("use upstream greeting"));
    let porcelain = git_out(&fx.workspace_path, &["status", "--porcelain"]);
    assert!(porcelain.is_empty(), "tree dirty after resolve: {porcelain}");

    // The prompt carried the conflicted file, markers included
    let prompts = fx.llm.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("a.go"));
    assert!(prompts[0].contains("<<<<<<<"));
}

#[tokio::test]
async fn test_low_confidence_aborts_and_restores_tree() {
    let fx = conflicted_fixture();

    let pre_head = git_out(&fx.workspace_path, &["rev-parse", "HEAD"]);
    let pre_status = git_out(&fx.workspace_path, &["status", "--porcelain"]);

    fx.llm.push_response(Ok(serde_json::json!({
        "all_resolved": true,
        "confidence": "medium",
        "summary": "not sure which greeting wins",
        "files": {"a.go": "package main\n"}
    })
    .to_string()));

    start_resolve(fx.deps.clone(), &fx.workspace_id).unwrap();
    let op = wait_terminal(&fx.registry, &fx.workspace_id).await;

    assert_eq!(op.status, OpStatus::Failed);
    let steps = actions(&op);
    assert_eq!(*steps.last().unwrap(), "abort");
    match &op.steps.last().unwrap().detail {
        schmux::ops::StepDetail::Abort { reason } => {
            assert!(reason.contains("low confidence"));
            assert!(reason.contains("not sure which greeting wins"));
        }
        other => panic!("unexpected final step: {other:?}"),
    }

    // Workspace exactly as before the operation
    assert_eq!(git_out(&fx.workspace_path, &["rev-parse", "HEAD"]), pre_head);
    assert_eq!(
        git_out(&fx.workspace_path, &["status", "--porcelain"]),
        pre_status
    );
    let contents = std::fs::read_to_string(fx.workspace_path.join("a.go")).unwrap();
    assert!(contents.contains("local"));
}

#[tokio::test]
async fn test_non_json_reply_fails_operation() {
    let fx = conflicted_fixture();

    fx.llm
        .push_response(Ok("Sorry, I can't help with that.".to_string()));

    start_resolve(fx.deps.clone(), &fx.workspace_id).unwrap();
    let op = wait_terminal(&fx.registry, &fx.workspace_id).await;

    assert_eq!(op.status, OpStatus::Failed);
    let porcelain = git_out(&fx.workspace_path, &["status", "--porcelain"]);
    assert!(porcelain.is_empty());
    assert!(!schmux::git::GitCli::rebase_in_progress(&fx.workspace_path));
}

#[tokio::test]
async fn test_second_start_conflicts_while_running() {
    let fx = conflicted_fixture();
    // No canned response: the llm_call step blocks briefly then fails,
    // which is plenty of time to observe the running-state conflict
    start_resolve(fx.deps.clone(), &fx.workspace_id).unwrap();

    let err = start_resolve(fx.deps.clone(), &fx.workspace_id).unwrap_err();
    assert!(matches!(err, schmux::error::CoreError::Conflict(_)));

    let op = wait_terminal(&fx.registry, &fx.workspace_id).await;
    assert_eq!(op.status, OpStatus::Failed);
}

#[tokio::test]
async fn test_dirty_tree_gets_wip_commit_and_unwind() {
    let fx = conflicted_fixture();

    // Uncommitted local edit to an unrelated file
    std::fs::write(fx.workspace_path.join("notes.md"), "remember this\n").unwrap();

    fx.llm.push_response(Ok(serde_json::json!({
        "all_resolved": true,
        "confidence": "high",
        "summary": "merged",
        "files": {"a.go": "package main\n\nvar greeting = \"merged\"\n"}
    })
    .to_string()));

    start_resolve(fx.deps.clone(), &fx.workspace_id).unwrap();
    let op = wait_terminal(&fx.registry, &fx.workspace_id).await;

    assert_eq!(op.status, OpStatus::Done);
    match &op.steps[1].detail {
        schmux::ops::StepDetail::WipCommit { created } => assert!(created),
        other => panic!("unexpected step: {other:?}"),
    }
    match &op.steps.last().unwrap().detail {
        schmux::ops::StepDetail::WipUnwind { unwound } => assert!(unwound),
        other => panic!("unexpected step: {other:?}"),
    }

    // The WIP commit is unwound: the edit is back to uncommitted, and no
    // WIP commit remains in the log
    let porcelain = git_out(&fx.workspace_path, &["status", "--porcelain"]);
    assert!(porcelain.contains("notes.md"));
    let log = git_out(&fx.workspace_path, &["log", "--format=%s"]);
    assert!(!log.contains("WIP:"));
}
