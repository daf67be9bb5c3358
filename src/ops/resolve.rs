//! Rebase-with-LLM-conflict-resolution worker.
//!
//! Rebases the workspace's branch onto the repository's default branch;
//! when the replay pauses on conflicts, a one-shot LLM produces resolved
//! file contents which are applied and the rebase continued. Anything
//! less than a high-confidence full resolution aborts the rebase and
//! unwinds the WIP commit — conflict markers are never committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::git::GitCli;
use crate::llm::OneShotLlm;
use crate::state::Workspace;
use crate::workspace::WorkspaceManager;

use super::{OpStatus, OperationRegistry, Resolution, StepDetail, StepStatus};

/// Contract for the one-shot LLM's reply.
#[derive(Debug, Deserialize)]
struct LlmReply {
    all_resolved: bool,
    confidence: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    files: HashMap<String, String>,
}

pub struct ResolveDeps {
    pub manager: Arc<WorkspaceManager>,
    pub registry: Arc<OperationRegistry>,
    pub llm: Arc<dyn OneShotLlm>,
    pub llm_target: String,
    pub llm_timeout: Duration,
}

/// Entry point behind the POST endpoint: claims the per-workspace slot,
/// launches the background worker, and returns immediately (the caller
/// answers 202). A running operation yields Conflict for the 409 path.
pub fn start_resolve(deps: Arc<ResolveDeps>, workspace_id: &str) -> CoreResult<()> {
    let workspace = deps.manager.store().workspace(workspace_id)?;
    deps.registry.begin(workspace_id)?;

    let registry = deps.registry.clone();
    let ws_id = workspace_id.to_string();
    tokio::spawn(async move {
        // A panicking worker must not leave the workspace locked forever
        let outcome = std::panic::AssertUnwindSafe(run_worker(deps, workspace))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            warn!(workspace = ws_id, "resolve worker panicked");
            registry.append_step(
                &ws_id,
                StepDetail::Abort {
                    reason: "internal error".to_string(),
                },
                StepStatus::Failed,
                "internal error",
            );
            registry.finish(&ws_id, OpStatus::Failed);
        }
    });
    Ok(())
}

/// On startup, a rebase directory with no in-memory operation is a
/// leftover from a crashed worker; abort it so the workspace is usable.
pub async fn abort_orphaned_rebases(manager: &WorkspaceManager, registry: &OperationRegistry) {
    for ws in manager.store().workspaces() {
        if GitCli::rebase_in_progress(&ws.path) && !registry.in_progress(&ws.id) {
            warn!(
                workspace = ws.id,
                "aborting orphaned rebase left by a previous run"
            );
            if let Err(e) = GitCli::rebase_abort(&ws.path).await {
                warn!(workspace = ws.id, "orphaned rebase abort failed: {e}");
            }
        }
    }
}

async fn run_worker(deps: Arc<ResolveDeps>, workspace: Workspace) {
    // Serializes against every other mutating git operation on this repo
    let lock = deps.manager.repo_lock(&workspace.repo_url);
    let _guard = lock.lock().await;

    let ws_id = workspace.id.clone();
    match run_steps(&deps, &workspace).await {
        Ok(()) => {}
        Err(e) => {
            warn!(workspace = ws_id, "resolve failed: {e}");
            deps.registry.finish(&ws_id, OpStatus::Failed);
        }
    }

    drop(_guard);
    deps.manager.refresh_status(&ws_id).await;
}

async fn run_steps(deps: &ResolveDeps, workspace: &Workspace) -> CoreResult<()> {
    let registry = &deps.registry;
    let ws_id = &workspace.id;
    let dir = &workspace.path;

    // 1. check_behind
    let default = deps.manager.get_default_branch(&workspace.repo_url).await?;
    let upstream = format!("origin/{default}");
    if let Err(e) = GitCli::fetch(dir).await {
        warn!("fetch before resolve failed: {e}");
    }
    let behind = GitCli::commits_behind(dir, &upstream).await?;
    let target = behind.first().cloned();
    registry.append_step(
        ws_id,
        StepDetail::CheckBehind {
            behind: behind.len() as u32,
            target_commit: target.clone(),
        },
        StepStatus::Done,
        format!("{} commit(s) behind {upstream}", behind.len()),
    );
    let Some(target) = target else {
        registry.finish(ws_id, OpStatus::Done);
        return Ok(());
    };

    // 2. wip_commit
    let dirty = !GitCli::status_porcelain(dir).await?.is_empty();
    if dirty {
        GitCli::add_all(dir).await?;
        GitCli::commit(dir, &format!("WIP: {}", chrono::Utc::now().to_rfc3339())).await?;
    }
    let wip_created = dirty;
    registry.append_step(
        ws_id,
        StepDetail::WipCommit { created: wip_created },
        StepStatus::Done,
        if wip_created {
            "local changes preserved in a WIP commit"
        } else {
            "working tree clean"
        },
    );

    // 3. rebase_start
    GitCli::rebase(dir, &target).await?;
    registry.append_step(
        ws_id,
        StepDetail::RebaseStart {
            onto: target.clone(),
        },
        StepStatus::Done,
        format!("rebasing onto {}", &target[..target.len().min(12)]),
    );

    // 4. conflict loop
    let mut empty_continues = 0u32;
    while GitCli::rebase_in_progress(dir) {
        let files = GitCli::unmerged_files(dir).await?;

        if files.is_empty() {
            // Auto-resolved pause; continue drives the replay forward
            empty_continues += 1;
            if empty_continues > 16 {
                return abort_and_fail(deps, workspace, wip_created, "rebase made no progress")
                    .await;
            }
            if GitCli::rebase_continue(dir).await.is_err() {
                return abort_and_fail(
                    deps,
                    workspace,
                    wip_created,
                    "rebase --continue failed with nothing unmerged",
                )
                .await;
            }
            continue;
        }
        empty_continues = 0;

        // 4.ii conflict_detected
        let local_commit = GitCli::rev_parse(dir, "REBASE_HEAD")
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let local_message = GitCli::commit_subject(dir, "REBASE_HEAD")
            .await
            .unwrap_or_default();
        registry.append_step(
            ws_id,
            StepDetail::ConflictDetected {
                local_commit: local_commit.clone(),
                local_message: local_message.clone(),
                files: files.clone(),
            },
            StepStatus::Done,
            format!("conflicts in {} file(s)", files.len()),
        );

        // 4.iii llm_call
        let llm_idx = registry.append_step(
            ws_id,
            StepDetail::LlmCall {
                confidence: None,
                summary: None,
            },
            StepStatus::InProgress,
            "asking the model to resolve",
        );
        let prompt = build_prompt(dir, &target, &local_commit, &local_message, &files).await?;
        let reply = match deps
            .llm
            .execute(&deps.llm_target, &prompt, deps.llm_timeout)
            .await
            .and_then(|raw| parse_reply(&raw))
        {
            Ok(reply) => reply,
            Err(e) => {
                registry.complete_step(ws_id, llm_idx, StepStatus::Failed, |step| {
                    step.message = e.to_string();
                });
                return abort_and_fail(deps, workspace, wip_created, &format!("llm call: {e}"))
                    .await;
            }
        };
        registry.complete_step(ws_id, llm_idx, StepStatus::Done, |step| {
            if let StepDetail::LlmCall {
                confidence,
                summary,
            } = &mut step.detail
            {
                *confidence = Some(reply.confidence.clone());
                *summary = Some(reply.summary.clone());
            }
            step.message = format!("model answered with {} confidence", reply.confidence);
        });

        // 4.iv decision
        if !reply.all_resolved || reply.confidence != "high" {
            let reason = format!("low confidence: {}", reply.summary);
            return abort_and_fail(deps, workspace, wip_created, &reason).await;
        }

        // 4.v apply and continue
        let written: Vec<String> = reply.files.keys().cloned().collect();
        for (rel, contents) in &reply.files {
            let full = dir.join(rel);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
            }
            tokio::fs::write(&full, contents)
                .await
                .map_err(|e| CoreError::Internal(format!("write {rel}: {e}")))?;
        }
        registry.append_step(
            ws_id,
            StepDetail::WriteFiles {
                files: written.clone(),
            },
            StepStatus::Done,
            format!("wrote {} resolved file(s)", written.len()),
        );
        GitCli::add_paths(dir, &written).await?;

        if GitCli::rebase_continue(dir).await.is_err() {
            let still_unmerged = GitCli::unmerged_files(dir).await.unwrap_or_default();
            if still_unmerged.is_empty() {
                return abort_and_fail(
                    deps,
                    workspace,
                    wip_created,
                    "continue failed although everything was resolved",
                )
                .await;
            }
        }
        registry.append_step(
            ws_id,
            StepDetail::RebaseContinue,
            StepStatus::Done,
            "rebase continued",
        );

        registry.push_resolution(
            ws_id,
            Resolution {
                local_commit,
                files: written,
                confidence: reply.confidence,
                summary: reply.summary,
            },
        );
    }

    // 5. wip_unwind
    if wip_created {
        GitCli::reset_mixed_head1(dir).await?;
    }
    registry.append_step(
        ws_id,
        StepDetail::WipUnwind {
            unwound: wip_created,
        },
        StepStatus::Done,
        if wip_created {
            "WIP commit unwound"
        } else {
            "nothing to unwind"
        },
    );

    // 6. done
    registry.finish(ws_id, OpStatus::Done);
    info!(workspace = ws_id, "resolve completed");
    Ok(())
}

/// Abort the rebase, unwind the WIP commit if one was made, record the
/// abort step, and mark the operation failed. The workspace tree ends up
/// exactly as it was before the operation.
async fn abort_and_fail(
    deps: &ResolveDeps,
    workspace: &Workspace,
    wip_created: bool,
    reason: &str,
) -> CoreResult<()> {
    let dir = &workspace.path;
    if GitCli::rebase_in_progress(dir) {
        if let Err(e) = GitCli::rebase_abort(dir).await {
            warn!("rebase abort failed: {e}");
        }
    }
    if wip_created {
        if let Err(e) = GitCli::reset_mixed_head1(dir).await {
            warn!("WIP unwind after abort failed: {e}");
        }
    }
    deps.registry.append_step(
        &workspace.id,
        StepDetail::Abort {
            reason: reason.to_string(),
        },
        StepStatus::Done,
        reason,
    );
    deps.registry.finish(&workspace.id, OpStatus::Failed);
    Ok(())
}

async fn build_prompt(
    dir: &std::path::Path,
    target_commit: &str,
    local_commit: &str,
    local_message: &str,
    files: &[String],
) -> CoreResult<String> {
    let mut prompt = String::new();
    prompt.push_str(
        "You are resolving git rebase conflicts. Reply with ONLY a JSON object of the shape \
         {\"all_resolved\": bool, \"confidence\": \"high\"|\"medium\"|\"low\", \
         \"summary\": string, \"files\": {path: full resolved contents}}.\n\n",
    );
    prompt.push_str(&format!("Rebasing onto commit: {target_commit}\n"));
    prompt.push_str(&format!(
        "Replaying local commit: {local_commit} ({local_message})\n\n"
    ));
    for rel in files {
        let contents = tokio::fs::read_to_string(dir.join(rel))
            .await
            .map_err(|e| CoreError::Internal(format!("read conflicted {rel}: {e}")))?;
        prompt.push_str(&format!(
            "=== {rel} (conflict markers included) ===\n{contents}\n\n"
        ));
    }
    Ok(prompt)
}

/// Parse the model's JSON, tolerating a markdown code fence around it.
fn parse_reply(raw: &str) -> CoreResult<LlmReply> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim);
    serde_json::from_str(body)
        .map_err(|e| CoreError::Corrupted(format!("model reply is not the expected JSON: {e}")))
}
