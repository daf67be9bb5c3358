//! Long-running operation state: fire-and-forget background jobs with
//! externally observable, step-by-step progress.
//!
//! Operation state lives in memory only, keyed by workspace. The presence
//! of an `in_progress` entry doubles as the per-workspace operation lock.
//! Every mutation pushes a complete snapshot to the broadcast hub, so a
//! missed message is harmless.

pub mod connect;
pub mod resolve;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::hub::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Done,
    Failed,
}

/// Action-specific payload for one step of the resolve flow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepDetail {
    CheckBehind {
        behind: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_commit: Option<String>,
    },
    WipCommit {
        created: bool,
    },
    RebaseStart {
        onto: String,
    },
    ConflictDetected {
        local_commit: String,
        local_message: String,
        files: Vec<String>,
    },
    LlmCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    WriteFiles {
        files: Vec<String>,
    },
    RebaseContinue,
    Abort {
        reason: String,
    },
    WipUnwind {
        unwound: bool,
    },
}

impl StepDetail {
    pub fn action(&self) -> &'static str {
        match self {
            StepDetail::CheckBehind { .. } => "check_behind",
            StepDetail::WipCommit { .. } => "wip_commit",
            StepDetail::RebaseStart { .. } => "rebase_start",
            StepDetail::ConflictDetected { .. } => "conflict_detected",
            StepDetail::LlmCall { .. } => "llm_call",
            StepDetail::WriteFiles { .. } => "write_files",
            StepDetail::RebaseContinue => "rebase_continue",
            StepDetail::Abort { .. } => "abort",
            StepDetail::WipUnwind { .. } => "wip_unwind",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    #[serde(flatten)]
    pub detail: StepDetail,
    pub status: StepStatus,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary of one LLM-resolved conflict, built from the llm_call steps.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub local_commit: String,
    pub files: Vec<String>,
    pub confidence: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveOperation {
    pub workspace_id: String,
    pub status: OpStatus,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<Resolution>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct OperationRegistry {
    ops: Mutex<HashMap<String, ResolveOperation>>,
    hub: Arc<Hub>,
}

impl OperationRegistry {
    pub fn new(hub: Arc<Hub>) -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(HashMap::new()),
            hub,
        })
    }

    /// Claim the per-workspace operation slot. An `in_progress` entry is a
    /// conflict; a terminal entry is auto-cleared and replaced.
    pub fn begin(&self, workspace_id: &str) -> CoreResult<()> {
        let mut ops = self.ops.lock().unwrap();
        if let Some(existing) = ops.get(workspace_id) {
            if existing.status == OpStatus::InProgress {
                return Err(CoreError::Conflict(format!(
                    "a resolve operation is already running for workspace '{workspace_id}'"
                )));
            }
        }
        let op = ResolveOperation {
            workspace_id: workspace_id.to_string(),
            status: OpStatus::InProgress,
            steps: Vec::new(),
            resolutions: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        self.publish(&op);
        ops.insert(workspace_id.to_string(), op);
        Ok(())
    }

    pub fn get(&self, workspace_id: &str) -> Option<ResolveOperation> {
        self.ops.lock().unwrap().get(workspace_id).cloned()
    }

    pub fn in_progress(&self, workspace_id: &str) -> bool {
        self.ops
            .lock()
            .unwrap()
            .get(workspace_id)
            .is_some_and(|op| op.status == OpStatus::InProgress)
    }

    /// Dismiss a terminal operation; running ones cannot be dismissed.
    pub fn dismiss(&self, workspace_id: &str) -> CoreResult<()> {
        let mut ops = self.ops.lock().unwrap();
        match ops.get(workspace_id) {
            None => Err(CoreError::NotFound(format!(
                "no operation for workspace '{workspace_id}'"
            ))),
            Some(op) if op.status == OpStatus::InProgress => Err(CoreError::Conflict(
                "operation is still in progress".to_string(),
            )),
            Some(_) => {
                ops.remove(workspace_id);
                self.hub.remove_operation(workspace_id);
                Ok(())
            }
        }
    }

    /// Append a step; returns its index for later status updates.
    pub fn append_step(
        &self,
        workspace_id: &str,
        detail: StepDetail,
        status: StepStatus,
        message: impl Into<String>,
    ) -> usize {
        let mut ops = self.ops.lock().unwrap();
        let Some(op) = ops.get_mut(workspace_id) else {
            warn!(workspace_id, "append_step on missing operation");
            return 0;
        };
        let finished = matches!(status, StepStatus::Done | StepStatus::Failed);
        op.steps.push(Step {
            detail,
            status,
            message: message.into(),
            started_at: Utc::now(),
            finished_at: finished.then(Utc::now),
        });
        let idx = op.steps.len() - 1;
        self.publish(op);
        idx
    }

    /// Complete a previously appended step.
    pub fn complete_step(
        &self,
        workspace_id: &str,
        index: usize,
        status: StepStatus,
        f: impl FnOnce(&mut Step),
    ) {
        let mut ops = self.ops.lock().unwrap();
        let Some(op) = ops.get_mut(workspace_id) else {
            return;
        };
        let Some(step) = op.steps.get_mut(index) else {
            return;
        };
        step.status = status;
        step.finished_at = Some(Utc::now());
        f(step);
        self.publish(op);
    }

    pub fn push_resolution(&self, workspace_id: &str, resolution: Resolution) {
        let mut ops = self.ops.lock().unwrap();
        if let Some(op) = ops.get_mut(workspace_id) {
            op.resolutions.push(resolution);
            self.publish(op);
        }
    }

    /// Move the operation to a terminal status.
    pub fn finish(&self, workspace_id: &str, status: OpStatus) {
        let mut ops = self.ops.lock().unwrap();
        if let Some(op) = ops.get_mut(workspace_id) {
            op.status = status;
            op.finished_at = Some(Utc::now());
            self.publish(op);
        }
    }

    fn publish(&self, op: &ResolveOperation) {
        match serde_json::to_value(op) {
            Ok(value) => self.hub.update_operation(&op.workspace_id, value),
            Err(e) => warn!("serializing operation failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Store;
    use tempfile::TempDir;

    fn registry() -> (Arc<OperationRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::load(dir.path().join("state.json")).unwrap();
        (OperationRegistry::new(Hub::new(store)), dir)
    }

    #[tokio::test]
    async fn test_begin_conflicts_while_in_progress() {
        let (registry, _dir) = registry();
        registry.begin("w1").unwrap();

        let err = registry.begin("w1").unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_operation_auto_cleared_on_begin() {
        let (registry, _dir) = registry();
        registry.begin("w1").unwrap();
        registry.finish("w1", OpStatus::Failed);

        registry.begin("w1").unwrap();
        let op = registry.get("w1").unwrap();
        assert_eq!(op.status, OpStatus::InProgress);
        assert!(op.steps.is_empty());
    }

    #[tokio::test]
    async fn test_dismiss_running_operation_rejected() {
        let (registry, _dir) = registry();
        registry.begin("w1").unwrap();

        assert!(matches!(
            registry.dismiss("w1").unwrap_err(),
            CoreError::Conflict(_)
        ));

        registry.finish("w1", OpStatus::Done);
        registry.dismiss("w1").unwrap();
        assert!(registry.get("w1").is_none());
    }

    #[tokio::test]
    async fn test_steps_accumulate_in_order() {
        let (registry, _dir) = registry();
        registry.begin("w1").unwrap();

        registry.append_step(
            "w1",
            StepDetail::CheckBehind {
                behind: 1,
                target_commit: Some("abc123".to_string()),
            },
            StepStatus::Done,
            "1 commit behind",
        );
        let llm_idx = registry.append_step(
            "w1",
            StepDetail::LlmCall {
                confidence: None,
                summary: None,
            },
            StepStatus::InProgress,
            "calling model",
        );
        registry.complete_step("w1", llm_idx, StepStatus::Done, |step| {
            if let StepDetail::LlmCall { confidence, .. } = &mut step.detail {
                *confidence = Some("high".to_string());
            }
        });

        let op = registry.get("w1").unwrap();
        assert_eq!(op.steps.len(), 2);
        assert_eq!(op.steps[0].detail.action(), "check_behind");
        assert_eq!(op.steps[1].status, StepStatus::Done);
        assert!(op.steps[1].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_step_serialization_shape() {
        let (registry, _dir) = registry();
        registry.begin("w1").unwrap();
        registry.append_step(
            "w1",
            StepDetail::ConflictDetected {
                local_commit: "deadbeef".to_string(),
                local_message: "fix parser".to_string(),
                files: vec!["a.go".to_string()],
            },
            StepStatus::Done,
            "conflict in 1 file",
        );

        let op = registry.get("w1").unwrap();
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["steps"][0]["action"], "conflict_detected");
        assert_eq!(json["steps"][0]["files"][0], "a.go");
        assert_eq!(json["status"], "in_progress");
    }
}
