//! Typed message envelopes for the dashboard WebSocket channel.
//!
//! Every message is a complete snapshot, never a delta, so a dropped or
//! coalesced-away broadcast is harmless: the next one carries everything.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::signal::Signal;
use crate::state::{GitStatus, RemoteBinding, Session, Workspace};

/// Workspace as shipped to the dashboard, transient git status included.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceView {
    pub id: String,
    pub repo_url: String,
    pub branch: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_status: Option<GitStatus>,
}

impl From<Workspace> for WorkspaceView {
    fn from(ws: Workspace) -> Self {
        Self {
            id: ws.id,
            repo_url: ws.repo_url,
            branch: ws.branch,
            path: ws.path,
            created_at: ws.created_at,
            remote_host_id: ws.remote_host_id,
            git_status: ws.git_status,
        }
    }
}

/// Session as shipped to the dashboard, transient signal state included.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub workspace_id: String,
    pub run_target: String,
    pub mux_session: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pane_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<Signal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output_at: Option<DateTime<Utc>>,
}

impl From<Session> for SessionView {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            workspace_id: s.workspace_id,
            run_target: s.run_target,
            mux_session: s.mux_session,
            created_at: s.created_at,
            pane_pid: s.pane_pid,
            nickname: s.nickname,
            remote: s.remote,
            last_signal: s.last_signal,
            last_output_at: s.last_output_at,
        }
    }
}

/// Dashboard wire envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    Sessions {
        workspaces: Vec<WorkspaceView>,
        sessions: Vec<SessionView>,
        needs_restart: bool,
    },
    /// One per active long-running operation, after the sessions payload
    LinearSyncResolveConflict {
        workspace_id: String,
        operation: serde_json::Value,
    },
}
