//! Persisted and transient entity types for the state store.
//!
//! Fields marked `#[serde(skip)]` are transient: they never reach the
//! snapshot file and are reset to their defaults on load. Dashboard
//! payloads that need them are built explicitly by the broadcast hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::signal::Signal;

/// Computed git state for a workspace, refreshed by status polls and the
/// metadata watcher. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub dirty: bool,
    pub ahead: u32,
    pub behind: u32,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_changed: u32,
}

/// A branch checked out in a dedicated directory under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Opaque ID, doubling as the directory name under the workspace tree
    pub id: String,
    pub repo_url: String,
    pub branch: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Set when the workspace's sessions run on a remote host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host_id: Option<String>,
    #[serde(skip)]
    pub git_status: Option<GitStatus>,
}

/// One bare clone per repository URL, shared by all of its worktrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeBase {
    pub repo_url: String,
    pub path: PathBuf,
}

/// Remote pane/window coordinates for a session hosted off-machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBinding {
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
}

/// An agent command bound to a workspace inside a multiplexer session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    /// Run-target name this session was started from
    pub run_target: String,
    /// Multiplexer session name; unique process-wide
    pub mux_session: String,
    pub created_at: DateTime<Utc>,
    /// PID of the command running inside the pane, captured after spawn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteBinding>,
    #[serde(skip)]
    pub last_output_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_signal: Option<Signal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Provisioning,
    Connecting,
    Connected,
    Disconnected,
    Expired,
    Reconnecting,
}

/// Default remote-host lifetime before expiry pruning.
pub const HOST_TTL_HOURS: i64 = 12;

/// A provisioned remote multiplexer host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHost {
    pub id: String,
    /// Configuration key the host was provisioned from
    pub flavor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub status: HostStatus,
    pub provisioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RemoteHost {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, HostStatus::Expired)
            || self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// On-disk snapshot schema. Transient fields are excluded by the entity
/// types themselves; unknown PR/repo payloads round-trip untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub base_repos: Vec<WorktreeBase>,
    #[serde(default)]
    pub remote_hosts: Vec<RemoteHost>,
    #[serde(default)]
    pub pull_requests: Vec<serde_json::Value>,
    #[serde(default)]
    pub public_repos: Vec<serde_json::Value>,
    #[serde(default)]
    pub needs_restart: bool,
}
