//! Daemon configuration, read from and written to a JSON file with the
//! same atomic temp+rename protocol as the state snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Checked-out worktrees, one directory per workspace
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,
    /// Shared bare clones backing the worktrees
    #[serde(default = "default_base_repos_path")]
    pub base_repos_path: String,
    /// Read-only query clones, kept apart so status queries never block
    /// worktree operations
    #[serde(default = "default_query_repos_path")]
    pub query_repos_path: String,
    /// Per-session log files (scrollback replay and signal tailing)
    #[serde(default = "default_logs_path")]
    pub logs_path: String,
    #[serde(default)]
    pub source_code_management: ScmMode,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub run_targets: Vec<RunTarget>,
    #[serde(default)]
    pub quick_launch: Vec<QuickLaunch>,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub xterm: XtermConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub access_control: AccessControlConfig,
    #[serde(default)]
    pub remote_flavors: Vec<RemoteFlavor>,
    #[serde(default)]
    pub pr_review: TargetRef,
    #[serde(default)]
    pub nudgenik: TargetRef,
    #[serde(default)]
    pub branch_suggest: TargetRef,
    #[serde(default)]
    pub conflict_resolve: ConflictResolveConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub external_diff_commands: Vec<ExternalDiffCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScmMode {
    /// Worktrees over shared bare clones (the default)
    #[default]
    #[serde(rename = "git-worktree")]
    GitWorktree,
    /// One full clone per workspace
    #[serde(rename = "git")]
    Git,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    pub url: String,
}

/// How a session's command is assembled. Model presets select their model
/// through an env var or a CLI flag depending on the base tool; that
/// choice is a variant field, never a string test at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTarget {
    /// An agent that accepts a prompt appended to its command line
    Promptable {
        name: String,
        command: String,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Sub-command used to resume the agent's previous conversation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_command: Option<String>,
    },
    /// A plain shell command, passed through untouched
    Command { name: String, command: String },
    /// A model preset layered on a promptable base tool
    Model {
        name: String,
        base_tool: String,
        model: String,
        selector: ModelSelector,
    },
}

impl RunTarget {
    pub fn name(&self) -> &str {
        match self {
            RunTarget::Promptable { name, .. }
            | RunTarget::Command { name, .. }
            | RunTarget::Model { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSelector {
    /// Exported into the session environment, e.g. ANTHROPIC_MODEL
    Env { var: String },
    /// Injected as a CLI flag, e.g. `-m <model>`
    Flag { flag: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickLaunch {
    pub name: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_terminal_width")]
    pub width: u16,
    #[serde(default = "default_terminal_height")]
    pub height: u16,
    /// Lines replayed into a freshly attached terminal
    #[serde(default = "default_seed_lines")]
    pub seed_lines: u32,
    /// Lines of scrollback bootstrap for per-session WebSocket clients
    #[serde(default = "default_bootstrap_lines")]
    pub bootstrap_lines: u32,
}

fn default_terminal_width() -> u16 {
    200
}

fn default_terminal_height() -> u16 {
    50
}

fn default_seed_lines() -> u32 {
    2000
}

fn default_bootstrap_lines() -> u32 {
    20_000
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            width: default_terminal_width(),
            height: default_terminal_height(),
            seed_lines: default_seed_lines(),
            bootstrap_lines: default_bootstrap_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Interval between checks that every persisted session's multiplexer
    /// session still exists
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,
    /// Interval between query-repo fetches (re-detects default branches)
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_ms: u64,
    /// Slow full-status poll covering watcher gaps
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_ms: u64,
}

fn default_reconcile_interval() -> u64 {
    15_000
}

fn default_fetch_interval() -> u64 {
    300_000
}

fn default_status_poll_interval() -> u64 {
    10_000
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval(),
            fetch_interval_ms: default_fetch_interval(),
            status_poll_interval_ms: default_status_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XtermConfig {
    /// Per-session log size that triggers rotation
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,
    /// Tail preserved by a rotation
    #[serde(default = "default_log_trim_bytes")]
    pub log_trim_bytes: u64,
}

fn default_log_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_log_trim_bytes() -> u64 {
    1024 * 1024
}

impl Default for XtermConfig {
    fn default() -> Self {
        Self {
            log_max_bytes: default_log_max_bytes(),
            log_trim_bytes: default_log_trim_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8700
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            public_base_url: None,
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_provider")]
    pub provider: String,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_minutes: u64,
}

fn default_auth_provider() -> String {
    "github".to_string()
}

fn default_session_ttl() -> u64 {
    7 * 24 * 60
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_auth_provider(),
            session_ttl_minutes: default_session_ttl(),
        }
    }
}

/// A provisionable remote multiplexer flavor: the command that brings a
/// host up and attaches to its control mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFlavor {
    pub name: String,
    pub connect_command: String,
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_ms: u64,
}

fn default_provision_timeout() -> u64 {
    120_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolveConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default = "default_conflict_timeout")]
    pub timeout_ms: u64,
}

fn default_conflict_timeout() -> u64 {
    120_000
}

impl Default for ConflictResolveConfig {
    fn default() -> Self {
        Self {
            target: None,
            timeout_ms: default_conflict_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub sound_disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDiffCommand {
    pub name: String,
    pub command: String,
}

fn schmux_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".schmux")
}

fn default_workspace_path() -> String {
    schmux_home().join("workspaces").to_string_lossy().into_owned()
}

fn default_base_repos_path() -> String {
    schmux_home().join("bases").to_string_lossy().into_owned()
}

fn default_query_repos_path() -> String {
    schmux_home().join("queries").to_string_lossy().into_owned()
}

fn default_logs_path() -> String {
    schmux_home().join("logs").to_string_lossy().into_owned()
}

impl Default for Config {
    fn default() -> Self {
        // The empty object picks up every serde default
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        schmux_home().join("config.json")
    }

    pub fn state_path(&self) -> PathBuf {
        schmux_home().join("state.json")
    }

    pub fn secrets_path() -> PathBuf {
        schmux_home().join("secrets.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.logs_path)
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.logs_dir().join(format!("session-{session_id}.log"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::config_path, Path::to_path_buf);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parse config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read config {}", path.display())),
        }
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map_or_else(Self::config_path, Path::to_path_buf);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            anyhow::anyhow!("rename {} -> {}: {e}", tmp.display(), path.display())
        })?;
        Ok(())
    }

    pub fn run_target(&self, name: &str) -> Option<&RunTarget> {
        self.run_targets.iter().find(|t| t.name() == name)
    }

    pub fn repo_url(&self, name: &str) -> Option<&str> {
        self.repos
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.url.as_str())
    }

    pub fn remote_flavor(&self, name: &str) -> Option<&RemoteFlavor> {
        self.remote_flavors.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.source_code_management, ScmMode::GitWorktree);
        assert_eq!(config.terminal.bootstrap_lines, 20_000);
        assert_eq!(config.xterm.log_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.xterm.log_trim_bytes, 1024 * 1024);
        assert_eq!(config.conflict_resolve.timeout_ms, 120_000);
        assert_eq!(config.network.port, 8700);
        assert!(!config.access_control.enabled);
    }

    #[test]
    fn test_run_target_tagged_parsing() {
        let json = r#"{
            "run_targets": [
                {"type": "promptable", "name": "claude", "command": "claude",
                 "env": {"CLAUDE_NO_AUTOUPDATE": "1"}},
                {"type": "command", "name": "shell", "command": "bash"},
                {"type": "model", "name": "claude-opus", "base_tool": "claude",
                 "model": "opus", "selector": {"kind": "flag", "flag": "-m"}},
                {"type": "model", "name": "gemini-pro", "base_tool": "gemini",
                 "model": "gemini-2.0-pro", "selector": {"kind": "env", "var": "GEMINI_MODEL"}}
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.run_targets.len(), 4);

        match config.run_target("claude-opus").unwrap() {
            RunTarget::Model { selector, .. } => {
                assert!(matches!(selector, ModelSelector::Flag { .. }));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        match config.run_target("gemini-pro").unwrap() {
            RunTarget::Model { selector, .. } => {
                assert!(matches!(selector, ModelSelector::Env { .. }));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_scm_mode_wire_names() {
        let config: Config =
            serde_json::from_str(r#"{"source_code_management": "git"}"#).unwrap();
        assert_eq!(config.source_code_management, ScmMode::Git);

        let config: Config =
            serde_json::from_str(r#"{"source_code_management": "git-worktree"}"#).unwrap();
        assert_eq!(config.source_code_management, ScmMode::GitWorktree);
    }

    #[test]
    fn test_save_is_atomic_and_reloadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.repos.push(RepoConfig {
            name: "widgets".to_string(),
            url: "https://github.com/acme/widgets".to_string(),
        });
        config.save(Some(&path)).unwrap();

        let reloaded = Config::load(Some(&path)).unwrap();
        assert_eq!(reloaded.repos.len(), 1);
        assert_eq!(
            reloaded.repo_url("widgets").unwrap(),
            "https://github.com/acme/widgets"
        );

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert!(config.repos.is_empty());
    }
}
