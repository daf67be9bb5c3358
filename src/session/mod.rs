//! Session lifecycle: binds a workspace to an agent command inside a
//! multiplexer session, keeps the log tail and signal loop running, and
//! reconciles state against the multiplexer's view of the world.

pub mod run_target;
pub mod tail;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::hub::Hub;
use crate::mux::{Multiplexer, MuxError};
use crate::notifications::NotificationService;
use crate::state::{Session, Store, Workspace};
use run_target::{resolve_target, wrap_for_mux, SpawnRequest};
use tail::{spawn_tail, SessionTail, TailContext, TailLimits};

pub struct SessionManager {
    config: Arc<Config>,
    store: Arc<Store>,
    local_mux: Arc<dyn Multiplexer>,
    /// Remote adapters keyed by host ID, registered by the connection
    /// provisioner
    remotes: Mutex<HashMap<String, Arc<dyn Multiplexer>>>,
    hub: Arc<Hub>,
    notifier: Arc<NotificationService>,
    tails: Mutex<HashMap<String, SessionTail>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        local_mux: Arc<dyn Multiplexer>,
        hub: Arc<Hub>,
        notifier: Arc<NotificationService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            local_mux,
            remotes: Mutex::new(HashMap::new()),
            hub,
            notifier,
            tails: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_remote(&self, host_id: &str, mux: Arc<dyn Multiplexer>) {
        self.remotes.lock().unwrap().insert(host_id.to_string(), mux);
    }

    pub fn unregister_remote(&self, host_id: &str) {
        self.remotes.lock().unwrap().remove(host_id);
    }

    fn mux_for(&self, workspace: &Workspace) -> CoreResult<Arc<dyn Multiplexer>> {
        match &workspace.remote_host_id {
            None => Ok(self.local_mux.clone()),
            Some(host_id) => self
                .remotes
                .lock()
                .unwrap()
                .get(host_id)
                .cloned()
                .ok_or_else(|| {
                    CoreError::Unavailable(format!("remote host '{host_id}' is not connected"))
                }),
        }
    }

    fn mux_for_session(&self, session: &Session) -> CoreResult<Arc<dyn Multiplexer>> {
        match &session.remote {
            None => Ok(self.local_mux.clone()),
            Some(binding) => self
                .remotes
                .lock()
                .unwrap()
                .get(&binding.host_id)
                .cloned()
                .ok_or_else(|| {
                    CoreError::Unavailable(format!(
                        "remote host '{}' is not connected",
                        binding.host_id
                    ))
                }),
        }
    }

    fn session_label(session: &Session, workspace: &Workspace) -> String {
        match &session.nickname {
            Some(nick) => nick.clone(),
            None => format!("{} on {}", session.run_target, workspace.branch),
        }
    }

    // ─── Spawn ───────────────────────────────────────────────────────────

    /// Resolve the run target, create the multiplexer session, register
    /// state, and start the signal/log loop. Cancellation mid-flight
    /// aborts the creation and rolls everything back.
    #[instrument(skip(self, cancel), fields(workspace_id))]
    pub async fn spawn_session(
        &self,
        workspace_id: &str,
        request: SpawnRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<Session> {
        let workspace = self.store.workspace(workspace_id)?;
        let resolved = resolve_target(&self.config, request.target_name())?;
        let command = wrap_for_mux(&resolved, &request)?;

        let mux = self.mux_for(&workspace)?;
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let mux_session = format!("schmux-{session_id}");

        tokio::select! {
            created = mux.create_session(&mux_session, &workspace.path, &command) => {
                created.map_err(map_mux_err)?;
            }
            () = cancel.cancelled() => {
                // Creation may have landed; take it back down either way
                let _ = mux.kill_session(&mux_session).await;
                return Err(CoreError::Internal("spawn cancelled".to_string()));
            }
        }

        if let Err(e) = mux.set_size_manual(&mux_session).await {
            debug!("set_size_manual: {e}");
        }
        if let Err(e) = mux
            .resize(
                &mux_session,
                self.config.terminal.width,
                self.config.terminal.height,
            )
            .await
        {
            debug!("resize: {e}");
        }

        let pane_pid = mux.pane_pid(&mux_session).await.unwrap_or(None);

        let log_path = self.config.session_log_path(&session_id);
        if let Err(e) = mux.start_tail_to_file(&mux_session, &log_path).await {
            let _ = mux.kill_session(&mux_session).await;
            return Err(map_mux_err(e));
        }

        let session = Session {
            id: session_id.clone(),
            workspace_id: workspace_id.to_string(),
            run_target: request.target_name().to_string(),
            mux_session: mux_session.clone(),
            created_at: Utc::now(),
            pane_pid,
            nickname: None,
            remote: workspace.remote_host_id.as_ref().map(|host_id| {
                crate::state::RemoteBinding {
                    host_id: host_id.clone(),
                    window_id: None,
                    pane_id: None,
                }
            }),
            last_output_at: None,
            last_signal: None,
        };

        if let Err(e) = self.store.add_session(session.clone()) {
            // State must not claim a session the save could not record
            let _ = mux.stop_tail(&mux_session).await;
            let _ = mux.kill_session(&mux_session).await;
            return Err(e);
        }

        self.start_tail_loop(&session, &workspace, mux);
        self.hub.trigger();
        info!(session_id, mux_session, "session spawned");
        Ok(session)
    }

    /// Spawn from a configured quick-launch preset (target + canned prompt).
    pub async fn spawn_quick_launch(
        &self,
        workspace_id: &str,
        preset: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Session> {
        let preset = self
            .config
            .quick_launch
            .iter()
            .find(|q| q.name == preset)
            .ok_or_else(|| CoreError::NotFound(format!("quick-launch preset '{preset}'")))?;
        self.spawn_session(
            workspace_id,
            SpawnRequest::Target {
                name: preset.target.clone(),
                prompt: preset.prompt.clone(),
            },
            cancel,
        )
        .await
    }

    fn start_tail_loop(&self, session: &Session, workspace: &Workspace, mux: Arc<dyn Multiplexer>) {
        let ctx = TailContext {
            session_id: session.id.clone(),
            session_label: Self::session_label(session, workspace),
            mux_session: session.mux_session.clone(),
            log_path: self.config.session_log_path(&session.id),
            mux,
            store: self.store.clone(),
            hub: self.hub.clone(),
            notifier: self.notifier.clone(),
            limits: TailLimits {
                max_bytes: self.config.xterm.log_max_bytes,
                trim_bytes: self.config.xterm.log_trim_bytes,
            },
        };
        let tail = spawn_tail(ctx);
        if let Some(old) = self.tails.lock().unwrap().insert(session.id.clone(), tail) {
            old.stop();
        }
    }

    /// Re-attach tails for sessions that survived a daemon restart.
    pub async fn resume_tails(&self) {
        for session in self.store.sessions() {
            let Ok(workspace) = self.store.workspace(&session.workspace_id) else {
                continue;
            };
            let Ok(mux) = self.mux_for_session(&session) else {
                continue;
            };
            match mux.session_exists(&session.mux_session).await {
                Ok(true) => {
                    let log_path = self.config.session_log_path(&session.id);
                    if !mux.is_tail_active(&session.mux_session).await {
                        if let Err(e) = mux.start_tail_to_file(&session.mux_session, &log_path).await
                        {
                            warn!(session = session.id, "re-arming pipe failed: {e}");
                        }
                    }
                    self.start_tail_loop(&session, &workspace, mux);
                }
                Ok(false) => {
                    info!(session = session.id, "multiplexer session gone; pruning");
                    let _ = self.store.remove_session(&session.id);
                    self.hub.trigger();
                }
                Err(e) => debug!(session = session.id, "existence check failed: {e}"),
            }
        }
    }

    // ─── Disposal & rename ───────────────────────────────────────────────

    /// Kill the multiplexer session and delete state — state is removed
    /// only once the multiplexer session is confirmed gone.
    #[instrument(skip(self), fields(session_id))]
    pub async fn dispose_session(&self, session_id: &str) -> CoreResult<()> {
        let session = self.store.session(session_id)?;
        let mux = self.mux_for_session(&session)?;

        if let Some(tail) = self.tails.lock().unwrap().remove(session_id) {
            tail.stop();
        }
        let _ = mux.stop_tail(&session.mux_session).await;

        match mux.kill_session(&session.mux_session).await {
            Ok(()) | Err(MuxError::SessionNotFound(_)) => {}
            Err(e) => return Err(map_mux_err(e)),
        }
        if mux
            .session_exists(&session.mux_session)
            .await
            .map_err(map_mux_err)?
        {
            return Err(CoreError::Internal(format!(
                "multiplexer session '{}' survived kill",
                session.mux_session
            )));
        }

        self.store.remove_session(session_id)?;
        self.hub.trigger();
        info!(session_id, "session disposed");
        Ok(())
    }

    /// Nickname a session. The multiplexer rename goes first; a failure
    /// there aborts the state mutation.
    pub async fn rename_session(&self, session_id: &str, nickname: &str) -> CoreResult<()> {
        let session = self.store.session(session_id)?;
        let workspace = self.store.workspace(&session.workspace_id)?;
        let mux = self.mux_for_session(&session)?;

        let new_name = format!("schmux-{}-{session_id}", sanitize_name(nickname));
        if new_name != session.mux_session {
            mux.rename_session(&session.mux_session, &new_name)
                .await
                .map_err(map_mux_err)?;
        }

        self.store.update_session(session_id, |s| {
            s.mux_session = new_name.clone();
            s.nickname = Some(nickname.to_string());
        })?;
        if let Err(e) = self.store.save() {
            warn!("saving after rename failed: {e}");
        }

        // The tail needs the new multiplexer name for rotation restarts
        let renamed = self.store.session(session_id)?;
        self.start_tail_loop(&renamed, &workspace, mux);
        self.hub.trigger();
        Ok(())
    }

    // ─── Pass-through I/O ────────────────────────────────────────────────

    pub async fn send_keys(&self, session_id: &str, keystrokes: &str) -> CoreResult<()> {
        let session = self.store.session(session_id)?;
        let mux = self.mux_for_session(&session)?;
        mux.send_keys(&session.mux_session, keystrokes)
            .await
            .map_err(map_mux_err)
    }

    pub async fn send_literal(&self, session_id: &str, text: &str) -> CoreResult<()> {
        let session = self.store.session(session_id)?;
        let mux = self.mux_for_session(&session)?;
        mux.send_literal(&session.mux_session, text)
            .await
            .map_err(map_mux_err)
    }

    /// Scrollback bootstrap for a freshly connected WebSocket client.
    pub fn scrollback(&self, session_id: &str) -> CoreResult<Vec<u8>> {
        let session = self.store.session(session_id)?;
        let log_path = self.config.session_log_path(&session.id);
        Ok(tail::bootstrap_scrollback(
            &log_path,
            self.config.terminal.bootstrap_lines,
        ))
    }

    // ─── Reconciliation ──────────────────────────────────────────────────

    /// Delete state entries whose multiplexer session is confirmed gone.
    /// Sessions on unreachable remotes are left alone — absence cannot be
    /// confirmed through a dead connection.
    pub async fn reconcile(&self) {
        for session in self.store.sessions() {
            let Ok(mux) = self.mux_for_session(&session) else {
                continue;
            };
            match mux.session_exists(&session.mux_session).await {
                Ok(false) => {
                    info!(session = session.id, "pruning session with dead pane");
                    if let Some(tail) = self.tails.lock().unwrap().remove(&session.id) {
                        tail.stop();
                    }
                    let _ = self.store.remove_session(&session.id);
                    self.hub.trigger();
                }
                Ok(true) => {}
                Err(e) => debug!(session = session.id, "reconcile check failed: {e}"),
            }
        }
    }

    pub fn shutdown(&self) {
        for (_, tail) in self.tails.lock().unwrap().drain() {
            tail.stop();
        }
    }
}

fn map_mux_err(e: MuxError) -> CoreError {
    match e {
        MuxError::NotInstalled | MuxError::NotConnected => CoreError::Unavailable(e.to_string()),
        MuxError::SessionNotFound(name) => CoreError::NotFound(format!("session '{name}'")),
        MuxError::SessionExists(name) => CoreError::Conflict(format!("session '{name}' exists")),
        MuxError::Timeout(msg) => CoreError::Timeout(msg),
        MuxError::Cancelled(msg) => CoreError::Internal(format!("cancelled: {msg}")),
        MuxError::Protocol(msg) => CoreError::Corrupted(msg),
        MuxError::CommandFailed(msg) => CoreError::Internal(msg),
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
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
    use crate::config::NotificationsConfig;
    use crate::mux::MockMux;
    use crate::state::Workspace;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Arc<Config> {
        let mut config = Config::default();
        config.run_targets = serde_json::from_str(
            r#"[
                {"type": "promptable", "name": "claude", "command": "claude"},
                {"type": "command", "name": "shell", "command": "bash"}
            ]"#,
        )
        .unwrap();
        config.workspace_path = dir.path().join("ws").to_string_lossy().into_owned();
        config.logs_path = dir.path().join("logs").to_string_lossy().into_owned();
        Arc::new(config)
    }

    async fn fixture(dir: &TempDir) -> (Arc<SessionManager>, Arc<MockMux>, Arc<Store>) {
        let config = test_config(dir);
        let store = Store::load(dir.path().join("state.json")).unwrap();
        store
            .add_workspace(Workspace {
                id: "w1".to_string(),
                repo_url: "https://github.com/acme/widgets".to_string(),
                branch: "fix-auth".to_string(),
                path: PathBuf::from("/tmp/ws/w1"),
                created_at: Utc::now(),
                remote_host_id: None,
                git_status: None,
            })
            .unwrap();

        let mux = MockMux::new();
        let hub = Hub::new(store.clone());
        let notifier = NotificationService::new(&NotificationsConfig {
            sound_disabled: true,
        });
        let manager = SessionManager::new(config, store.clone(), mux.clone(), hub, notifier);
        (manager, mux, store)
    }

    #[tokio::test]
    async fn test_spawn_registers_session_and_tail() {
        let dir = TempDir::new().unwrap();
        let (manager, mux, store) = fixture(&dir).await;

        let session = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: Some("fix it".to_string()),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(mux.session_exists(&session.mux_session).await.unwrap());
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(session.pane_pid, Some(12345));
        assert!(mux.is_tail_active(&session.mux_session).await);

        let created = mux.sessions.lock().unwrap();
        let mock = created.get(&session.mux_session).unwrap();
        assert_eq!(mock.command, "claude 'fix it'");
    }

    #[tokio::test]
    async fn test_spawn_unknown_workspace() {
        let dir = TempDir::new().unwrap();
        let (manager, _mux, _store) = fixture(&dir).await;

        let err = manager
            .spawn_session(
                "ghost",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_spawn_cancelled_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (manager, mux, store) = fixture(&dir).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: None,
                },
                &cancel,
            )
            .await;

        assert!(result.is_err());
        assert!(store.sessions().is_empty());
        assert!(mux.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_removes_state_only_when_pane_gone() {
        let dir = TempDir::new().unwrap();
        let (manager, mux, store) = fixture(&dir).await;

        let session = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "shell".to_string(),
                    prompt: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        manager.dispose_session(&session.id).await.unwrap();
        assert!(store.sessions().is_empty());
        assert!(!mux.session_exists(&session.mux_session).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_failure_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let (manager, mux, store) = fixture(&dir).await;

        let session = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        *mux.fail_rename.lock().unwrap() = true;
        let err = manager.rename_session(&session.id, "sidekick").await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));

        let unchanged = store.session(&session.id).unwrap();
        assert_eq!(unchanged.mux_session, session.mux_session);
        assert!(unchanged.nickname.is_none());
    }

    #[tokio::test]
    async fn test_rename_success_updates_both_sides() {
        let dir = TempDir::new().unwrap();
        let (manager, mux, store) = fixture(&dir).await;

        let session = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        manager.rename_session(&session.id, "my agent").await.unwrap();

        let renamed = store.session(&session.id).unwrap();
        assert_eq!(renamed.nickname.as_deref(), Some("my agent"));
        assert!(renamed.mux_session.contains("my-agent"));
        assert!(mux.session_exists(&renamed.mux_session).await.unwrap());
        assert!(!mux.session_exists(&session.mux_session).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_prunes_dead_sessions() {
        let dir = TempDir::new().unwrap();
        let (manager, mux, store) = fixture(&dir).await;

        let session = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Pane dies out-of-band
        mux.kill_session(&session.mux_session).await.unwrap();
        manager.reconcile().await;

        assert!(store.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_remote_workspace_requires_registered_host() {
        let dir = TempDir::new().unwrap();
        let (manager, _mux, store) = fixture(&dir).await;
        store
            .update_workspace("w1", |w| {
                w.remote_host_id = Some("h-missing".to_string());
            })
            .unwrap();

        let err = manager
            .spawn_session(
                "w1",
                SpawnRequest::Target {
                    name: "claude".to_string(),
                    prompt: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }
}
