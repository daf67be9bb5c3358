//! In-memory state store with atomic JSON write-through.
//!
//! One reader-writer lock guards every collection. Reads hand out deep
//! copies so callers can never mutate shared state in place. Writes that
//! must survive an abrupt restart (creates, deletes) save immediately;
//! high-frequency status ticks use the 500 ms batched save. A lost
//! batched write is recoverable because every broadcast carries the full
//! snapshot.

pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::debounce::Debouncer;
use crate::error::{CoreError, CoreResult};
pub use types::{
    GitStatus, HostStatus, PersistedState, RemoteBinding, RemoteHost, Session, Workspace,
    WorktreeBase, HOST_TTL_HOURS,
};

const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    inner: RwLock<PersistedState>,
    batcher: OnceCell<Debouncer>,
}

impl Store {
    /// Load the snapshot at `path` (an absent file yields empty state) and
    /// start the batched-save task. Transient fields come back reset.
    pub fn load(path: impl Into<PathBuf>) -> CoreResult<Arc<Self>> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<PersistedState>(&bytes)
                .map_err(|e| CoreError::Corrupted(format!("state file {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(CoreError::Internal(e.to_string())),
        };

        let store = Arc::new(Self {
            path,
            inner: RwLock::new(data),
            batcher: OnceCell::new(),
        });

        let weak = Arc::downgrade(&store);
        let batcher = Debouncer::new(SAVE_DEBOUNCE, move || {
            if let Some(store) = weak.upgrade() {
                if let Err(e) = store.save() {
                    warn!("batched state save failed: {e}");
                }
            }
        });
        let _ = store.batcher.set(batcher);

        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<'_, PersistedState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PersistedState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Marshal, write a sibling temp file, rename over the target. A
    /// failure removes the temp file and leaves both the previous snapshot
    /// and the in-memory state untouched.
    pub fn save(&self) -> CoreResult<()> {
        let json = {
            let data = self.read();
            serde_json::to_vec_pretty(&*data)?
        };

        let tmp = temp_sibling(&self.path);
        if let Err(e) = std::fs::write(&tmp, &json) {
            let _ = std::fs::remove_file(&tmp);
            return Err(CoreError::Internal(format!(
                "write {}: {e}",
                tmp.display()
            )));
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(CoreError::Internal(format!(
                "rename {} -> {}: {e}",
                tmp.display(),
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    /// Debounced save for high-frequency mutations; a second call within
    /// the window resets the timer.
    pub fn save_batched(&self) {
        if let Some(batcher) = self.batcher.get() {
            batcher.trigger();
        }
    }

    // ─── Workspaces ──────────────────────────────────────────────────────

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.read().workspaces.clone()
    }

    pub fn workspace(&self, id: &str) -> CoreResult<Workspace> {
        self.read()
            .workspaces
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("workspace '{id}'")))
    }

    /// Register a workspace and persist immediately; rolled back if the
    /// save fails.
    pub fn add_workspace(&self, workspace: Workspace) -> CoreResult<()> {
        let id = workspace.id.clone();
        {
            let mut data = self.write();
            if data.workspaces.iter().any(|w| w.id == id) {
                return Err(CoreError::Conflict(format!("workspace '{id}' exists")));
            }
            data.workspaces.push(workspace);
        }
        if let Err(e) = self.save() {
            self.write().workspaces.retain(|w| w.id != id);
            return Err(e);
        }
        Ok(())
    }

    pub fn update_workspace(
        &self,
        id: &str,
        f: impl FnOnce(&mut Workspace),
    ) -> CoreResult<()> {
        let mut data = self.write();
        let ws = data
            .workspaces
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("workspace '{id}'")))?;
        f(ws);
        Ok(())
    }

    pub fn remove_workspace(&self, id: &str) -> CoreResult<Workspace> {
        let removed = {
            let mut data = self.write();
            let idx = data
                .workspaces
                .iter()
                .position(|w| w.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("workspace '{id}'")))?;
            data.workspaces.remove(idx)
        };
        if let Err(e) = self.save() {
            self.write().workspaces.push(removed);
            return Err(e);
        }
        Ok(removed)
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    pub fn sessions(&self) -> Vec<Session> {
        self.read().sessions.clone()
    }

    pub fn session(&self, id: &str) -> CoreResult<Session> {
        self.read()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("session '{id}'")))
    }

    pub fn session_by_mux_name(&self, mux_session: &str) -> Option<Session> {
        self.read()
            .sessions
            .iter()
            .find(|s| s.mux_session == mux_session)
            .cloned()
    }

    pub fn add_session(&self, session: Session) -> CoreResult<()> {
        let id = session.id.clone();
        {
            let mut data = self.write();
            if data.sessions.iter().any(|s| s.id == id) {
                return Err(CoreError::Conflict(format!("session '{id}' exists")));
            }
            if data
                .sessions
                .iter()
                .any(|s| s.mux_session == session.mux_session)
            {
                return Err(CoreError::Conflict(format!(
                    "multiplexer session '{}' already bound",
                    session.mux_session
                )));
            }
            data.sessions.push(session);
        }
        if let Err(e) = self.save() {
            self.write().sessions.retain(|s| s.id != id);
            return Err(e);
        }
        Ok(())
    }

    pub fn update_session(&self, id: &str, f: impl FnOnce(&mut Session)) -> CoreResult<()> {
        let mut data = self.write();
        let session = data
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("session '{id}'")))?;
        f(session);
        Ok(())
    }

    pub fn remove_session(&self, id: &str) -> CoreResult<Session> {
        let removed = {
            let mut data = self.write();
            let idx = data
                .sessions
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("session '{id}'")))?;
            data.sessions.remove(idx)
        };
        if let Err(e) = self.save() {
            self.write().sessions.push(removed);
            return Err(e);
        }
        Ok(removed)
    }

    // ─── Remote hosts ────────────────────────────────────────────────────

    pub fn hosts(&self) -> Vec<RemoteHost> {
        self.read().remote_hosts.clone()
    }

    pub fn host(&self, id: &str) -> CoreResult<RemoteHost> {
        self.read()
            .remote_hosts
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("host '{id}'")))
    }

    pub fn host_by_flavor(&self, flavor: &str) -> Option<RemoteHost> {
        self.read()
            .remote_hosts
            .iter()
            .find(|h| h.flavor == flavor)
            .cloned()
    }

    pub fn add_host(&self, host: RemoteHost) -> CoreResult<()> {
        let id = host.id.clone();
        {
            let mut data = self.write();
            if data.remote_hosts.iter().any(|h| h.id == id) {
                return Err(CoreError::Conflict(format!("host '{id}' exists")));
            }
            data.remote_hosts.push(host);
        }
        if let Err(e) = self.save() {
            self.write().remote_hosts.retain(|h| h.id != id);
            return Err(e);
        }
        Ok(())
    }

    pub fn update_host(&self, id: &str, f: impl FnOnce(&mut RemoteHost)) -> CoreResult<()> {
        let mut data = self.write();
        let host = data
            .remote_hosts
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("host '{id}'")))?;
        f(host);
        Ok(())
    }

    /// Drop hosts past their expiry; returns the pruned records.
    pub fn prune_expired_hosts(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<RemoteHost> {
        let pruned = {
            let mut data = self.write();
            let (gone, kept): (Vec<_>, Vec<_>) = data
                .remote_hosts
                .drain(..)
                .partition(|h| h.is_expired(now));
            data.remote_hosts = kept;
            gone
        };
        if !pruned.is_empty() {
            if let Err(e) = self.save() {
                warn!("saving after host prune failed: {e}");
            }
        }
        pruned
    }

    // ─── Worktree bases ──────────────────────────────────────────────────

    pub fn bases(&self) -> Vec<WorktreeBase> {
        self.read().base_repos.clone()
    }

    pub fn base_for(&self, repo_url: &str) -> Option<WorktreeBase> {
        self.read()
            .base_repos
            .iter()
            .find(|b| b.repo_url == repo_url)
            .cloned()
    }

    pub fn add_base(&self, base: WorktreeBase) -> CoreResult<()> {
        {
            let mut data = self.write();
            if data.base_repos.iter().any(|b| b.repo_url == base.repo_url) {
                return Ok(());
            }
            data.base_repos.push(base);
        }
        self.save()
    }

    // ─── Flags ───────────────────────────────────────────────────────────

    pub fn needs_restart(&self) -> bool {
        self.read().needs_restart
    }

    pub fn set_needs_restart(&self, value: bool) -> CoreResult<()> {
        self.write().needs_restart = value;
        self.save()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn workspace(id: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            repo_url: "https://github.com/acme/widgets".to_string(),
            branch: id.to_string(),
            path: PathBuf::from(format!("/tmp/ws/{id}")),
            created_at: Utc::now(),
            remote_host_id: None,
            git_status: None,
        }
    }

    fn session(id: &str, mux: &str) -> Session {
        Session {
            id: id.to_string(),
            workspace_id: "w1".to_string(),
            run_target: "claude".to_string(),
            mux_session: mux.to_string(),
            created_at: Utc::now(),
            pane_pid: None,
            nickname: None,
            remote: None,
            last_output_at: None,
            last_signal: None,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = Store::load(&path).unwrap();
        store.add_workspace(workspace("alpha")).unwrap();
        store.add_session(session("s1", "schmux-s1")).unwrap();

        let reloaded = Store::load(&path).unwrap();
        assert_eq!(reloaded.workspaces().len(), 1);
        assert_eq!(reloaded.sessions().len(), 1);
        assert_eq!(reloaded.workspace("alpha").unwrap().branch, "alpha");
    }

    #[tokio::test]
    async fn test_reads_return_deep_copies() {
        let dir = TempDir::new().unwrap();
        let store = Store::load(dir.path().join("state.json")).unwrap();
        store.add_workspace(workspace("alpha")).unwrap();

        let mut copy = store.workspace("alpha").unwrap();
        copy.branch = "mutated".to_string();
        assert_eq!(store.workspace("alpha").unwrap().branch, "alpha");
    }

    #[tokio::test]
    async fn test_update_missing_entity_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = Store::load(dir.path().join("state.json")).unwrap();

        let err = store.update_workspace("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        let err = store.update_session("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_mux_session_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::load(dir.path().join("state.json")).unwrap();
        store.add_session(session("s1", "schmux-x")).unwrap();

        let err = store.add_session(session("s2", "schmux-x")).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(store.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_surfaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = Store::load(&path).unwrap_err();
        assert!(matches!(err, CoreError::Corrupted(_)));
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::load(&path).unwrap();
        store.add_workspace(workspace("alpha")).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_batched_save_coalesces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::load(&path).unwrap();

        store.add_workspace(workspace("alpha")).unwrap();
        store
            .update_workspace("alpha", |w| {
                w.git_status = Some(GitStatus {
                    dirty: true,
                    ..GitStatus::default()
                });
            })
            .unwrap();
        store.save_batched();
        store.save_batched();

        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        // Snapshot exists and still parses; transient field stayed out
        let reloaded = Store::load(&path).unwrap();
        assert!(reloaded.workspace("alpha").unwrap().git_status.is_none());
    }

    #[tokio::test]
    async fn test_prune_expired_hosts() {
        let dir = TempDir::new().unwrap();
        let store = Store::load(dir.path().join("state.json")).unwrap();
        let now = Utc::now();

        store
            .add_host(RemoteHost {
                id: "h1".to_string(),
                flavor: "devbox".to_string(),
                hostname: None,
                status: HostStatus::Connected,
                provisioned: true,
                connected_at: Some(now),
                expires_at: Some(now - chrono::Duration::minutes(1)),
            })
            .unwrap();
        store
            .add_host(RemoteHost {
                id: "h2".to_string(),
                flavor: "devbox".to_string(),
                hostname: None,
                status: HostStatus::Connected,
                provisioned: true,
                connected_at: Some(now),
                expires_at: Some(now + chrono::Duration::hours(1)),
            })
            .unwrap();

        let pruned = store.prune_expired_hosts(now);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, "h1");
        assert_eq!(store.hosts().len(), 1);
    }
}
