//! Filesystem watcher over git metadata.
//!
//! Watches each workspace's resolved git directory plus its `refs/` and
//! `logs/` subtrees, and — for worktrees — the shared base's `refs/` too.
//! The watch map is keyed `watched path -> workspace ids` because several
//! workspaces share one base. Events reset a per-workspace 1 s debounce;
//! on expiry the owner refreshes that workspace's git status. Watcher
//! failures are non-fatal: the slow status poll covers everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::debounce::Debouncer;
use crate::error::{CoreError, CoreResult};
use crate::git::resolve_git_dir;

const WATCH_DEBOUNCE: Duration = Duration::from_secs(1);

pub type OnChange = Arc<dyn Fn(String) + Send + Sync>;

struct WatchState {
    watcher: RecommendedWatcher,
    /// watched root -> workspace ids interested in it
    watched: HashMap<PathBuf, Vec<String>>,
    debouncers: HashMap<String, Debouncer>,
}

pub struct GitMetadataWatcher {
    state: Arc<Mutex<WatchState>>,
    on_change: OnChange,
}

impl GitMetadataWatcher {
    pub fn new(on_change: OnChange) -> CoreResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| CoreError::Internal(format!("watcher init: {e}")))?;

        let state = Arc::new(Mutex::new(WatchState {
            watcher,
            watched: HashMap::new(),
            debouncers: HashMap::new(),
        }));

        let this = Self {
            state: state.clone(),
            on_change,
        };
        tokio::spawn(dispatch_events(rx, state));
        Ok(this)
    }

    /// Register a workspace: watch its git directory (resolving the
    /// `gitdir:` pointer for worktrees), its `refs/` and `logs/` subtrees,
    /// and the shared base's `refs/` when one exists.
    pub fn add_workspace(&self, id: &str, workspace_path: &Path, base_path: Option<&Path>) {
        let Some(git_dir) = resolve_git_dir(workspace_path) else {
            warn!(id, path = %workspace_path.display(), "no git directory to watch");
            return;
        };

        let mut roots = vec![
            (git_dir.clone(), RecursiveMode::NonRecursive),
            (git_dir.join("refs"), RecursiveMode::Recursive),
            (git_dir.join("logs"), RecursiveMode::Recursive),
        ];
        if let Some(base) = base_path {
            roots.push((base.join("refs"), RecursiveMode::Recursive));
        }

        let mut state = self.state.lock().unwrap();
        for (root, mode) in roots {
            if !root.exists() {
                continue;
            }
            let install = {
                let ids = state.watched.entry(root.clone()).or_default();
                if !ids.contains(&id.to_string()) {
                    ids.push(id.to_string());
                }
                // First interested workspace installs the OS watch
                ids.len() == 1
            };
            if install {
                if let Err(e) = state.watcher.watch(&root, mode) {
                    warn!(root = %root.display(), "watch failed (poll covers it): {e}");
                }
            }
        }

        let on_change = self.on_change.clone();
        let id_owned = id.to_string();
        state.debouncers.entry(id.to_string()).or_insert_with(|| {
            Debouncer::new(WATCH_DEBOUNCE, move || on_change(id_owned.clone()))
        });
    }

    pub fn remove_workspace(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(debouncer) = state.debouncers.remove(id) {
            debouncer.abort();
        }
        let mut to_unwatch = Vec::new();
        for (root, ids) in &mut state.watched {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                to_unwatch.push(root.clone());
            }
        }
        for root in to_unwatch {
            state.watched.remove(&root);
            if let Err(e) = state.watcher.unwatch(&root) {
                debug!(root = %root.display(), "unwatch: {e}");
            }
        }
    }

    #[cfg(test)]
    fn watched_roots(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().watched.keys().cloned().collect()
    }
}

async fn dispatch_events(mut rx: mpsc::UnboundedReceiver<Event>, state: Arc<Mutex<WatchState>>) {
    while let Some(event) = rx.recv().await {
        let mut touched: Vec<String> = Vec::new();
        {
            let mut state = state.lock().unwrap();

            for path in &event.paths {
                // Owners of every watched root this path falls under
                let mut owner_ids: Vec<String> = Vec::new();
                for (root, ids) in &state.watched {
                    if path.starts_with(root) {
                        for id in ids {
                            if !owner_ids.contains(id) {
                                owner_ids.push(id.clone());
                            }
                        }
                    }
                }
                if owner_ids.is_empty() {
                    continue;
                }

                // A directory created under a watched root (a new remote
                // under refs/remotes/, say) joins the watch set
                if matches!(event.kind, EventKind::Create(_)) && path.is_dir() {
                    let path = path.clone();
                    let install = {
                        let entry = state.watched.entry(path.clone()).or_default();
                        if entry.is_empty() {
                            *entry = owner_ids.clone();
                            true
                        } else {
                            false
                        }
                    };
                    if install {
                        if let Err(e) = state.watcher.watch(&path, RecursiveMode::Recursive) {
                            debug!(path = %path.display(), "watch new subdirectory: {e}");
                        }
                    }
                }

                for id in owner_ids {
                    if !touched.contains(&id) {
                        touched.push(id);
                    }
                }
            }

            for id in &touched {
                if let Some(debouncer) = state.debouncers.get(id) {
                    debouncer.trigger();
                }
            }
        }
    }
}
