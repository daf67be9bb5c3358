//! Broadcast hub: fan-out of consolidated snapshots to WebSocket clients.
//!
//! One dashboard channel carries typed envelopes (the full `sessions`
//! snapshot, then one message per active long-running operation); per-
//! session channels carry raw pane bytes. Dashboard sends tolerate brief
//! blocking through small buffered channels; terminal-byte subscribers
//! that cannot keep up drop frames, never blocking the producer. Dashboard
//! triggers coalesce through a 500 ms debounce: the last state at the end
//! of a burst is what ships.

pub mod messages;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::warn;

use crate::debounce::Debouncer;
use crate::state::Store;
use messages::{DashboardMessage, SessionView, WorkspaceView};

const BROADCAST_DEBOUNCE: Duration = Duration::from_millis(500);
/// Small block-tolerant buffer for state snapshots
const DASHBOARD_BUFFER: usize = 16;
/// Per-session byte frames; overflow drops
const SESSION_BUFFER: usize = 256;

pub struct Hub {
    store: Arc<Store>,
    dashboard_subs: Mutex<Vec<(u64, mpsc::Sender<String>)>>,
    session_subs: Mutex<HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>,
    /// Active operation snapshots keyed by workspace ID, pre-serialized
    /// by their owner
    operations: Mutex<BTreeMap<String, serde_json::Value>>,
    debouncer: OnceCell<Debouncer>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let hub = Arc::new(Self {
            store,
            dashboard_subs: Mutex::new(Vec::new()),
            session_subs: Mutex::new(HashMap::new()),
            operations: Mutex::new(BTreeMap::new()),
            debouncer: OnceCell::new(),
            next_id: AtomicU64::new(0),
        });

        let weak: Weak<Hub> = Arc::downgrade(&hub);
        let debouncer = Debouncer::new(BROADCAST_DEBOUNCE, move || {
            if let Some(hub) = weak.upgrade() {
                hub.broadcast_now();
            }
        });
        let _ = hub.debouncer.set(debouncer);
        hub
    }

    /// Request a dashboard broadcast; bursts coalesce to one send.
    pub fn trigger(&self) {
        if let Some(debouncer) = self.debouncer.get() {
            debouncer.trigger();
        }
    }

    // ─── Dashboard channel ───────────────────────────────────────────────

    /// Subscribe and immediately receive the current snapshot.
    pub fn subscribe_dashboard(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(DASHBOARD_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let initial = self.compose_messages();
        let tx_initial = tx.clone();
        tokio::spawn(async move {
            for payload in initial {
                if tx_initial.send(payload).await.is_err() {
                    return;
                }
            }
        });

        self.dashboard_subs.lock().unwrap().push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe_dashboard(&self, id: u64) {
        self.dashboard_subs
            .lock()
            .unwrap()
            .retain(|(sub_id, _)| *sub_id != id);
    }

    fn broadcast_now(&self) {
        let payloads = self.compose_messages();
        let subs: Vec<mpsc::Sender<String>> = self
            .dashboard_subs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tx)| tx.clone())
            .collect();

        for tx in subs {
            let payloads = payloads.clone();
            tokio::spawn(async move {
                for payload in payloads {
                    if tx.send(payload).await.is_err() {
                        // Receiver gone; the unsubscribe will clean up
                        return;
                    }
                }
            });
        }
    }

    /// The `sessions` snapshot followed by one message per active
    /// operation, all serialized to wire text.
    fn compose_messages(&self) -> Vec<String> {
        let workspaces: Vec<WorkspaceView> = self
            .store
            .workspaces()
            .into_iter()
            .map(WorkspaceView::from)
            .collect();
        let sessions: Vec<SessionView> = self
            .store
            .sessions()
            .into_iter()
            .map(SessionView::from)
            .collect();

        let mut payloads = Vec::new();
        let snapshot = DashboardMessage::Sessions {
            workspaces,
            sessions,
            needs_restart: self.store.needs_restart(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => payloads.push(json),
            Err(e) => warn!("serializing sessions snapshot failed: {e}"),
        }

        for (workspace_id, operation) in self.operations.lock().unwrap().iter() {
            let msg = DashboardMessage::LinearSyncResolveConflict {
                workspace_id: workspace_id.clone(),
                operation: operation.clone(),
            };
            match serde_json::to_string(&msg) {
                Ok(json) => payloads.push(json),
                Err(e) => warn!("serializing operation snapshot failed: {e}"),
            }
        }

        payloads
    }

    // ─── Operation snapshots ─────────────────────────────────────────────

    /// Owners push a complete serialized snapshot after every mutation.
    pub fn update_operation(&self, workspace_id: &str, snapshot: serde_json::Value) {
        self.operations
            .lock()
            .unwrap()
            .insert(workspace_id.to_string(), snapshot);
        self.trigger();
    }

    pub fn remove_operation(&self, workspace_id: &str) {
        self.operations.lock().unwrap().remove(workspace_id);
        self.trigger();
    }

    // ─── Per-session channels ────────────────────────────────────────────

    pub fn subscribe_session(&self, session_id: &str) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.session_subs
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe_session(&self, session_id: &str, id: u64) {
        let mut subs = self.session_subs.lock().unwrap();
        if let Some(list) = subs.get_mut(session_id) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subs.remove(session_id);
            }
        }
    }

    /// Push live pane bytes; slow subscribers drop this frame.
    pub fn publish_session_bytes(&self, session_id: &str, bytes: &[u8]) {
        let subs = self.session_subs.lock().unwrap();
        if let Some(list) = subs.get(session_id) {
            for (_, tx) in list {
                let _ = tx.try_send(bytes.to_vec());
            }
        }
    }
}
