//! Multiplexer adapter: a named persistent terminal session hosting a
//! command, abstracted over two variants — local (shells out to the host
//! tmux) and remote (control-mode protocol over a PTY) — behind one
//! capability set.

pub mod control;
pub mod control_parser;
pub mod keys;
pub mod tmux;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors specific to multiplexer operations
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("multiplexer is not installed or not in PATH")]
    NotInstalled,

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("connection is not running")]
    NotConnected,

    #[error("command timed out: {0}")]
    Timeout(String),

    #[error("command was cancelled: {0}")]
    Cancelled(String),

    #[error("protocol frame could not be parsed: {0}")]
    Protocol(String),

    #[error("multiplexer command failed: {0}")]
    CommandFailed(String),
}

/// Listing entry; window/pane IDs are populated by the remote variant.
#[derive(Debug, Clone)]
pub struct MuxSessionInfo {
    pub name: String,
    pub window_id: Option<String>,
    pub pane_id: Option<String>,
}

/// Per-pane output buffering. Subscribers that fall this far behind drop
/// frames rather than block the producer.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// A live subscription to a pane's output bytes.
pub struct OutputSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Capability set shared by the local and remote variants.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create a detached session running `command` in `work_dir`
    async fn create_session(
        &self,
        name: &str,
        work_dir: &Path,
        command: &str,
    ) -> Result<(), MuxError>;

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError>;

    async fn kill_session(&self, name: &str) -> Result<(), MuxError>;

    async fn list_sessions(&self) -> Result<Vec<MuxSessionInfo>, MuxError>;

    /// Entire scrollback including escape sequences
    async fn capture_pane_full(&self, name: &str) -> Result<Vec<u8>, MuxError>;

    /// Last `lines` of scrollback including escape sequences
    async fn capture_pane_tail(&self, name: &str, lines: u32) -> Result<Vec<u8>, MuxError>;

    /// Interpreted keys: literal runs and named keys per `keys::parse_keystrokes`
    async fn send_keys(&self, name: &str, keystrokes: &str) -> Result<(), MuxError>;

    /// Raw text forwarded verbatim with the literal flag
    async fn send_literal(&self, name: &str, text: &str) -> Result<(), MuxError>;

    /// Subscribe to a pane's output stream
    async fn subscribe_output(&self, pane: &str) -> Result<OutputSubscription, MuxError>;

    async fn unsubscribe_output(&self, pane: &str, id: u64);

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), MuxError>;

    /// Decouple the window size from attached clients
    async fn set_size_manual(&self, name: &str) -> Result<(), MuxError>;

    /// Mirror the pane's output into `path` from now on
    async fn start_tail_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError>;

    async fn stop_tail(&self, name: &str) -> Result<(), MuxError>;

    async fn is_tail_active(&self, name: &str) -> bool;

    async fn rename_session(&self, old: &str, new: &str) -> Result<(), MuxError>;

    /// PID of the command running inside the session's pane
    async fn pane_pid(&self, name: &str) -> Result<Option<u32>, MuxError>;
}

// ============================================================================
// Mock implementation for tests
// ============================================================================

#[derive(Debug, Clone)]
pub struct MockSession {
    pub work_dir: PathBuf,
    pub command: String,
    pub content: Vec<u8>,
    pub keys_sent: Vec<String>,
    pub literals_sent: Vec<String>,
    pub size: (u16, u16),
    pub tail_path: Option<PathBuf>,
}

/// In-memory multiplexer for unit tests (no real tmux required).
#[derive(Default)]
pub struct MockMux {
    pub sessions: Mutex<HashMap<String, MockSession>>,
    pub installed: Mutex<bool>,
    subscribers: Mutex<HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>,
    next_sub: Mutex<u64>,
    pub fail_rename: Mutex<bool>,
}

impl MockMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(true),
            ..Self::default()
        })
    }

    pub fn not_installed() -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(false),
            ..Self::default()
        })
    }

    fn check_installed(&self) -> Result<(), MuxError> {
        if *self.installed.lock().unwrap() {
            Ok(())
        } else {
            Err(MuxError::NotInstalled)
        }
    }

    /// Simulate pane output: appended to content, mirrored to the tail
    /// file, and pushed to subscribers.
    pub fn push_output(&self, name: &str, bytes: &[u8]) {
        let tail_path = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(name) else {
                return;
            };
            session.content.extend_from_slice(bytes);
            session.tail_path.clone()
        };
        if let Some(path) = tail_path {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path)
            {
                let _ = f.write_all(bytes);
            }
        }
        let subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get(name) {
            for (_, tx) in list {
                let _ = tx.try_send(bytes.to_vec());
            }
        }
    }
}

#[async_trait]
impl Multiplexer for MockMux {
    async fn create_session(
        &self,
        name: &str,
        work_dir: &Path,
        command: &str,
    ) -> Result<(), MuxError> {
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(name) {
            return Err(MuxError::SessionExists(name.to_string()));
        }
        sessions.insert(
            name.to_string(),
            MockSession {
                work_dir: work_dir.to_path_buf(),
                command: command.to_string(),
                content: Vec::new(),
                keys_sent: Vec::new(),
                literals_sent: Vec::new(),
                size: (80, 24),
                tail_path: None,
            },
        );
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError> {
        self.check_installed()?;
        Ok(self.sessions.lock().unwrap().contains_key(name))
    }

    async fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        self.check_installed()?;
        self.sessions
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))
    }

    async fn list_sessions(&self) -> Result<Vec<MuxSessionInfo>, MuxError> {
        self.check_installed()?;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .keys()
            .map(|name| MuxSessionInfo {
                name: name.clone(),
                window_id: None,
                pane_id: None,
            })
            .collect())
    }

    async fn capture_pane_full(&self, name: &str) -> Result<Vec<u8>, MuxError> {
        self.check_installed()?;
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.content.clone())
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))
    }

    async fn capture_pane_tail(&self, name: &str, lines: u32) -> Result<Vec<u8>, MuxError> {
        let full = self.capture_pane_full(name).await?;
        let text = String::from_utf8_lossy(&full);
        let all: Vec<&str> = text.lines().collect();
        let keep = all.len().saturating_sub(lines as usize);
        Ok(all[keep..].join("\n").into_bytes())
    }

    async fn send_keys(&self, name: &str, keystrokes: &str) -> Result<(), MuxError> {
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))?;
        session.keys_sent.push(keystrokes.to_string());
        Ok(())
    }

    async fn send_literal(&self, name: &str, text: &str) -> Result<(), MuxError> {
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))?;
        session.literals_sent.push(text.to_string());
        Ok(())
    }

    async fn subscribe_output(&self, pane: &str) -> Result<OutputSubscription, MuxError> {
        self.check_installed()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = {
            let mut next = self.next_sub.lock().unwrap();
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .unwrap()
            .entry(pane.to_string())
            .or_default()
            .push((id, tx));
        Ok(OutputSubscription { id, rx })
    }

    async fn unsubscribe_output(&self, pane: &str, id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(pane) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), MuxError> {
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))?;
        session.size = (cols, rows);
        Ok(())
    }

    async fn set_size_manual(&self, _name: &str) -> Result<(), MuxError> {
        self.check_installed()
    }

    async fn start_tail_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError> {
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))?;
        session.tail_path = Some(path.to_path_buf());
        Ok(())
    }

    async fn stop_tail(&self, name: &str) -> Result<(), MuxError> {
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::SessionNotFound(name.to_string()))?;
        session.tail_path = None;
        Ok(())
    }

    async fn is_tail_active(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|s| s.tail_path.is_some())
    }

    async fn rename_session(&self, old: &str, new: &str) -> Result<(), MuxError> {
        self.check_installed()?;
        if *self.fail_rename.lock().unwrap() {
            return Err(MuxError::CommandFailed("rename refused".to_string()));
        }
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(new) {
            return Err(MuxError::SessionExists(new.to_string()));
        }
        let session = sessions
            .remove(old)
            .ok_or_else(|| MuxError::SessionNotFound(old.to_string()))?;
        sessions.insert(new.to_string(), session);
        Ok(())
    }

    async fn pane_pid(&self, name: &str) -> Result<Option<u32>, MuxError> {
        self.check_installed()?;
        if self.sessions.lock().unwrap().contains_key(name) {
            Ok(Some(12345))
        } else {
            Err(MuxError::SessionNotFound(name.to_string()))
        }
    }
}
