//! Local multiplexer variant: shells out to the host tmux binary.
//!
//! Pane-output subscriptions are backed by the pipe-pane tail file, so
//! `start_tail_to_file` must be active before subscribing.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::keys::{parse_keystrokes, KeyChunk};
use super::{Multiplexer, MuxError, MuxSessionInfo, OutputSubscription, SUBSCRIBER_BUFFER};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const TAIL_POLL: Duration = Duration::from_millis(100);

type SubscriberMap = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>>;

pub struct TmuxMux {
    /// Dedicated server socket so managed sessions never collide with the
    /// user's own tmux server
    socket_name: Option<String>,
    tails: Mutex<HashMap<String, PathBuf>>,
    subscribers: SubscriberMap,
    next_sub: Mutex<u64>,
}

impl TmuxMux {
    pub fn new(socket_name: Option<String>) -> Self {
        Self {
            socket_name,
            tails: Mutex::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_sub: Mutex::new(0),
        }
    }

    /// Preflight: the binary must exist on PATH
    pub fn check_available() -> Result<(), MuxError> {
        which::which("tmux").map(|_| ()).map_err(|_| MuxError::NotInstalled)
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<Output, MuxError> {
        let mut cmd = Command::new("tmux");
        if let Some(ref socket) = self.socket_name {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args).stdin(Stdio::null());
        debug!(?args, "Running tmux command");

        let fut = cmd.output();
        let output = tokio::time::timeout(COMMAND_TIMEOUT, fut)
            .await
            .map_err(|_| MuxError::Timeout(format!("tmux {}", args.first().unwrap_or(&""))))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MuxError::NotInstalled
                } else {
                    MuxError::CommandFailed(e.to_string())
                }
            })?;
        Ok(output)
    }

    async fn run_tmux_ok(&self, args: &[&str]) -> Result<Output, MuxError> {
        let output = self.run_tmux(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MuxError::CommandFailed(format!(
                "tmux {}: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Exact-match session target (`=` prevents prefix matching)
    fn target(name: &str) -> String {
        format!("={name}")
    }

    /// One pump per pane reads new tail-file bytes and fans them out.
    /// Exits when the last subscriber for the pane unsubscribes.
    fn spawn_tail_pump(&self, pane: String, path: PathBuf) {
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            let mut offset = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            loop {
                {
                    let subs = subscribers.lock().unwrap();
                    match subs.get(&pane) {
                        Some(list) if !list.is_empty() => {}
                        _ => break,
                    }
                }
                let chunk = read_from(&path, &mut offset);
                if !chunk.is_empty() {
                    let subs = subscribers.lock().unwrap();
                    if let Some(list) = subs.get(&pane) {
                        for (_, tx) in list {
                            // Slow subscribers drop frames, never block
                            let _ = tx.try_send(chunk.clone());
                        }
                    }
                }
                tokio::time::sleep(TAIL_POLL).await;
            }
            debug!(%pane, "tail pump stopped");
        });
    }
}

fn read_from(path: &Path, offset: &mut u64) -> Vec<u8> {
    let mut buf = Vec::new();
    let Ok(mut file) = std::fs::File::open(path) else {
        return buf;
    };
    if file.seek(SeekFrom::Start(*offset)).is_err() {
        return buf;
    }
    if file.read_to_end(&mut buf).is_ok() {
        *offset += buf.len() as u64;
    }
    buf
}

#[async_trait]
impl Multiplexer for TmuxMux {
    async fn create_session(
        &self,
        name: &str,
        work_dir: &Path,
        command: &str,
    ) -> Result<(), MuxError> {
        if self.session_exists(name).await? {
            return Err(MuxError::SessionExists(name.to_string()));
        }
        let dir = work_dir.to_string_lossy();
        self.run_tmux_ok(&["new-session", "-d", "-s", name, "-c", &dir, command])
            .await?;
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError> {
        let output = self
            .run_tmux(&["has-session", "-t", &Self::target(name)])
            .await;
        match output {
            Ok(out) => Ok(out.status.success()),
            Err(MuxError::NotInstalled) => Err(MuxError::NotInstalled),
            Err(_) => Ok(false),
        }
    }

    async fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        let output = self
            .run_tmux(&["kill-session", "-t", &Self::target(name)])
            .await?;
        if !output.status.success() {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.tails.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<MuxSessionInfo>, MuxError> {
        let output = self
            .run_tmux(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !output.status.success() {
            // Server not running means no sessions
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|name| MuxSessionInfo {
                name: name.to_string(),
                window_id: None,
                pane_id: None,
            })
            .collect())
    }

    async fn capture_pane_full(&self, name: &str) -> Result<Vec<u8>, MuxError> {
        let output = self
            .run_tmux_ok(&[
                "capture-pane",
                "-p",
                "-e",
                "-t",
                &Self::target(name),
                "-S",
                "-",
            ])
            .await?;
        Ok(output.stdout)
    }

    async fn capture_pane_tail(&self, name: &str, lines: u32) -> Result<Vec<u8>, MuxError> {
        let start = format!("-{lines}");
        let output = self
            .run_tmux_ok(&[
                "capture-pane",
                "-p",
                "-e",
                "-t",
                &Self::target(name),
                "-S",
                &start,
            ])
            .await?;
        Ok(output.stdout)
    }

    async fn send_keys(&self, name: &str, keystrokes: &str) -> Result<(), MuxError> {
        let target = Self::target(name);
        for chunk in parse_keystrokes(keystrokes) {
            match chunk {
                KeyChunk::Literal(text) => {
                    self.run_tmux_ok(&["send-keys", "-t", &target, "-l", "--", &text])
                        .await?;
                }
                KeyChunk::Named(key) => {
                    self.run_tmux_ok(&["send-keys", "-t", &target, &key]).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_literal(&self, name: &str, text: &str) -> Result<(), MuxError> {
        self.run_tmux_ok(&["send-keys", "-t", &Self::target(name), "-l", "--", text])
            .await?;
        Ok(())
    }

    async fn subscribe_output(&self, pane: &str) -> Result<OutputSubscription, MuxError> {
        let path = self
            .tails
            .lock()
            .unwrap()
            .get(pane)
            .cloned()
            .ok_or_else(|| {
                MuxError::CommandFailed(format!("no active tail for session '{pane}'"))
            })?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = {
            let mut next = self.next_sub.lock().unwrap();
            *next += 1;
            *next
        };
        let start_pump = {
            let mut subs = self.subscribers.lock().unwrap();
            let list = subs.entry(pane.to_string()).or_default();
            let first = list.is_empty();
            list.push((id, tx));
            first
        };
        if start_pump {
            self.spawn_tail_pump(pane.to_string(), path);
        }
        Ok(OutputSubscription { id, rx })
    }

    async fn unsubscribe_output(&self, pane: &str, id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(pane) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), MuxError> {
        self.run_tmux_ok(&[
            "resize-window",
            "-t",
            &Self::target(name),
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn set_size_manual(&self, name: &str) -> Result<(), MuxError> {
        self.run_tmux_ok(&[
            "set-option",
            "-w",
            "-t",
            &Self::target(name),
            "window-size",
            "manual",
        ])
        .await?;
        Ok(())
    }

    async fn start_tail_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MuxError::CommandFailed(e.to_string()))?;
        }
        let pipe_cmd = format!("cat >> '{}'", path.display());
        self.run_tmux_ok(&["pipe-pane", "-t", &Self::target(name), &pipe_cmd])
            .await?;
        self.tails
            .lock()
            .unwrap()
            .insert(name.to_string(), path.to_path_buf());
        Ok(())
    }

    async fn stop_tail(&self, name: &str) -> Result<(), MuxError> {
        // pipe-pane with no command stops the pipe
        self.run_tmux_ok(&["pipe-pane", "-t", &Self::target(name)])
            .await?;
        self.tails.lock().unwrap().remove(name);
        Ok(())
    }

    async fn is_tail_active(&self, name: &str) -> bool {
        self.tails.lock().unwrap().contains_key(name)
    }

    async fn rename_session(&self, old: &str, new: &str) -> Result<(), MuxError> {
        self.run_tmux_ok(&["rename-session", "-t", &Self::target(old), new])
            .await?;
        let mut tails = self.tails.lock().unwrap();
        if let Some(path) = tails.remove(old) {
            tails.insert(new.to_string(), path);
        }
        Ok(())
    }

    async fn pane_pid(&self, name: &str) -> Result<Option<u32>, MuxError> {
        let output = self
            .run_tmux_ok(&[
                "display-message",
                "-p",
                "-t",
                &Self::target(name),
                "#{pane_pid}",
            ])
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        match text.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                warn!(session = name, raw = %text.trim(), "unparseable pane_pid");
                Ok(None)
            }
        }
    }
}
