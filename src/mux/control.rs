//! Remote multiplexer variant: drives the server's control mode over a
//! single PTY.
//!
//! The adapter is the sole reader of the PTY. Each chunk is teed, in
//! order, to (1) raw-output subscribers (the provisioning terminal view
//! before the protocol is active) and (2) the protocol parser. The
//! protocol assigns replies by command arrival order, so replies are
//! matched to the head of the FIFO pending queue — never by ID.
//!
//! A cancelled `execute` MUST NOT remove its entry from the queue: the
//! reply still arrives and is delivered into the orphaned buffered
//! channel, then discarded. Removing the entry would misalign every
//! subsequent reply.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::control_parser::{ControlEvent, ControlParser};
use super::keys::{parse_keystrokes, quote_arg, KeyChunk};
use super::{Multiplexer, MuxError, MuxSessionInfo, OutputSubscription, SUBSCRIBER_BUFFER};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A completed control-mode command reply.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub lines: Vec<String>,
    pub success: bool,
}

struct PendingEntry {
    tx: mpsc::Sender<CommandResult>,
}

struct Pending {
    running: bool,
    /// Set once a `%`-prefixed line has been observed
    active: bool,
    entries: VecDeque<PendingEntry>,
    /// Outbound commands held back until the protocol is active
    queued: Vec<String>,
}

struct TailHandle {
    pane_id: String,
    sub_id: u64,
    task: JoinHandle<()>,
}

struct ControlInner {
    stdin: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<Pending>,
    subscribers: Mutex<HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>,
    raw_subscribers: Mutex<Vec<(u64, mpsc::Sender<Vec<u8>>)>>,
    tails: Mutex<HashMap<String, TailHandle>>,
    /// Receivers of cancelled executes, kept open so their late replies
    /// land in the buffer instead of erroring; dropped wholesale on close
    orphans: Mutex<Vec<mpsc::Receiver<CommandResult>>>,
    next_sub: AtomicU64,
    unmatched_responses: AtomicU64,
    active_tx: watch::Sender<bool>,
    close: CancellationToken,
    command_timeout: Duration,
}

impl ControlInner {
    /// Append the entry and, when the protocol is live, write the command
    /// inside the same critical section so stdin order always matches
    /// queue order.
    fn enqueue(&self, cmd: &str, tx: mpsc::Sender<CommandResult>) -> Result<(), MuxError> {
        let mut pending = self.pending.lock().unwrap();
        if !pending.running {
            return Err(MuxError::NotConnected);
        }
        pending.entries.push_back(PendingEntry { tx });
        if pending.active {
            if let Err(e) = self.write_line(cmd) {
                // Never reached the server; popping here cannot misalign
                pending.entries.pop_back();
                return Err(e);
            }
        } else {
            pending.queued.push(cmd.to_string());
        }
        Ok(())
    }

    fn write_line(&self, cmd: &str) -> Result<(), MuxError> {
        let mut stdin = self.stdin.lock().unwrap();
        stdin
            .write_all(cmd.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .map_err(|e| MuxError::CommandFailed(format!("stdin write: {e}")))
    }

    fn handle_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::Active => {
                // Held-back commands flush under the pending lock so a
                // concurrent execute cannot slip its write in front of
                // entries that are ahead of it in the queue
                let mut pending = self.pending.lock().unwrap();
                pending.active = true;
                let queued = std::mem::take(&mut pending.queued);
                for cmd in queued {
                    if let Err(e) = self.write_line(&cmd) {
                        warn!("flushing queued command failed: {e}");
                    }
                }
                drop(pending);
                // send_replace updates the value even with no receivers yet
                self.active_tx.send_replace(true);
            }
            ControlEvent::Response { lines, success } => {
                let entry = self.pending.lock().unwrap().entries.pop_front();
                match entry {
                    Some(entry) => {
                        // Buffered(1): an orphaned receiver still absorbs
                        // the reply; a fully dropped one discards it
                        let _ = entry.tx.try_send(CommandResult { lines, success });
                    }
                    None => {
                        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
                        warn!("control-mode reply arrived with no pending command");
                    }
                }
            }
            ControlEvent::Output { pane_id, bytes } => {
                let subs = self.subscribers.lock().unwrap();
                if let Some(list) = subs.get(&pane_id) {
                    for (_, tx) in list {
                        // Slow subscribers drop frames, never block the parser
                        let _ = tx.try_send(bytes.clone());
                    }
                }
            }
            ControlEvent::Exit => {
                debug!("control-mode server sent exit");
                self.shutdown();
            }
            ControlEvent::Notification(line) => {
                debug!(%line, "control-mode notification");
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.running = false;
            pending.entries.clear();
        }
        self.orphans.lock().unwrap().clear();
        self.close.cancel();
    }
}

pub struct ControlMode {
    inner: Arc<ControlInner>,
    name: String,
}

impl ControlMode {
    /// Spawn `connect_command` on a fresh PTY and start the protocol
    /// pump. `setup` cancels the connection only while setup is in
    /// flight: a monitor task kills the child on cancellation and is
    /// disarmed once the protocol goes active, so the caller's deferred
    /// cancel cannot tear down the long-lived connection.
    pub fn connect(
        name: &str,
        connect_command: &str,
        cols: u16,
        rows: u16,
        command_timeout: Option<Duration>,
        setup: &CancellationToken,
    ) -> Result<Self, MuxError> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::CommandFailed(format!("openpty: {e}")))?;

        let mut builder = CommandBuilder::new("/bin/sh");
        builder.arg("-lc");
        builder.arg(connect_command);
        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| MuxError::CommandFailed(format!("spawn '{connect_command}': {e}")))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::CommandFailed(format!("clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::CommandFailed(format!("take PTY writer: {e}")))?;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            // PTY master stays alive through `pair.master` ownership below
        });

        let mux = Self::start(name, chunk_rx, writer, command_timeout);

        // Setup-scoped kill switch, disarmed on activation
        let mut killer = child.clone_killer();
        let mut active_rx = mux.inner.active_tx.subscribe();
        let close = mux.inner.close.clone();
        let setup = setup.clone();
        tokio::spawn(async move {
            // Keep the PTY master alive for the life of the connection
            let _master = pair.master;
            let _child = child;
            tokio::select! {
                () = setup.cancelled() => {
                    if !*active_rx.borrow() {
                        warn!("setup cancelled before protocol became active; killing connection");
                        let _ = killer.kill();
                    }
                }
                _ = active_rx.changed() => {}
                () = close.cancelled() => {
                    let _ = killer.kill();
                }
            }
            // Monitor disarmed; wait for close to reap the child
            close.cancelled().await;
            let _ = killer.kill();
        });

        Ok(mux)
    }

    /// Wire the protocol machinery to an arbitrary transport. Used by
    /// `connect` and by tests that drive the protocol without a PTY.
    pub fn start(
        name: &str,
        mut chunk_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        writer: Box<dyn Write + Send>,
        command_timeout: Option<Duration>,
    ) -> Self {
        let (active_tx, _) = watch::channel(false);
        let inner = Arc::new(ControlInner {
            stdin: Mutex::new(writer),
            pending: Mutex::new(Pending {
                running: true,
                active: false,
                entries: VecDeque::new(),
                queued: Vec::new(),
            }),
            subscribers: Mutex::new(HashMap::new()),
            raw_subscribers: Mutex::new(Vec::new()),
            tails: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
            next_sub: AtomicU64::new(0),
            unmatched_responses: AtomicU64::new(0),
            active_tx,
            close: CancellationToken::new(),
            command_timeout: command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        });

        let pump = inner.clone();
        tokio::spawn(async move {
            let mut parser = ControlParser::new();
            while let Some(chunk) = chunk_rx.recv().await {
                // Tee order matters: raw subscribers first, then protocol
                {
                    let raw = pump.raw_subscribers.lock().unwrap();
                    for (_, tx) in raw.iter() {
                        let _ = tx.try_send(chunk.clone());
                    }
                }
                for event in parser.feed(&chunk) {
                    pump.handle_event(event);
                }
            }
            debug!("control-mode transport closed");
            pump.shutdown();
        });

        Self {
            inner,
            name: name.to_string(),
        }
    }

    /// True once a protocol line has been observed.
    pub fn is_active(&self) -> bool {
        *self.inner.active_tx.subscribe().borrow()
    }

    /// Replies that arrived with an empty pending queue. A non-zero value
    /// means the server broke the FIFO contract.
    pub fn unmatched_responses(&self) -> u64 {
        self.inner.unmatched_responses.load(Ordering::Relaxed)
    }

    pub fn connection_name(&self) -> &str {
        &self.name
    }

    /// Wait until the protocol goes active (a `%` line arrives).
    pub async fn wait_active(&self, timeout: Duration) -> Result<(), MuxError> {
        let mut rx = self.inner.active_tx.subscribe();
        if *rx.borrow() {
            return Ok(());
        }
        let wait = async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return Ok(());
                }
            }
            Err(MuxError::NotConnected)
        };
        tokio::select! {
            result = tokio::time::timeout(timeout, wait) => match result {
                Ok(inner) => inner,
                Err(_) => Err(MuxError::Timeout("waiting for control mode".to_string())),
            },
            () = self.inner.close.cancelled() => Err(MuxError::NotConnected),
        }
    }

    /// Subscribe to raw PTY bytes (pre-protocol provisioning view).
    pub fn subscribe_raw(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.raw_subscribers.lock().unwrap().push((id, tx));
        OutputSubscription { id, rx }
    }

    pub fn unsubscribe_raw(&self, id: u64) {
        self.inner
            .raw_subscribers
            .lock()
            .unwrap()
            .retain(|(sub_id, _)| *sub_id != id);
    }

    /// Run one control-mode command and wait for its FIFO-matched reply.
    pub async fn execute(&self, cmd: &str) -> Result<CommandResult, MuxError> {
        self.execute_with_token(cmd, &CancellationToken::new()).await
    }

    /// As `execute`, racing an external cancellation token. Cancellation
    /// (or timeout) leaves the pending entry in place and parks the
    /// receiver in the orphan registry.
    pub async fn execute_with_token(
        &self,
        cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, MuxError> {
        let (tx, mut rx) = mpsc::channel(1);
        self.inner.enqueue(cmd, tx)?;

        tokio::select! {
            reply = tokio::time::timeout(self.inner.command_timeout, rx.recv()) => {
                match reply {
                    Ok(Some(result)) => Ok(result),
                    Ok(None) => Err(MuxError::NotConnected),
                    Err(_) => {
                        self.inner.orphans.lock().unwrap().push(rx);
                        Err(MuxError::Timeout(cmd.to_string()))
                    }
                }
            }
            () = cancel.cancelled() => {
                self.inner.orphans.lock().unwrap().push(rx);
                Err(MuxError::Cancelled(cmd.to_string()))
            }
            () = self.inner.close.cancelled() => Err(MuxError::NotConnected),
        }
    }

    async fn execute_ok(&self, cmd: &str) -> Result<CommandResult, MuxError> {
        let result = self.execute(cmd).await?;
        if !result.success {
            return Err(MuxError::CommandFailed(format!(
                "{cmd}: {}",
                result.lines.join(" ")
            )));
        }
        Ok(result)
    }

    /// Tear the connection down and close every orphaned channel.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    async fn pane_id_for(&self, name: &str) -> Result<String, MuxError> {
        let result = self
            .execute_ok(&format!("display-message -p -t ={name} \"#{{pane_id}}\""))
            .await?;
        result
            .lines
            .first()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| MuxError::Protocol("empty pane_id reply".to_string()))
    }
}

#[async_trait]
impl Multiplexer for ControlMode {
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
        self.execute_ok(&format!(
            "new-session -d -s {} -c {} {}",
            quote_arg(name),
            quote_arg(&dir),
            quote_arg(command)
        ))
        .await?;
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError> {
        let result = self.execute(&format!("has-session -t ={name}")).await?;
        Ok(result.success)
    }

    async fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        let result = self.execute(&format!("kill-session -t ={name}")).await?;
        if !result.success {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.inner.tails.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<MuxSessionInfo>, MuxError> {
        let result = self
            .execute("list-sessions -F \"#{session_name}\t#{window_id}\t#{pane_id}\"")
            .await?;
        if !result.success {
            return Ok(Vec::new());
        }
        Ok(result
            .lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(|line| {
                let mut parts = line.split('\t');
                MuxSessionInfo {
                    name: parts.next().unwrap_or_default().to_string(),
                    window_id: parts.next().map(String::from).filter(|s| !s.is_empty()),
                    pane_id: parts.next().map(String::from).filter(|s| !s.is_empty()),
                }
            })
            .collect())
    }

    async fn capture_pane_full(&self, name: &str) -> Result<Vec<u8>, MuxError> {
        let result = self
            .execute_ok(&format!("capture-pane -p -e -t ={name} -S -"))
            .await?;
        Ok(result.lines.join("\n").into_bytes())
    }

    async fn capture_pane_tail(&self, name: &str, lines: u32) -> Result<Vec<u8>, MuxError> {
        let result = self
            .execute_ok(&format!("capture-pane -p -e -t ={name} -S -{lines}"))
            .await?;
        Ok(result.lines.join("\n").into_bytes())
    }

    async fn send_keys(&self, name: &str, keystrokes: &str) -> Result<(), MuxError> {
        for chunk in parse_keystrokes(keystrokes) {
            match chunk {
                KeyChunk::Literal(text) => {
                    self.execute_ok(&format!(
                        "send-keys -t ={name} -l -- {}",
                        quote_arg(&text)
                    ))
                    .await?;
                }
                KeyChunk::Named(key) => {
                    self.execute_ok(&format!("send-keys -t ={name} {key}")).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_literal(&self, name: &str, text: &str) -> Result<(), MuxError> {
        self.execute_ok(&format!("send-keys -t ={name} -l -- {}", quote_arg(text)))
            .await?;
        Ok(())
    }

    async fn subscribe_output(&self, pane: &str) -> Result<OutputSubscription, MuxError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(pane.to_string())
            .or_default()
            .push((id, tx));
        Ok(OutputSubscription { id, rx })
    }

    async fn unsubscribe_output(&self, pane: &str, id: u64) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(pane) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), MuxError> {
        self.execute_ok(&format!("resize-window -t ={name} -x {cols} -y {rows}"))
            .await?;
        Ok(())
    }

    async fn set_size_manual(&self, name: &str) -> Result<(), MuxError> {
        self.execute_ok(&format!("set-option -w -t ={name} window-size manual"))
            .await?;
        Ok(())
    }

    async fn start_tail_to_file(&self, name: &str, path: &Path) -> Result<(), MuxError> {
        if self.inner.tails.lock().unwrap().contains_key(name) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MuxError::CommandFailed(e.to_string()))?;
        }

        let pane_id = self.pane_id_for(name).await?;
        let mut sub = self.subscribe_output(&pane_id).await?;
        let sub_id = sub.id;
        let file_path = path.to_path_buf();
        let task = tokio::spawn(async move {
            while let Some(chunk) = sub.rx.recv().await {
                let result = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file_path)
                    .and_then(|mut f| f.write_all(&chunk));
                if let Err(e) = result {
                    warn!(path = %file_path.display(), "session log append failed: {e}");
                }
            }
        });

        self.inner.tails.lock().unwrap().insert(
            name.to_string(),
            TailHandle {
                pane_id,
                sub_id,
                task,
            },
        );
        Ok(())
    }

    async fn stop_tail(&self, name: &str) -> Result<(), MuxError> {
        let handle = self.inner.tails.lock().unwrap().remove(name);
        if let Some(handle) = handle {
            self.unsubscribe_output(&handle.pane_id, handle.sub_id).await;
            handle.task.abort();
        }
        Ok(())
    }

    async fn is_tail_active(&self, name: &str) -> bool {
        self.inner.tails.lock().unwrap().contains_key(name)
    }

    async fn rename_session(&self, old: &str, new: &str) -> Result<(), MuxError> {
        self.execute_ok(&format!("rename-session -t ={old} {}", quote_arg(new)))
            .await?;
        let mut tails = self.inner.tails.lock().unwrap();
        if let Some(handle) = tails.remove(old) {
            tails.insert(new.to_string(), handle);
        }
        Ok(())
    }

    async fn pane_pid(&self, name: &str) -> Result<Option<u32>, MuxError> {
        let result = self
            .execute_ok(&format!("display-message -p -t ={name} \"#{{pane_pid}}\""))
            .await?;
        Ok(result
            .lines
            .first()
            .and_then(|l| l.trim().parse::<u32>().ok()))
    }
}
