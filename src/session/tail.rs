//! Per-session log tailing: follows the multiplexer's pipe file, lifts
//! signals out of the byte stream, forwards display bytes to the hub, and
//! rotates the log when it outgrows its cap.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::mux::Multiplexer;
use crate::notifications::NotificationService;
use crate::signal;
use crate::state::Store;

const TAIL_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy)]
pub struct TailLimits {
    pub max_bytes: u64,
    pub trim_bytes: u64,
}

pub struct SessionTail {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionTail {
    pub fn stop(&self) {
        self.stop.cancel();
        self.task.abort();
    }
}

pub struct TailContext {
    pub session_id: String,
    pub session_label: String,
    pub mux_session: String,
    pub log_path: PathBuf,
    pub mux: Arc<dyn Multiplexer>,
    pub store: Arc<Store>,
    pub hub: Arc<Hub>,
    pub notifier: Arc<NotificationService>,
    pub limits: TailLimits,
}

/// Follow the session log from its current end. Chunks are buffered to
/// line boundaries so markers split across reads still parse; a quiet
/// poll flushes whatever is held (the parser recognizes a marker at
/// end-of-input, so prompts are not stuck invisible).
pub fn spawn_tail(ctx: TailContext) -> SessionTail {
    let stop = CancellationToken::new();
    let stop_child = stop.clone();

    let task = tokio::spawn(async move {
        let mut offset = std::fs::metadata(&ctx.log_path).map(|m| m.len()).unwrap_or(0);
        let mut carry: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                () = stop_child.cancelled() => break,
                () = tokio::time::sleep(TAIL_POLL) => {}
            }

            let chunk = read_new_bytes(&ctx.log_path, &mut offset);
            if chunk.is_empty() {
                if !carry.is_empty() {
                    let held = std::mem::take(&mut carry);
                    process_bytes(&ctx, &held);
                }
                continue;
            }

            carry.extend_from_slice(&chunk);
            let split = carry.iter().rposition(|&b| b == b'\n').map(|p| p + 1);
            if let Some(split) = split {
                let complete: Vec<u8> = carry.drain(..split).collect();
                process_bytes(&ctx, &complete);
            }

            if offset > ctx.limits.max_bytes {
                match rotate_log(&ctx).await {
                    Ok(new_len) => offset = new_len,
                    Err(e) => warn!(session = ctx.session_id, "log rotation failed: {e}"),
                }
            }
        }
        debug!(session = %ctx.session_id, "tail stopped");
    });

    SessionTail { stop, task }
}

fn process_bytes(ctx: &TailContext, bytes: &[u8]) {
    let (signals, stripped) = signal::extract_and_strip(bytes);

    if !stripped.is_empty() {
        ctx.hub.publish_session_bytes(&ctx.session_id, &stripped);
    }

    let now = chrono::Utc::now();
    let result = ctx.store.update_session(&ctx.session_id, |session| {
        session.last_output_at = Some(now);
        if let Some(last) = signals.last() {
            session.last_signal = Some(last.clone());
        }
    });
    if result.is_err() {
        // Session removed out from under the tail; owner will stop us
        return;
    }

    for sig in &signals {
        ctx.notifier.on_signal(&ctx.session_label, sig);
    }

    ctx.store.save_batched();
    ctx.hub.trigger();
}

fn read_new_bytes(path: &Path, offset: &mut u64) -> Vec<u8> {
    let mut buf = Vec::new();
    let Ok(mut file) = std::fs::File::open(path) else {
        return buf;
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len < *offset {
        // Rotated or truncated underneath us
        *offset = 0;
    }
    if file.seek(SeekFrom::Start(*offset)).is_err() {
        return buf;
    }
    if file.read_to_end(&mut buf).is_ok() {
        *offset += buf.len() as u64;
    }
    buf
}

/// Rotate to a tail-preserving truncation: stop the pipe, keep the last
/// `trim_bytes`, swap atomically, restart the pipe.
async fn rotate_log(ctx: &TailContext) -> std::io::Result<u64> {
    let _ = ctx.mux.stop_tail(&ctx.mux_session).await;

    let tail = read_tail(&ctx.log_path, ctx.limits.trim_bytes)?;
    let tmp = ctx.log_path.with_extension("log.tmp");
    std::fs::write(&tmp, &tail)?;
    std::fs::rename(&tmp, &ctx.log_path)?;

    if let Err(e) = ctx
        .mux
        .start_tail_to_file(&ctx.mux_session, &ctx.log_path)
        .await
    {
        warn!(session = ctx.session_id, "restarting pipe after rotation failed: {e}");
    }
    debug!(session = %ctx.session_id, kept = tail.len(), "session log rotated");
    Ok(tail.len() as u64)
}

fn read_tail(path: &Path, keep: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(keep);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity(keep.min(len) as usize);
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Last `lines` lines of the log, markers stripped, for WebSocket
/// scrollback bootstrap.
pub fn bootstrap_scrollback(log_path: &Path, lines: u32) -> Vec<u8> {
    let Ok(bytes) = std::fs::read(log_path) else {
        return Vec::new();
    };
    let (_, stripped) = signal::extract_and_strip(&bytes);

    let mut starts: Vec<usize> = vec![0];
    for (i, &b) in stripped.iter().enumerate() {
        if b == b'\n' && i + 1 < stripped.len() {
            starts.push(i + 1);
        }
    }
    let keep_from = starts.len().saturating_sub(lines as usize);
    stripped[starts[keep_from]..].to_vec()
}
