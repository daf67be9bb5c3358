//! Trailing-edge debouncer used for batched saves, broadcast coalescing,
//! and watcher quiet periods.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Runs `action` once per quiet period: every trigger within `window`
/// resets the timer, and the action fires when the window elapses with no
/// further triggers. Dropping the debouncer flushes a pending action.
#[derive(Debug)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn new<F>(window: Duration, mut action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(window) => {
                            action();
                            break;
                        }
                        more = rx.recv() => {
                            if more.is_none() {
                                // Sender dropped with a trigger pending
                                action();
                                return;
                            }
                        }
                    }
                }
            }
        });
        Self { tx, task }
    }

    /// Arm (or re-arm) the quiet-period timer.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Cancel without flushing.
    pub fn abort(&self) {
        self.task.abort();
    }
}
