//! One-shot LLM collaborator seam.
//!
//! The core consumes "run a one-shot LLM call" as an interface: a target
//! name, a prompt, and a deadline in; a single text document out. The
//! production implementation shells out to the configured run target's
//! command in print mode with the prompt on stdin.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::{Config, RunTarget};
use crate::error::{CoreError, CoreResult};
use crate::session::run_target::resolve_target;

#[async_trait]
pub trait OneShotLlm: Send + Sync {
    async fn execute(&self, target: &str, prompt: &str, timeout: Duration) -> CoreResult<String>;
}

/// Runs the target's command once, non-interactively: prompt on stdin,
/// response on stdout.
pub struct CommandLlm {
    config: Arc<Config>,
}

impl CommandLlm {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl OneShotLlm for CommandLlm {
    async fn execute(&self, target: &str, prompt: &str, timeout: Duration) -> CoreResult<String> {
        let run_target = self
            .config
            .run_target(target)
            .ok_or_else(|| CoreError::NotFound(format!("run target '{target}'")))?;
        if matches!(run_target, RunTarget::Command { .. }) {
            return Err(CoreError::InvalidArgument(format!(
                "run target '{target}' is a shell command, not a promptable agent"
            )));
        }

        let resolved = resolve_target(&self.config, target)?;
        debug!(target, "one-shot LLM call");

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&resolved.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &resolved.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::Unavailable(format!("spawn '{target}': {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| CoreError::Internal(format!("write prompt: {e}")))?;
            drop(stdin);
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| CoreError::Timeout(format!("llm target '{target}' after {timeout:?}")))?
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        if !output.status.success() {
            return Err(CoreError::Internal(format!(
                "llm target '{target}' exited {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Canned-response implementation for tests.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<Vec<CoreResult<String>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: CoreResult<String>) {
        self.responses.lock().unwrap().push(response);
    }
}

#[async_trait]
impl OneShotLlm for MockLlm {
    async fn execute(&self, _target: &str, prompt: &str, _timeout: Duration) -> CoreResult<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(CoreError::Unavailable("no canned response".to_string()));
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_llm_returns_in_order() {
        let llm = MockLlm::new();
        llm.push_response(Ok("first".to_string()));
        llm.push_response(Ok("second".to_string()));

        let a = llm.execute("t", "p1", Duration::from_secs(1)).await.unwrap();
        let b = llm.execute("t", "p2", Duration::from_secs(1)).await.unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("first", "second"));
        assert_eq!(llm.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_command_llm_unknown_target() {
        let llm = CommandLlm::new(Arc::new(Config::default()));
        let err = llm
            .execute("ghost", "prompt", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
