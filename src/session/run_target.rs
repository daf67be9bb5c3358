//! Run-target resolution: from a target name (plus an optional prompt or
//! resume hint) to the exact shell command and environment handed to the
//! multiplexer.

use std::collections::HashMap;

use crate::config::{Config, ModelSelector, RunTarget};
use crate::error::{CoreError, CoreResult};

/// What the caller wants to start inside the pane.
#[derive(Debug, Clone)]
pub enum SpawnRequest {
    /// A named target, with a prompt when the target accepts one
    Target {
        name: String,
        prompt: Option<String>,
    },
    /// Resume the agent's previous conversation in this workspace
    Resume { name: String },
}

impl SpawnRequest {
    pub fn target_name(&self) -> &str {
        match self {
            SpawnRequest::Target { name, .. } | SpawnRequest::Resume { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Promptable,
    Command,
}

/// A target resolved down to its executable form.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub command: String,
    pub env: HashMap<String, String>,
    pub kind: TargetKind,
    pub resume_command: Option<String>,
}

/// Resolve `name`, flattening model presets onto their base tool. A model
/// preset selects its model via an env var or a CLI flag depending on the
/// variant, never by inspecting the tool name.
pub fn resolve_target(config: &Config, name: &str) -> CoreResult<ResolvedTarget> {
    let target = config
        .run_target(name)
        .ok_or_else(|| CoreError::NotFound(format!("run target '{name}'")))?;

    match target {
        RunTarget::Promptable {
            command,
            env,
            resume_command,
            ..
        } => Ok(ResolvedTarget {
            command: command.clone(),
            env: env.clone(),
            kind: TargetKind::Promptable,
            resume_command: resume_command.clone(),
        }),
        RunTarget::Command { command, .. } => Ok(ResolvedTarget {
            command: command.clone(),
            env: HashMap::new(),
            kind: TargetKind::Command,
            resume_command: None,
        }),
        RunTarget::Model {
            base_tool,
            model,
            selector,
            ..
        } => {
            let mut base = resolve_target(config, base_tool)?;
            if base.kind != TargetKind::Promptable {
                return Err(CoreError::InvalidArgument(format!(
                    "model preset '{name}' must layer on a promptable tool, '{base_tool}' is not"
                )));
            }
            match selector {
                ModelSelector::Env { var } => {
                    base.env.insert(var.clone(), model.clone());
                }
                ModelSelector::Flag { flag } => {
                    base.command = format!("{} {flag} {}", base.command, shell_quote(model));
                }
            }
            Ok(base)
        }
    }
}

/// Assemble the final shell command for the multiplexer pane.
pub fn wrap_for_mux(resolved: &ResolvedTarget, request: &SpawnRequest) -> CoreResult<String> {
    let body = match request {
        SpawnRequest::Target { prompt, .. } => match (&resolved.kind, prompt) {
            (TargetKind::Promptable, Some(prompt)) => {
                format!("{} {}", resolved.command, shell_quote(prompt))
            }
            (TargetKind::Promptable, None) | (TargetKind::Command, None) => {
                resolved.command.clone()
            }
            (TargetKind::Command, Some(_)) => {
                return Err(CoreError::InvalidArgument(
                    "shell-command targets do not take a prompt".to_string(),
                ));
            }
        },
        SpawnRequest::Resume { name } => {
            let resume = resolved.resume_command.as_ref().ok_or_else(|| {
                CoreError::InvalidArgument(format!("run target '{name}' has no resume command"))
            })?;
            format!("{} {resume}", resolved.command)
        }
    };

    if resolved.env.is_empty() {
        return Ok(body);
    }

    // Env overrides ride in front of the command so the multiplexer's
    // shell exports them for the agent only
    let mut sorted: Vec<_> = resolved.env.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let exports: Vec<String> = sorted
        .into_iter()
        .map(|(k, v)| format!("{k}={}", shell_quote(v)))
        .collect();
    Ok(format!("env {} {body}", exports.join(" ")))
}

/// POSIX single-quote escaping.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_targets() -> Config {
        serde_json::from_str(
            r#"{
            "run_targets": [
                {"type": "promptable", "name": "claude", "command": "claude",
                 "env": {"CLAUDE_NO_AUTOUPDATE": "1"}, "resume_command": "--resume"},
                {"type": "promptable", "name": "gemini", "command": "gemini"},
                {"type": "command", "name": "shell", "command": "bash -l"},
                {"type": "model", "name": "claude-opus", "base_tool": "claude",
                 "model": "opus", "selector": {"kind": "flag", "flag": "-m"}},
                {"type": "model", "name": "gemini-pro", "base_tool": "gemini",
                 "model": "gemini-2.0-pro", "selector": {"kind": "env", "var": "GEMINI_MODEL"}},
                {"type": "model", "name": "bad", "base_tool": "shell",
                 "model": "x", "selector": {"kind": "flag", "flag": "-m"}}
            ]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_promptable_with_prompt() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "claude").unwrap();
        let cmd = wrap_for_mux(
            &resolved,
            &SpawnRequest::Target {
                name: "claude".to_string(),
                prompt: Some("fix the tests".to_string()),
            },
        )
        .unwrap();
        assert_eq!(cmd, "env CLAUDE_NO_AUTOUPDATE='1' claude 'fix the tests'");
    }

    #[test]
    fn test_command_passes_through() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "shell").unwrap();
        let cmd = wrap_for_mux(
            &resolved,
            &SpawnRequest::Target {
                name: "shell".to_string(),
                prompt: None,
            },
        )
        .unwrap();
        assert_eq!(cmd, "bash -l");
    }

    #[test]
    fn test_command_rejects_prompt() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "shell").unwrap();
        let err = wrap_for_mux(
            &resolved,
            &SpawnRequest::Target {
                name: "shell".to_string(),
                prompt: Some("hi".to_string()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_model_preset_via_flag() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "claude-opus").unwrap();
        assert_eq!(resolved.command, "claude -m 'opus'");
        // Base tool env still applies
        assert_eq!(resolved.env.get("CLAUDE_NO_AUTOUPDATE").unwrap(), "1");
    }

    #[test]
    fn test_model_preset_via_env() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "gemini-pro").unwrap();
        assert_eq!(resolved.command, "gemini");
        assert_eq!(resolved.env.get("GEMINI_MODEL").unwrap(), "gemini-2.0-pro");
    }

    #[test]
    fn test_model_on_non_promptable_rejected() {
        let config = config_with_targets();
        let err = resolve_target(&config, "bad").unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_resume_uses_configured_subcommand() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "claude").unwrap();
        let cmd = wrap_for_mux(
            &resolved,
            &SpawnRequest::Resume {
                name: "claude".to_string(),
            },
        )
        .unwrap();
        assert_eq!(cmd, "env CLAUDE_NO_AUTOUPDATE='1' claude --resume");
    }

    #[test]
    fn test_resume_without_config_is_invalid() {
        let config = config_with_targets();
        let resolved = resolve_target(&config, "gemini").unwrap();
        let err = wrap_for_mux(
            &resolved,
            &SpawnRequest::Resume {
                name: "gemini".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_shell_quote_handles_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn test_unknown_target() {
        let config = config_with_targets();
        assert!(matches!(
            resolve_target(&config, "ghost").unwrap_err(),
            CoreError::NotFound(_)
        ));
    }
}
