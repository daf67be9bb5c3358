//! Core error kinds surfaced by the orchestration layer.

use thiserror::Error;

/// Errors produced by the session/workspace orchestration core.
///
/// Background loops log these and continue; user-initiated API calls
/// propagate them with the kind intact so the HTTP collaborator can map
/// them to status codes.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Unknown workspace, session, host, or operation ID
    #[error("not found: {0}")]
    NotFound(String),

    /// Validation failure (branch-name rules, malformed input)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A per-repo or per-workspace lock is held, or state is stale
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external process is absent (git, tmux) or a connection is down
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An external call exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// A git-safety check failed and force was not set
    #[error("unsafe: {0}")]
    Unsafe(String),

    /// Unparseable persisted state or protocol frame
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// Panic recovery or an otherwise unclassified failure
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Corrupted(err.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind() {
        let err = CoreError::NotFound("workspace 'abc'".to_string());
        assert_eq!(err.to_string(), "not found: workspace 'abc'");

        let err = CoreError::Unsafe("2 unpushed commits".to_string());
        assert!(err.to_string().starts_with("unsafe:"));
    }

    #[test]
    fn test_json_error_maps_to_corrupted() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: CoreError = parse_err.into();
        assert!(matches!(err, CoreError::Corrupted(_)));
    }
}
