//! Secrets file handling.
//!
//! Preferred shape is `{variants: {...}, auth: {...}}`; a legacy flat
//! object is read as `variants`. The session secret is generated on first
//! load if absent and written back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secrets {
    /// Free-form per-variant secret bags (agent API keys and the like)
    #[serde(default)]
    pub variants: HashMap<String, Value>,
    #[serde(default)]
    pub auth: AuthSecrets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSecrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubOauth>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubOauth {
    pub client_id: String,
    pub client_secret: String,
}

impl Secrets {
    /// Load from `path`, accepting both shapes. Generates and persists a
    /// session secret when one is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let mut secrets = match std::fs::read_to_string(path) {
            Ok(text) => {
                let value: Value = serde_json::from_str(&text)
                    .with_context(|| format!("parse secrets {}", path.display()))?;
                Self::from_value(value)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("read secrets {}", path.display())),
        };

        if secrets.auth.session_secret.is_empty() {
            secrets.auth.session_secret = generate_session_secret();
            secrets.save(path)?;
        }
        Ok(secrets)
    }

    fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            anyhow::bail!("secrets file must be a JSON object");
        };
        if map.contains_key("variants") || map.contains_key("auth") {
            serde_json::from_value(Value::Object(map)).context("parse structured secrets")
        } else {
            // Legacy flat shape: the whole object is the variants map
            Ok(Self {
                variants: map.into_iter().collect(),
                auth: AuthSecrets::default(),
            })
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            anyhow::anyhow!("rename {} -> {}: {e}", tmp.display(), path.display())
        })?;
        Ok(())
    }
}

fn generate_session_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_structured_shape_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(
            &path,
            r#"{"variants": {"claude": {"api_key": "sk-test"}},
                "auth": {"github": {"client_id": "id", "client_secret": "sec"},
                         "session_secret": "fixed"}}"#,
        )
        .unwrap();

        let secrets = Secrets::load(&path).unwrap();
        assert_eq!(secrets.auth.session_secret, "fixed");
        assert_eq!(secrets.auth.github.as_ref().unwrap().client_id, "id");
        assert!(secrets.variants.contains_key("claude"));
    }

    #[test]
    fn test_legacy_flat_shape_read_as_variants() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, r#"{"claude": {"api_key": "sk"}, "codex": {}}"#).unwrap();

        let secrets = Secrets::load(&path).unwrap();
        assert_eq!(secrets.variants.len(), 2);
        assert!(secrets.variants.contains_key("codex"));
        // Auto-generated on first load
        assert!(!secrets.auth.session_secret.is_empty());
    }

    #[test]
    fn test_session_secret_generated_and_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");

        let first = Secrets::load(&path).unwrap();
        assert_eq!(first.auth.session_secret.len(), 64);

        let second = Secrets::load(&path).unwrap();
        assert_eq!(first.auth.session_secret, second.auth.session_secret);
    }
}
