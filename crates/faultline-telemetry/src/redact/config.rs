//! Redaction configuration.
//!
//! Field names to redact are administrator settings and live in
//! [`TrackingSettings`](faultline_state::TrackingSettings). This section
//! configures what happens to a match and which value patterns are scanned
//! for regardless of field name.

use std::path::PathBuf;

use serde::Deserialize;

/// Default placeholder for redacted values.
pub const DEFAULT_PLACEHOLDER: &str = "[REDACTED]";

/// Value patterns scanned for out of the box.
pub const DEFAULT_PATTERNS: &[&str] = &[
    "builtin:jwt",
    "builtin:credit_card",
    "builtin:aws_access_key",
    "builtin:api_key",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// What happens to a redacted field or matched value.
    pub action: ActionConfig,

    /// Replacement text for the `redact` action.
    pub placeholder: String,

    /// Regexes (or `builtin:name` references) matched against every captured
    /// string value, error messages included.
    pub patterns: Vec<String>,

    /// Whether value patterns are applied to error messages (default: true).
    pub redact_messages: bool,

    /// Path to the HMAC key used by the `hash` action.
    /// File must have mode 0600 (owner read/write only).
    pub key_file: Option<PathBuf>,

    /// Environment variable holding a base64 HMAC key.
    /// Takes precedence over key_file if both are set.
    pub key_env: Option<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            action: ActionConfig::default(),
            placeholder: DEFAULT_PLACEHOLDER.to_owned(),
            patterns: DEFAULT_PATTERNS.iter().map(|p| (*p).to_owned()).collect(),
            redact_messages: true,
            key_file: None,
            key_env: None,
        }
    }
}

/// Action applied to redacted data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionConfig {
    /// Replace with the placeholder.
    #[default]
    Redact,

    /// Replace with an HMAC-SHA256 hash, keeping equal values correlatable.
    Hash,

    /// Remove the field entirely. Matched substrings fall back to the
    /// placeholder.
    Drop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RedactionConfig::default();
        assert_eq!(config.action, ActionConfig::Redact);
        assert_eq!(config.placeholder, DEFAULT_PLACEHOLDER);
        assert!(config.patterns.iter().any(|p| p == "builtin:jwt"));
        assert!(config.redact_messages);
    }

    #[test]
    fn deserialise_hash_action() {
        let config: RedactionConfig = toml::from_str(
            r#"
            action = "hash"
            patterns = ["builtin:email"]
            key_env = "FAULTLINE_REDACTION_KEY"
        "#,
        )
        .unwrap();

        assert_eq!(config.action, ActionConfig::Hash);
        assert_eq!(config.patterns, vec!["builtin:email".to_owned()]);
        assert_eq!(config.key_env.as_deref(), Some("FAULTLINE_REDACTION_KEY"));
        assert_eq!(config.placeholder, DEFAULT_PLACEHOLDER);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let result: Result<RedactionConfig, _> = toml::from_str(r#"action = "shred""#);
        assert!(result.is_err());
    }
}
