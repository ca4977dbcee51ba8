//! Redaction of captured request data.
//!
//! Captured bodies, header values and error messages pass through the
//! [`Redactor`] before anything is written to the store:
//!
//! - fields whose name matches the administrator's `redacted_fields`
//!   ([`FieldMatcher`]) are dropped, hashed or replaced, in JSON bodies
//!   (at any depth), form-encoded bodies and headers;
//! - every remaining string value is scanned for the configured value
//!   patterns and matched substrings are hashed or replaced.
//!
//! ```toml
//! [redaction]
//! action = "hash"
//! patterns = ["builtin:email", "builtin:jwt"]
//! key_env = "FAULTLINE_REDACTION_KEY"
//! ```
//!
//! Hashing uses HMAC-SHA256 over the NFC-normalised value. Key files must
//! have mode 0600.

pub mod actions;
pub mod config;
pub mod matchers;
pub mod patterns;

use std::collections::BTreeMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use regex::Regex;
use secrecy::SecretBox;
use serde_json::Value;

use self::actions::Action;
pub use self::config::{ActionConfig, RedactionConfig};
pub use self::matchers::{FieldMatcher, MatcherError};
use self::patterns::compile_patterns;
pub use self::patterns::PatternError;

/// Applies field and value redaction to captured data.
#[derive(Debug)]
pub struct Redactor {
    action: Action,
    patterns: Vec<Regex>,
    redact_messages: bool,
}

impl Redactor {
    pub fn new(config: &RedactionConfig) -> Result<Self, RedactionError> {
        Ok(Self {
            action: Action::from_config(config)?,
            patterns: compile_patterns(&config.patterns)?,
            redact_messages: config.redact_messages,
        })
    }

    /// Field redaction with the default placeholder and no value patterns.
    pub fn fields_only() -> Self {
        Self {
            action: Action::Redact {
                placeholder: config::DEFAULT_PLACEHOLDER.to_owned(),
            },
            patterns: Vec::new(),
            redact_messages: false,
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Replace every value-pattern match inside `text`.
    pub fn redact_text(&self, text: &str) -> String {
        let mut result = text.to_owned();
        for pattern in &self.patterns {
            if !pattern.is_match(&result) {
                continue;
            }
            result = pattern
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    self.inline_replacement(&caps[0])
                })
                .into_owned();
        }
        result
    }

    pub fn redact_message(&self, message: &str) -> String {
        if self.redact_messages {
            self.redact_text(message)
        } else {
            message.to_owned()
        }
    }

    /// Redact a captured body.
    ///
    /// JSON documents are walked and re-serialised, form-encoded bodies are
    /// redacted pair by pair, anything else is treated as plain text.
    pub fn redact_body(&self, body: &str, fields: &FieldMatcher) -> String {
        if let Ok(mut value) = serde_json::from_str::<Value>(body) {
            if value.is_object() || value.is_array() {
                self.redact_json(&mut value, fields);
                return serde_json::to_string(&value).unwrap_or_else(|_| self.redact_text(body));
            }
        }
        if looks_form_encoded(body) {
            return self.redact_form(body, fields);
        }
        self.redact_text(body)
    }

    /// Redact a JSON value in place. Object keys matching `fields` are
    /// dropped or replaced; strings elsewhere are scanned for patterns.
    pub fn redact_json(&self, value: &mut Value, fields: &FieldMatcher) {
        match value {
            Value::Object(map) => {
                let keys: Vec<String> = map.keys().cloned().collect();
                for key in keys {
                    if fields.matches(&key) {
                        let raw = map.get(&key).map(json_text).unwrap_or_default();
                        match self.field_replacement(&raw) {
                            Some(replacement) => {
                                map.insert(key, Value::String(replacement));
                            }
                            None => {
                                map.remove(&key);
                            }
                        }
                    } else if let Some(child) = map.get_mut(&key) {
                        self.redact_json(child, fields);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_json(item, fields);
                }
            }
            Value::String(s) => {
                let redacted = self.redact_text(s);
                if redacted != *s {
                    *s = redacted;
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    /// Redact captured header values. Matching headers are dropped or
    /// replaced.
    pub fn redact_headers(
        &self,
        headers: BTreeMap<String, String>,
        fields: &FieldMatcher,
    ) -> BTreeMap<String, String> {
        headers
            .into_iter()
            .filter_map(|(name, value)| {
                if fields.matches(&name) {
                    self.field_replacement(&value).map(|v| (name, v))
                } else {
                    let value = self.redact_text(&value);
                    Some((name, value))
                }
            })
            .collect()
    }

    fn redact_form(&self, body: &str, fields: &FieldMatcher) -> String {
        body.split('&')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if fields.matches(key) {
                    self.field_replacement(value)
                        .map(|replacement| format!("{key}={replacement}"))
                } else {
                    Some(format!("{key}={}", self.redact_text(value)))
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Replacement for a whole field, or `None` when it should be dropped.
    fn field_replacement(&self, value: &str) -> Option<String> {
        self.action.replace_field(value)
    }

    fn inline_replacement(&self, matched: &str) -> String {
        self.action.replace_inline(matched)
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn looks_form_encoded(body: &str) -> bool {
    !body.is_empty()
        && body.contains('=')
        && !body.contains(char::is_whitespace)
        && body
            .split('&')
            .all(|pair| pair.split_once('=').is_some_and(|(k, _)| !k.is_empty()))
}

/// Truncate `text` to at most `max_bytes` bytes on a character boundary.
pub fn cap_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_owned();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

fn load_hmac_key(config: &RedactionConfig) -> Result<SecretBox<Vec<u8>>, RedactionError> {
    if let Some(ref env_var) = config.key_env {
        if let Ok(key_base64) = std::env::var(env_var) {
            let key_bytes =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, key_base64.trim())
                    .map_err(|e| RedactionError::InvalidKey(format!("invalid base64: {e}")))?;
            return checked_key(key_bytes);
        }
    }

    if let Some(ref key_path) = config.key_file {
        return load_key_file(key_path);
    }

    Err(RedactionError::MissingKey)
}

fn load_key_file(path: &Path) -> Result<SecretBox<Vec<u8>>, RedactionError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)
            .map_err(|e| RedactionError::InvalidKey(format!("cannot read key file: {e}")))?;

        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(RedactionError::InsecureKeyFile(format!(
                "key file {} has insecure permissions {mode:o} (must be 0600)",
                path.display()
            )));
        }
    }

    let key_bytes = fs::read(path)
        .map_err(|e| RedactionError::InvalidKey(format!("cannot read key file: {e}")))?;
    checked_key(key_bytes)
}

fn checked_key(key_bytes: Vec<u8>) -> Result<SecretBox<Vec<u8>>, RedactionError> {
    if key_bytes.len() < 32 {
        return Err(RedactionError::InvalidKey(
            "HMAC key must be at least 32 bytes".to_owned(),
        ));
    }
    Ok(SecretBox::new(Box::new(key_bytes)))
}

#[derive(Debug, thiserror::Error)]
pub enum RedactionError {
    #[error("invalid field matcher: {0}")]
    Matcher(#[from] MatcherError),

    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("missing HMAC key for hash action")]
    MissingKey,

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    #[error("insecure key file: {0}")]
    InsecureKeyFile(String),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn fields() -> FieldMatcher {
        FieldMatcher::compile(&["password", "authorization", "*_token"]).unwrap()
    }

    fn redactor(action: ActionConfig, patterns: &[&str]) -> Redactor {
        Redactor::new(&RedactionConfig {
            action,
            patterns: patterns.iter().map(|p| (*p).to_owned()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn json_fields_redacted_at_any_depth() {
        let redactor = redactor(ActionConfig::Redact, &[]);
        let body = json!({
            "username": "jane",
            "password": "hunter2",
            "session": { "refresh_token": "abc", "expires": 3600 },
            "items": [{ "password": 1234 }]
        })
        .to_string();

        let redacted: Value = serde_json::from_str(&redactor.redact_body(&body, &fields())).unwrap();

        assert_eq!(redacted["username"], "jane");
        assert_eq!(redacted["password"], "[REDACTED]");
        assert_eq!(redacted["session"]["refresh_token"], "[REDACTED]");
        assert_eq!(redacted["session"]["expires"], 3600);
        assert_eq!(redacted["items"][0]["password"], "[REDACTED]");
    }

    #[test]
    fn drop_action_removes_json_fields() {
        let redactor = redactor(ActionConfig::Drop, &[]);
        let body = r#"{"password":"hunter2","name":"jane"}"#;
        let redacted: Value = serde_json::from_str(&redactor.redact_body(body, &fields())).unwrap();
        assert_eq!(redacted, json!({ "name": "jane" }));
    }

    #[test]
    fn form_bodies_redacted_pairwise() {
        let redactor = redactor(ActionConfig::Redact, &[]);
        let redacted = redactor.redact_body("user=jane&password=hunter2&remember=1", &fields());
        assert_eq!(redacted, "user=jane&password=[REDACTED]&remember=1");
    }

    #[test]
    fn plain_text_uses_value_patterns() {
        let redactor = redactor(ActionConfig::Redact, &["builtin:email"]);
        let redacted = redactor.redact_body("contact jane@example.com for access", &fields());
        assert_eq!(redacted, "contact [REDACTED] for access");
    }

    #[test]
    fn headers_redacted_by_name_and_value() {
        let redactor = redactor(ActionConfig::Drop, &["builtin:jwt"]);
        let headers = BTreeMap::from([
            ("authorization".to_owned(), "Bearer abc".to_owned()),
            ("accept".to_owned(), "application/json".to_owned()),
            (
                "x-forwarded-jwt".to_owned(),
                "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.c2ln".to_owned(),
            ),
        ]);

        let redacted = redactor.redact_headers(headers, &fields());

        assert!(!redacted.contains_key("authorization"));
        assert_eq!(redacted["accept"], "application/json");
        assert_eq!(redacted["x-forwarded-jwt"], "[REDACTED]");
    }

    #[test]
    fn message_redaction_can_be_disabled() {
        let redactor = Redactor::new(&RedactionConfig {
            patterns: vec!["builtin:email".to_owned()],
            redact_messages: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            redactor.redact_message("no user jane@example.com"),
            "no user jane@example.com"
        );
        assert_eq!(
            redactor.redact_text("no user jane@example.com"),
            "no user [REDACTED]"
        );
    }

    #[test]
    fn hash_action_needs_a_key() {
        let err = Redactor::new(&RedactionConfig {
            action: ActionConfig::Hash,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RedactionError::MissingKey));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_must_be_private() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 32]).unwrap();
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644)).unwrap();

        let config = RedactionConfig {
            action: ActionConfig::Hash,
            key_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            Redactor::new(&config),
            Err(RedactionError::InsecureKeyFile(_))
        ));

        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600)).unwrap();
        let redactor = Redactor::new(&config).unwrap();
        let redacted = redactor.redact_body(r#"{"password":"hunter2"}"#, &fields());
        assert!(redacted.contains("HMAC_"));
        assert!(!redacted.contains("hunter2"));
    }

    #[test]
    fn short_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 8]).unwrap();
        #[cfg(unix)]
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600)).unwrap();

        let err = Redactor::new(&RedactionConfig {
            action: ActionConfig::Hash,
            key_file: Some(file.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RedactionError::InvalidKey(_)));
    }

    #[test]
    fn cap_bytes_respects_char_boundaries() {
        assert_eq!(cap_bytes("hello", 10), "hello");
        assert_eq!(cap_bytes("hello", 3), "hel");
        // "é" is two bytes; cutting inside it backs off.
        assert_eq!(cap_bytes("café", 4), "caf");
    }
}
