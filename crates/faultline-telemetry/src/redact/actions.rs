//! What a redacted value turns into.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use super::config::{ActionConfig, RedactionConfig};
use super::{load_hmac_key, RedactionError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub enum Action {
    /// Remove whole fields; substrings get the placeholder.
    Drop { placeholder: String },
    /// Keyed digest, so equal values stay correlatable across occurrences.
    Hash {
        key: SecretBox<Vec<u8>>,
        placeholder: String,
    },
    Redact { placeholder: String },
}

impl Action {
    /// Loads the HMAC key when the action needs one.
    pub fn from_config(config: &RedactionConfig) -> Result<Self, RedactionError> {
        let placeholder = config.placeholder.clone();
        Ok(match config.action {
            ActionConfig::Redact => Self::Redact { placeholder },
            ActionConfig::Drop => Self::Drop { placeholder },
            ActionConfig::Hash => Self::Hash {
                key: load_hmac_key(config)?,
                placeholder,
            },
        })
    }

    pub fn placeholder(&self) -> &str {
        match self {
            Self::Drop { placeholder }
            | Self::Hash { placeholder, .. }
            | Self::Redact { placeholder } => placeholder,
        }
    }

    /// Replacement for a whole field value, `None` to drop the field.
    pub fn replace_field(&self, value: &str) -> Option<String> {
        match self {
            Self::Drop { .. } => None,
            _ => Some(self.replace_inline(value)),
        }
    }

    /// Replacement for a match inside a larger string.
    pub fn replace_inline(&self, matched: &str) -> String {
        match self {
            Self::Hash { key, placeholder } => hash_value(matched, key).unwrap_or_else(|| {
                warn!("HMAC key rejected, using placeholder");
                placeholder.clone()
            }),
            Self::Drop { placeholder } | Self::Redact { placeholder } => placeholder.clone(),
        }
    }
}

/// `HMAC_<hex>` of the NFC-normalised value.
pub fn hash_value(value: &str, key: &SecretBox<Vec<u8>>) -> Option<String> {
    let normalised: String = value.nfc().collect();
    let mut mac = HmacSha256::new_from_slice(key.expose_secret()).ok()?;
    mac.update(normalised.as_bytes());
    Some(format!("HMAC_{}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashing(byte: u8) -> Action {
        Action::Hash {
            key: SecretBox::new(Box::new(vec![byte; 32])),
            placeholder: "[X]".to_owned(),
        }
    }

    #[test]
    fn redact_and_drop() {
        let redact = Action::Redact {
            placeholder: "[X]".to_owned(),
        };
        assert_eq!(redact.replace_field("secret").as_deref(), Some("[X]"));

        let drop = Action::Drop {
            placeholder: "[X]".to_owned(),
        };
        assert_eq!(drop.replace_field("secret"), None);
        assert_eq!(drop.replace_inline("secret"), "[X]");
        assert_eq!(drop.placeholder(), "[X]");
    }

    #[test]
    fn hash_is_deterministic_and_keyed() {
        let action = hashing(7);
        let first = action.replace_inline("jane@example.com");
        assert_eq!(first, action.replace_inline("jane@example.com"));
        assert!(first.starts_with("HMAC_"));
        assert_eq!(first.len(), 5 + 64);

        assert_ne!(hashing(9).replace_inline("jane@example.com"), first);
    }

    #[test]
    fn hash_normalises_unicode() {
        let action = hashing(7);
        assert_eq!(
            action.replace_inline("caf\u{00E9}"),
            action.replace_inline("cafe\u{0301}")
        );
    }
}
