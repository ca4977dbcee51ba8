//! Configuration for the Faultline service.
//!
//! Loaded once at start-up and shared by `Arc`. Sources, later overriding
//! earlier:
//!
//! 1. Default values
//! 2. `faultline.toml` (or the file given with `--config`)
//! 3. Environment variables prefixed with `FAULTLINE_`, nested with `__`
//!    (`FAULTLINE_SERVER__LISTEN_ADDR=0.0.0.0:9000`)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use faultline_gateway::interceptor::{DEFAULT_CORRELATION_HEADER, DEFAULT_MAX_CAPTURE_BYTES};
use faultline_gateway::InterceptorConfig;
use faultline_state::{ErrorSource, StoreConfig, TrackingSettings};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::broadcast::DEFAULT_BROADCAST_CAPACITY;
use crate::errors::{
    DEFAULT_FRAMEWORK_PREFIXES, DEFAULT_MAX_GROUP_ATTEMPTS, DEFAULT_MAX_MESSAGE_LENGTH,
};
use crate::redact::RedactionConfig;
use crate::retention::DEFAULT_RETENTION_INTERVAL_SECS;
use crate::settings::DEFAULT_SETTINGS_TTL_SECS;
use crate::TelemetryError;

/// Default configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "faultline.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FAULTLINE_";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FaultlineConfig {
    pub server: ServerConfig,
    pub storage: StoreConfig,
    pub settings: SettingsConfig,
    pub classifier: ClassifierConfig,
    pub redaction: RedactionConfig,
    pub retention: RetentionConfig,
    pub broadcast: BroadcastConfig,
    pub admin: AdminConfig,
    pub interceptor: InterceptorSection,
}

impl FaultlineConfig {
    pub fn load() -> Result<Self, TelemetryError> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(|e| TelemetryError::Config(e.to_string()))
    }

    pub fn load_from(path: &Path) -> Result<Self, TelemetryError> {
        if !path.exists() {
            return Err(TelemetryError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        Self::figment(path)
            .extract()
            .map_err(|e| TelemetryError::Config(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Interceptor settings for the service's own router.
    pub fn interceptor_config(&self) -> InterceptorConfig {
        InterceptorConfig {
            correlation_header: self.interceptor.correlation_header.clone(),
            max_capture_bytes: self.interceptor.max_capture_bytes,
            source: self.server.source,
            environment: self.server.environment.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to (default: 0.0.0.0:8080).
    pub listen_addr: SocketAddr,
    /// Deployment environment stamped on captured occurrences.
    pub environment: Option<String>,
    /// Source recorded for failures of this service's own API.
    pub source: ErrorSource,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            environment: None,
            source: ErrorSource::Api,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// How long tracking settings are cached (default: 30).
    pub cache_ttl_secs: u64,
    /// Settings written to the store on first start.
    pub initial: TrackingSettings,
}

impl SettingsConfig {
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_SETTINGS_TTL_SECS,
            initial: TrackingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Stack frames starting with (for `::` entries) or containing these are
    /// skipped when picking the application frame.
    pub framework_prefixes: Vec<String>,
    /// Stored message length, in characters (default: 1000).
    pub max_message_length: usize,
    /// Attempts to settle a contended group before failing (default: 3).
    pub max_group_attempts: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            framework_prefixes: DEFAULT_FRAMEWORK_PREFIXES
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_group_attempts: DEFAULT_MAX_GROUP_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Seconds between purges (default: 3600).
    pub interval_secs: u64,
    /// Also delete groups last seen before the cutoff.
    pub purge_groups: bool,
}

impl RetentionConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_RETENTION_INTERVAL_SECS,
            purge_groups: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events buffered per topic before slow subscribers lag (default: 256).
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token required on admin routes. Unset leaves them open.
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptorSection {
    /// Header linking a request to an analytics session (default: x-session-id).
    pub correlation_header: String,
    /// Largest request body buffered for capture (default: 64 KiB).
    pub max_capture_bytes: usize,
}

impl Default for InterceptorSection {
    fn default() -> Self {
        Self {
            correlation_header: DEFAULT_CORRELATION_HEADER.to_owned(),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;
    use crate::redact::ActionConfig;

    #[test]
    fn defaults() {
        let config = FaultlineConfig::default();
        assert_eq!(config.server.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.storage, StoreConfig::Memory);
        assert_eq!(config.settings.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.classifier.max_message_length, 1000);
        assert!(config.retention.enabled);
        assert!(!config.retention.purge_groups);
        assert_eq!(config.admin.api_token, None);
        assert_eq!(config.interceptor.correlation_header, "x-session-id");
    }

    #[test]
    fn file_and_environment_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "faultline.toml",
                r#"
                [server]
                listen_addr = "127.0.0.1:9100"
                environment = "staging"

                [settings]
                cache_ttl_secs = 5

                [settings.initial]
                track_404_errors = false

                [redaction]
                action = "drop"

                [admin]
                api_token = "from-file"
            "#,
            )?;
            jail.set_env("FAULTLINE_ADMIN__API_TOKEN", "from-env");
            jail.set_env("FAULTLINE_RETENTION__INTERVAL_SECS", "60");

            let config = FaultlineConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.server.listen_addr.port(), 9100);
            assert_eq!(config.server.environment.as_deref(), Some("staging"));
            assert_eq!(config.settings.cache_ttl_secs, 5);
            assert!(!config.settings.initial.track_404_errors);
            assert!(config.settings.initial.track_400_errors);
            assert_eq!(config.redaction.action, ActionConfig::Drop);
            assert_eq!(config.admin.api_token.as_deref(), Some("from-env"));
            assert_eq!(config.retention.interval_secs, 60);

            let interceptor = config.interceptor_config();
            assert_eq!(interceptor.environment.as_deref(), Some("staging"));
            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = FaultlineConfig::load_from(Path::new("/nonexistent/faultline.toml")).unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
    }
}
