//! Cached tracking settings.
//!
//! Every recorded occurrence consults the settings; they are read from the
//! store at most once per TTL and refreshed immediately after an
//! administrator update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use faultline_state::{ErrorStore, TrackingSettings, DEFAULT_REDACTED_FIELDS};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::redact::FieldMatcher;
use crate::TelemetryError;

/// Default cache lifetime.
pub const DEFAULT_SETTINGS_TTL_SECS: u64 = 30;

/// Settings together with their compiled field matcher.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub settings: TrackingSettings,
    pub fields: FieldMatcher,
}

impl SettingsSnapshot {
    /// Fails when `redacted_fields` holds an invalid glob.
    pub fn compile(settings: TrackingSettings) -> Result<Self, TelemetryError> {
        let fields = FieldMatcher::compile(&settings.redacted_fields)
            .map_err(|e| TelemetryError::InvalidRequest(format!("redacted_fields: {e}")))?;
        Ok(Self { settings, fields })
    }

    /// Like [`compile`](Self::compile), falling back to the default field
    /// list when the stored one does not compile.
    fn compile_lenient(settings: TrackingSettings) -> Self {
        match FieldMatcher::compile(&settings.redacted_fields) {
            Ok(fields) => Self { settings, fields },
            Err(e) => {
                warn!(error = %e, "stored redacted_fields invalid, using defaults");
                Self {
                    settings,
                    fields: FieldMatcher::compile(DEFAULT_REDACTED_FIELDS).unwrap_or_default(),
                }
            }
        }
    }
}

#[derive(Debug)]
struct Cached {
    snapshot: Arc<SettingsSnapshot>,
    loaded_at: Instant,
}

pub struct SettingsCache {
    store: Arc<dyn ErrorStore>,
    ttl: Duration,
    /// Used when the store holds no settings yet.
    initial: TrackingSettings,
    current: RwLock<Option<Cached>>,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn ErrorStore>, ttl: Duration, initial: TrackingSettings) -> Self {
        Self {
            store,
            ttl,
            initial,
            current: RwLock::new(None),
        }
    }

    /// Persist the initial settings if the store has none.
    #[instrument(skip(self))]
    pub async fn seed(&self) -> Result<(), TelemetryError> {
        if self.store.load_settings().await?.is_none() {
            self.initial.validate()?;
            self.store.save_settings(&self.initial).await?;
            info!("seeded tracking settings");
        }
        Ok(())
    }

    /// Current settings. Store failures fall back to the last known settings,
    /// or the initial ones, so the tracking gate keeps working.
    pub async fn get(&self) -> Arc<SettingsSnapshot> {
        {
            let guard = self.current.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Arc::clone(&cached.snapshot);
                }
            }
        }

        let loaded = match self.store.load_settings().await {
            Ok(Some(settings)) => SettingsSnapshot::compile_lenient(settings),
            Ok(None) => SettingsSnapshot::compile_lenient(self.initial.clone()),
            Err(e) => {
                warn!(error = %e, "failed to load tracking settings");
                if let Some(cached) = self.current.read().await.as_ref() {
                    return Arc::clone(&cached.snapshot);
                }
                SettingsSnapshot::compile_lenient(self.initial.clone())
            }
        };

        let snapshot = Arc::new(loaded);
        *self.current.write().await = Some(Cached {
            snapshot: Arc::clone(&snapshot),
            loaded_at: Instant::now(),
        });
        snapshot
    }

    /// Validate, persist and publish new settings.
    #[instrument(skip_all)]
    pub async fn update(
        &self,
        settings: TrackingSettings,
    ) -> Result<Arc<SettingsSnapshot>, TelemetryError> {
        settings.validate()?;
        let snapshot = Arc::new(SettingsSnapshot::compile(settings)?);
        self.store.save_settings(&snapshot.settings).await?;

        *self.current.write().await = Some(Cached {
            snapshot: Arc::clone(&snapshot),
            loaded_at: Instant::now(),
        });
        info!("tracking settings updated");
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}

impl std::fmt::Debug for SettingsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
