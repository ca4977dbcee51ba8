//! Service composition and lifecycle.
//!
//! Wires the store, settings cache, redactor, broadcaster and recorder from
//! one [`FaultlineConfig`] and owns the background tasks.

use std::sync::Arc;

use axum::Router;
use faultline_state::ErrorStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::broadcast::Broadcaster;
use crate::errors::Classifier;
use crate::redact::Redactor;
use crate::retention::start_retention_task;
use crate::settings::SettingsCache;
use crate::{ErrorRecorder, FaultlineConfig, TelemetryError};

pub struct Service {
    config: Arc<FaultlineConfig>,
    recorder: Arc<ErrorRecorder>,
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Service {
    /// Connect the configured store and build the pipeline.
    pub async fn build(config: Arc<FaultlineConfig>) -> Result<Self, TelemetryError> {
        let store = faultline_state::connect(&config.storage).await?;
        Self::with_store(config, store).await
    }

    /// Build the pipeline over an existing store. Seeds the tracking
    /// settings when the store holds none.
    pub async fn with_store(
        config: Arc<FaultlineConfig>,
        store: Arc<dyn ErrorStore>,
    ) -> Result<Self, TelemetryError> {
        let settings = Arc::new(SettingsCache::new(
            Arc::clone(&store),
            config.settings.cache_ttl(),
            config.settings.initial.clone(),
        ));
        settings.seed().await?;

        let redactor = Arc::new(Redactor::new(&config.redaction)?);
        info!(
            patterns = redactor.pattern_count(),
            action = ?config.redaction.action,
            "Redactor initialised"
        );

        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.capacity));
        let recorder = ErrorRecorder::new(store, settings, broadcaster, redactor)
            .with_classifier(Classifier::new(&config.classifier.framework_prefixes))
            .with_max_message_length(config.classifier.max_message_length)
            .with_max_group_attempts(config.classifier.max_group_attempts);

        Ok(Self {
            config,
            recorder: Arc::new(recorder),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    pub fn recorder(&self) -> &Arc<ErrorRecorder> {
        &self.recorder
    }

    /// The HTTP router, wrapped in the error interceptor.
    pub fn router(&self) -> Router {
        if self.config.admin.api_token.is_none() {
            warn!("admin.api_token is not set, admin routes are open");
        }
        let state = AppState::new(
            Arc::clone(&self.recorder),
            self.config.admin.api_token.as_deref(),
        );
        api::router(state, self.config.interceptor_config())
    }

    /// Start the enabled background tasks.
    pub fn start_background(&mut self) {
        let retention = &self.config.retention;
        if retention.enabled {
            let handle = start_retention_task(
                Arc::clone(&self.recorder),
                retention.interval(),
                retention.purge_groups,
                self.cancel.child_token(),
            );
            self.handles.push(("retention", handle));
        } else {
            info!("Retention task disabled");
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel background tasks and wait for them to stop.
    pub async fn shutdown(self) {
        info!("Stopping background tasks");
        self.cancel.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task failed");
            }
        }
    }
}
