//! The recording pipeline and the operations behind the admin API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use faultline_gateway::{ErrorReporter, ReportError};
use faultline_state::{
    ErrorGroup, ErrorOccurrence, ErrorStore, GroupFilter, GroupSort, KeyClaim, OccurrenceFilter,
    Page, Resolution, StoreStats,
};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::{Broadcaster, ErrorEvent};
use crate::errors::{
    normalise_route, truncate_message, Classifier, GroupResolver, ResolvedGroup,
    DEFAULT_MAX_GROUP_ATTEMPTS, DEFAULT_MAX_MESSAGE_LENGTH,
};
use crate::redact::{cap_bytes, Redactor};
use crate::settings::{SettingsCache, SettingsSnapshot};
use crate::TelemetryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Recorded { id: Uuid, group_id: Uuid },
    /// The idempotency key was already used; `id` is the original occurrence.
    Duplicate { id: Uuid },
    /// The status code is not tracked; nothing was written.
    Skipped { status_code: u16 },
}

/// One page of results with its unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

impl<T> Listing<T> {
    fn new(items: Vec<T>, total: u64, page: Page) -> Self {
        let has_more = (page.offset + items.len()) < usize::try_from(total).unwrap_or(usize::MAX);
        Self {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
            has_more,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub cutoff: DateTime<Utc>,
    pub occurrences_deleted: u64,
    pub groups_deleted: u64,
}

pub struct ErrorRecorder {
    store: Arc<dyn ErrorStore>,
    settings: Arc<SettingsCache>,
    broadcaster: Arc<Broadcaster>,
    redactor: Arc<Redactor>,
    classifier: Classifier,
    groups: GroupResolver,
    max_message_length: usize,
}

impl ErrorRecorder {
    pub fn new(
        store: Arc<dyn ErrorStore>,
        settings: Arc<SettingsCache>,
        broadcaster: Arc<Broadcaster>,
        redactor: Arc<Redactor>,
    ) -> Self {
        let groups = GroupResolver::new(Arc::clone(&store), DEFAULT_MAX_GROUP_ATTEMPTS);
        Self {
            store,
            settings,
            broadcaster,
            redactor,
            classifier: Classifier::default(),
            groups,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_max_message_length(mut self, max_message_length: usize) -> Self {
        self.max_message_length = max_message_length;
        self
    }

    #[must_use]
    pub fn with_max_group_attempts(mut self, attempts: u32) -> Self {
        self.groups = GroupResolver::new(Arc::clone(&self.store), attempts);
        self
    }

    pub fn store(&self) -> &Arc<dyn ErrorStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsCache> {
        &self.settings
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Gate, deduplicate, sanitise, group and persist one occurrence.
    #[instrument(
        skip_all,
        fields(occurrence_id = %occurrence.id, status = occurrence.status_code, source = %occurrence.source)
    )]
    pub async fn record_occurrence(
        &self,
        occurrence: ErrorOccurrence,
    ) -> Result<RecordOutcome, TelemetryError> {
        let snapshot = self.settings.get().await;
        if !snapshot.settings.is_status_tracked(occurrence.status_code) {
            counter!("faultline.occurrences.skipped").increment(1);
            debug!("status code not tracked");
            return Ok(RecordOutcome::Skipped {
                status_code: occurrence.status_code,
            });
        }

        let key = occurrence.idempotency_key.clone();
        if let Some(key) = key.as_deref() {
            if let KeyClaim::Existing(id) = self
                .store
                .claim_idempotency_key(key, occurrence.id, Utc::now())
                .await?
            {
                counter!("faultline.occurrences.duplicate").increment(1);
                debug!(original = %id, "duplicate idempotency key");
                return Ok(RecordOutcome::Duplicate { id });
            }
        }

        match self.persist(occurrence, &snapshot).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Some(key) = key.as_deref() {
                    if let Err(release) = self.store.release_idempotency_key(key).await {
                        warn!(error = %release, "failed to release idempotency key");
                    }
                }
                Err(err)
            }
        }
    }

    async fn persist(
        &self,
        mut occurrence: ErrorOccurrence,
        snapshot: &SettingsSnapshot,
    ) -> Result<RecordOutcome, TelemetryError> {
        self.sanitise(&mut occurrence, snapshot);

        let signature = self.classifier.signature(
            &occurrence.error_type,
            occurrence.stack_trace.as_deref(),
            &occurrence.route,
        );
        let ResolvedGroup { group, created } =
            self.groups.find_or_create(&signature, &occurrence).await?;

        let group_id = group.id;
        occurrence.group_id = Some(group_id);
        self.store.insert_occurrence(&occurrence).await?;
        counter!("faultline.occurrences.recorded", "source" => occurrence.source.as_str())
            .increment(1);

        self.after_insert(&occurrence, group, created, snapshot).await;

        Ok(RecordOutcome::Recorded {
            id: occurrence.id,
            group_id,
        })
    }

    /// Truncate, redact and cap in place, honouring the capture flags.
    fn sanitise(&self, occurrence: &mut ErrorOccurrence, snapshot: &SettingsSnapshot) {
        let settings = &snapshot.settings;
        let fields = &snapshot.fields;

        occurrence.message = truncate_message(
            &self.redactor.redact_message(&occurrence.message),
            self.max_message_length,
        );
        occurrence.route = normalise_route(&occurrence.route);
        if let Some(pos) = occurrence.endpoint.find('?') {
            occurrence.endpoint.truncate(pos);
        }

        occurrence.request_body = occurrence
            .request_body
            .take()
            .filter(|_| settings.capture_request_body)
            .map(|body| cap_bytes(&self.redactor.redact_body(&body, fields), settings.max_body_size));

        occurrence.response_body = occurrence
            .response_body
            .take()
            .filter(|_| settings.capture_response_body)
            .map(|body| cap_bytes(&self.redactor.redact_body(&body, fields), settings.max_body_size));

        occurrence.headers = occurrence
            .headers
            .take()
            .filter(|_| settings.capture_headers)
            .map(|headers| {
                self.redactor
                    .redact_headers(headers, fields)
                    .into_iter()
                    .map(|(name, value)| (name, cap_bytes(&value, settings.max_header_value_length)))
                    .collect()
            });

        if !occurrence.metadata.is_empty() {
            let mut metadata = serde_json::Value::Object(
                std::mem::take(&mut occurrence.metadata).into_iter().collect(),
            );
            self.redactor.redact_json(&mut metadata, fields);
            if let serde_json::Value::Object(map) = metadata {
                occurrence.metadata = map.into_iter().collect();
            }
        }
    }

    async fn after_insert(
        &self,
        occurrence: &ErrorOccurrence,
        group: ErrorGroup,
        created: bool,
        snapshot: &SettingsSnapshot,
    ) {
        let group_id = group.id;

        if group.is_resolved() {
            match self.store.set_group_resolution(group_id, None, false).await {
                Ok(_) => {
                    info!(%group_id, "resolved group regressed, reopening");
                    self.broadcaster.publish(ErrorEvent::GroupReopened { group_id });
                }
                Err(e) => warn!(%group_id, error = %e, "failed to reopen regressed group"),
            }
        }

        self.broadcaster.publish(ErrorEvent::OccurrenceCreated {
            group_id,
            occurrence_id: occurrence.id,
            status_code: occurrence.status_code,
            message: occurrence.message.clone(),
            source: occurrence.source,
            created_at: occurrence.created_at,
        });

        let threshold = snapshot.settings.notification_threshold;
        if threshold > 0 && group.occurrence_count == threshold {
            self.broadcaster.publish(ErrorEvent::ThresholdReached {
                group_id,
                occurrence_count: group.occurrence_count,
                threshold,
            });
        }

        if created {
            info!(%group_id, signature = %group.signature, "new error group");
            if snapshot.settings.notify_on_new_group {
                self.broadcaster.publish(ErrorEvent::GroupCreated { group });
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn list_groups(
        &self,
        filter: &GroupFilter,
        sort: GroupSort,
        page: Page,
    ) -> Result<Listing<ErrorGroup>, TelemetryError> {
        let items = self.store.list_groups(filter, sort, page).await?;
        let total = self.store.count_groups(filter).await?;
        Ok(Listing::new(items, total, page))
    }

    #[instrument(skip(self))]
    pub async fn list_occurrences(
        &self,
        filter: &OccurrenceFilter,
        page: Page,
    ) -> Result<Listing<ErrorOccurrence>, TelemetryError> {
        let items = self.store.list_occurrences(filter, page).await?;
        let total = self.store.count_occurrences(filter).await?;
        Ok(Listing::new(items, total, page))
    }

    pub async fn get_group(&self, id: Uuid) -> Result<ErrorGroup, TelemetryError> {
        self.store
            .get_group(id)
            .await?
            .ok_or_else(|| TelemetryError::NotFound(format!("Error group {id} not found")))
    }

    pub async fn get_occurrence(&self, id: Uuid) -> Result<ErrorOccurrence, TelemetryError> {
        self.store
            .get_occurrence(id)
            .await?
            .ok_or_else(|| TelemetryError::NotFound(format!("Error occurrence {id} not found")))
    }

    /// Resolve a group and every stored occurrence of it.
    #[instrument(skip(self, notes))]
    pub async fn resolve_group(
        &self,
        id: Uuid,
        resolver_id: &str,
        notes: Option<String>,
    ) -> Result<ErrorGroup, TelemetryError> {
        let resolution = Resolution::new(resolver_id, notes);
        let group = self
            .store
            .set_group_resolution(id, Some(resolution.clone()), true)
            .await
            .map_err(|e| not_found_as(e, "Error group", id))?;

        info!(group_id = %id, resolver_id, "group resolved");
        self.broadcaster.publish(ErrorEvent::GroupResolved {
            group_id: id,
            resolution,
        });
        Ok(group)
    }

    #[instrument(skip(self))]
    pub async fn unresolve_group(&self, id: Uuid) -> Result<ErrorGroup, TelemetryError> {
        let group = self
            .store
            .set_group_resolution(id, None, true)
            .await
            .map_err(|e| not_found_as(e, "Error group", id))?;

        info!(group_id = %id, "group reopened");
        self.broadcaster
            .publish(ErrorEvent::GroupReopened { group_id: id });
        Ok(group)
    }

    #[instrument(skip(self, notes))]
    pub async fn resolve_occurrence(
        &self,
        id: Uuid,
        resolver_id: &str,
        notes: Option<String>,
    ) -> Result<ErrorOccurrence, TelemetryError> {
        self.store
            .set_occurrence_resolution(id, Some(Resolution::new(resolver_id, notes)))
            .await
            .map_err(|e| not_found_as(e, "Error occurrence", id))
    }

    /// Delete occurrences older than the retention window.
    ///
    /// `retention_days` defaults to the configured retention period. Groups
    /// survive unless `include_groups` is set.
    #[instrument(skip(self))]
    pub async fn purge_expired(
        &self,
        retention_days: Option<u32>,
        include_groups: bool,
    ) -> Result<PurgeReport, TelemetryError> {
        let days = match retention_days {
            Some(days) => days,
            None => self.settings.get().await.settings.retention_period_days,
        };
        let cutoff = Utc::now() - Duration::days(i64::from(days));

        let occurrences_deleted = self.store.purge_occurrences_before(cutoff).await?;
        let groups_deleted = if include_groups {
            self.store.purge_groups_before(cutoff).await?
        } else {
            0
        };

        info!(
            %cutoff,
            occurrences_deleted,
            groups_deleted,
            "purged expired error data"
        );
        Ok(PurgeReport {
            cutoff,
            occurrences_deleted,
            groups_deleted,
        })
    }

    pub async fn stats(&self) -> Result<StoreStats, TelemetryError> {
        Ok(self.store.stats().await?)
    }
}

fn not_found_as(err: faultline_state::StoreError, what: &str, id: Uuid) -> TelemetryError {
    match err {
        faultline_state::StoreError::NotFound(_) => {
            TelemetryError::NotFound(format!("{what} {id} not found"))
        }
        other => other.into(),
    }
}

impl std::fmt::Debug for ErrorRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecorder")
            .field("classifier", &self.classifier)
            .field("groups", &self.groups)
            .field("max_message_length", &self.max_message_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ErrorReporter for ErrorRecorder {
    async fn report(&self, occurrence: ErrorOccurrence) -> Result<(), ReportError> {
        self.record_occurrence(occurrence)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                TelemetryError::Store(store) => ReportError::Backend(store.to_string()),
                other => ReportError::Rejected(other.to_string()),
            })
    }
}
