use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::settings::TrackingSettings;
use crate::types::{
    ErrorGroup, ErrorOccurrence, GroupFilter, GroupSort, KeyClaim, OccurrenceFilter, Page,
    Resolution, StoreStats,
};

#[async_trait]
pub trait ErrorStore: Send + Sync {
    /// Reserve `key` for `occurrence_id`, or report who already holds it.
    async fn claim_idempotency_key(
        &self,
        key: &str,
        occurrence_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Result<KeyClaim, StoreError>;

    async fn release_idempotency_key(&self, key: &str) -> Result<(), StoreError>;

    async fn find_group_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ErrorGroup>, StoreError>;

    /// Insert a new group. Fails with [`StoreError::Conflict`] when a group
    /// with the same signature already exists.
    async fn insert_group(&self, group: &ErrorGroup) -> Result<(), StoreError>;

    /// Increment the occurrence count and widen the seen window to include
    /// `seen_at`.
    async fn touch_group(&self, id: Uuid, seen_at: DateTime<Utc>)
        -> Result<ErrorGroup, StoreError>;

    async fn get_group(&self, id: Uuid) -> Result<Option<ErrorGroup>, StoreError>;

    async fn list_groups(
        &self,
        filter: &GroupFilter,
        sort: GroupSort,
        page: Page,
    ) -> Result<Vec<ErrorGroup>, StoreError>;

    async fn count_groups(&self, filter: &GroupFilter) -> Result<u64, StoreError>;

    /// Set or clear a group's resolution. With `cascade`, the same
    /// resolution is stamped on every stored occurrence of the group.
    async fn set_group_resolution(
        &self,
        id: Uuid,
        resolution: Option<Resolution>,
        cascade: bool,
    ) -> Result<ErrorGroup, StoreError>;

    async fn insert_occurrence(&self, occurrence: &ErrorOccurrence) -> Result<(), StoreError>;

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<ErrorOccurrence>, StoreError>;

    /// Newest first.
    async fn list_occurrences(
        &self,
        filter: &OccurrenceFilter,
        page: Page,
    ) -> Result<Vec<ErrorOccurrence>, StoreError>;

    async fn count_occurrences(&self, filter: &OccurrenceFilter) -> Result<u64, StoreError>;

    async fn set_occurrence_resolution(
        &self,
        id: Uuid,
        resolution: Option<Resolution>,
    ) -> Result<ErrorOccurrence, StoreError>;

    /// Delete occurrences created before `cutoff`, with their idempotency keys.
    async fn purge_occurrences_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete groups last seen before `cutoff`.
    async fn purge_groups_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn load_settings(&self) -> Result<Option<TrackingSettings>, StoreError>;

    async fn save_settings(&self, settings: &TrackingSettings) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
