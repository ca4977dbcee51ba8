use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::settings::TrackingSettings;
use crate::traits::ErrorStore;
use crate::types::{
    ErrorGroup, ErrorOccurrence, GroupFilter, GroupSort, KeyClaim, OccurrenceFilter, Page,
    Resolution, StoreStats,
};

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    occurrence_id: Uuid,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    groups: DashMap<Uuid, ErrorGroup>,
    signatures: DashMap<String, Uuid>,
    occurrences: RwLock<HashMap<Uuid, ErrorOccurrence>>,
    keys: DashMap<String, KeyEntry>,
    settings: RwLock<Option<TrackingSettings>>,
}

/// Process-local store. Suitable for tests and single-node deployments that
/// accept losing history on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_groups(groups: &mut [ErrorGroup], sort: GroupSort) {
    match sort {
        GroupSort::LastSeen => {
            groups.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        }
        GroupSort::FirstSeen => {
            groups.sort_by(|a, b| b.first_seen.cmp(&a.first_seen).then(a.id.cmp(&b.id)));
        }
        GroupSort::Count => groups.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.id.cmp(&b.id))
        }),
    }
}

#[async_trait]
impl ErrorStore for MemoryStore {
    async fn claim_idempotency_key(
        &self,
        key: &str,
        occurrence_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Result<KeyClaim, StoreError> {
        match self.inner.keys.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok(KeyClaim::Existing(existing.get().occurrence_id)),
            Entry::Vacant(slot) => {
                slot.insert(KeyEntry {
                    occurrence_id,
                    claimed_at,
                });
                Ok(KeyClaim::Claimed)
            }
        }
    }

    async fn release_idempotency_key(&self, key: &str) -> Result<(), StoreError> {
        self.inner.keys.remove(key);
        Ok(())
    }

    async fn find_group_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ErrorGroup>, StoreError> {
        let Some(id) = self.inner.signatures.get(signature).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.inner.groups.get(&id).map(|g| g.clone()))
    }

    async fn insert_group(&self, group: &ErrorGroup) -> Result<(), StoreError> {
        match self.inner.signatures.entry(group.signature.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "group with signature {} already exists",
                group.signature
            ))),
            Entry::Vacant(slot) => {
                // The group must be visible before its signature is.
                self.inner.groups.insert(group.id, group.clone());
                slot.insert(group.id);
                Ok(())
            }
        }
    }

    async fn touch_group(
        &self,
        id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<ErrorGroup, StoreError> {
        let mut group = self
            .inner
            .groups
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("group {id}")))?;
        group.touch(seen_at);
        Ok(group.clone())
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<ErrorGroup>, StoreError> {
        Ok(self.inner.groups.get(&id).map(|g| g.clone()))
    }

    async fn list_groups(
        &self,
        filter: &GroupFilter,
        sort: GroupSort,
        page: Page,
    ) -> Result<Vec<ErrorGroup>, StoreError> {
        let mut groups: Vec<ErrorGroup> = self
            .inner
            .groups
            .iter()
            .filter(|g| filter.matches(g.value()))
            .map(|g| g.value().clone())
            .collect();

        sort_groups(&mut groups, sort);

        Ok(groups
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn count_groups(&self, filter: &GroupFilter) -> Result<u64, StoreError> {
        let count = self
            .inner
            .groups
            .iter()
            .filter(|g| filter.matches(g.value()))
            .count();
        Ok(count as u64)
    }

    async fn set_group_resolution(
        &self,
        id: Uuid,
        resolution: Option<Resolution>,
        cascade: bool,
    ) -> Result<ErrorGroup, StoreError> {
        let updated = {
            let mut group = self
                .inner
                .groups
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("group {id}")))?;
            group.resolution.clone_from(&resolution);
            group.clone()
        };

        if cascade {
            let mut occurrences = self.inner.occurrences.write().await;
            for occurrence in occurrences.values_mut() {
                if occurrence.group_id == Some(id) {
                    occurrence.resolution.clone_from(&resolution);
                }
            }
        }

        Ok(updated)
    }

    async fn insert_occurrence(&self, occurrence: &ErrorOccurrence) -> Result<(), StoreError> {
        if let Some(group_id) = occurrence.group_id {
            if !self.inner.groups.contains_key(&group_id) {
                return Err(StoreError::NotFound(format!("group {group_id}")));
            }
        }

        let mut occurrences = self.inner.occurrences.write().await;
        if occurrences.contains_key(&occurrence.id) {
            return Err(StoreError::Conflict(format!(
                "occurrence {} already exists",
                occurrence.id
            )));
        }
        occurrences.insert(occurrence.id, occurrence.clone());
        Ok(())
    }

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<ErrorOccurrence>, StoreError> {
        let occurrences = self.inner.occurrences.read().await;
        Ok(occurrences.get(&id).cloned())
    }

    async fn list_occurrences(
        &self,
        filter: &OccurrenceFilter,
        page: Page,
    ) -> Result<Vec<ErrorOccurrence>, StoreError> {
        let occurrences = self.inner.occurrences.read().await;
        let mut matching: Vec<ErrorOccurrence> = occurrences
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        drop(occurrences);

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn count_occurrences(&self, filter: &OccurrenceFilter) -> Result<u64, StoreError> {
        let occurrences = self.inner.occurrences.read().await;
        Ok(occurrences.values().filter(|o| filter.matches(o)).count() as u64)
    }

    async fn set_occurrence_resolution(
        &self,
        id: Uuid,
        resolution: Option<Resolution>,
    ) -> Result<ErrorOccurrence, StoreError> {
        let mut occurrences = self.inner.occurrences.write().await;
        let occurrence = occurrences
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("occurrence {id}")))?;
        occurrence.resolution = resolution;
        Ok(occurrence.clone())
    }

    async fn purge_occurrences_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut occurrences = self.inner.occurrences.write().await;
        let before = occurrences.len();
        occurrences.retain(|_, o| o.created_at >= cutoff);
        let deleted = before - occurrences.len();
        drop(occurrences);

        self.inner.keys.retain(|_, entry| entry.claimed_at >= cutoff);

        debug!(occurrences = deleted, "purged occurrences");
        Ok(deleted as u64)
    }

    async fn purge_groups_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired: Vec<(Uuid, String)> = self
            .inner
            .groups
            .iter()
            .filter(|g| g.last_seen < cutoff)
            .map(|g| (g.id, g.signature.clone()))
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let mut occurrences = self.inner.occurrences.write().await;
        for (id, signature) in &expired {
            self.inner.signatures.remove(signature);
            self.inner.groups.remove(id);
        }
        // Occurrences never outlive their group.
        let before = occurrences.len();
        occurrences.retain(|_, o| {
            o.group_id
                .map_or(true, |group_id| !expired.iter().any(|(id, _)| *id == group_id))
        });
        let orphans = before - occurrences.len();
        drop(occurrences);

        debug!(groups = expired.len(), occurrences = orphans, "purged groups");
        Ok(expired.len() as u64)
    }

    async fn load_settings(&self) -> Result<Option<TrackingSettings>, StoreError> {
        Ok(self.inner.settings.read().await.clone())
    }

    async fn save_settings(&self, settings: &TrackingSettings) -> Result<(), StoreError> {
        *self.inner.settings.write().await = Some(settings.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total_groups = self.inner.groups.len() as u64;
        let unresolved_groups = self
            .inner
            .groups
            .iter()
            .filter(|g| !g.is_resolved())
            .count() as u64;
        let total_occurrences = self.inner.occurrences.read().await.len() as u64;

        Ok(StoreStats {
            total_groups,
            unresolved_groups,
            total_occurrences,
        })
    }
}
