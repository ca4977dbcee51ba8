//! Find-or-create of error groups under concurrent writers.

use std::sync::Arc;

use faultline_state::{ErrorGroup, ErrorOccurrence, ErrorStore, StoreError};
use tracing::{debug, instrument};

use crate::TelemetryError;

/// Default attempts before giving up on a contended signature.
pub const DEFAULT_MAX_GROUP_ATTEMPTS: u32 = 3;

/// Group an occurrence was attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGroup {
    /// State after this occurrence was counted.
    pub group: ErrorGroup,
    pub created: bool,
}

/// Resolves a signature to its group, creating it on first sight.
///
/// Relies on the store rejecting a second group with the same signature:
/// the loser of a creation race re-fetches and touches the winner's group.
#[derive(Clone)]
pub struct GroupResolver {
    store: Arc<dyn ErrorStore>,
    max_attempts: u32,
}

impl GroupResolver {
    pub fn new(store: Arc<dyn ErrorStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    #[instrument(skip(self, occurrence), fields(occurrence_id = %occurrence.id))]
    pub async fn find_or_create(
        &self,
        signature: &str,
        occurrence: &ErrorOccurrence,
    ) -> Result<ResolvedGroup, TelemetryError> {
        for attempt in 1..=self.max_attempts {
            if let Some(existing) = self.store.find_group_by_signature(signature).await? {
                match self.store.touch_group(existing.id, occurrence.created_at).await {
                    Ok(group) => {
                        return Ok(ResolvedGroup {
                            group,
                            created: false,
                        })
                    }
                    // Purged between lookup and touch.
                    Err(StoreError::NotFound(_)) => {
                        debug!(attempt, group_id = %existing.id, "group vanished before touch");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let seed = ErrorGroup::seed(signature, occurrence);
            match self.store.insert_group(&seed).await {
                Ok(()) => {
                    return Ok(ResolvedGroup {
                        group: seed,
                        created: true,
                    })
                }
                Err(e) if e.is_conflict() => {
                    debug!(attempt, "lost group creation race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TelemetryError::GroupingExhausted {
            signature: signature.to_owned(),
            attempts: self.max_attempts,
        })
    }
}

impl std::fmt::Debug for GroupResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupResolver")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use chrono::{DateTime, Duration, Utc};
    use faultline_state::MemoryStore;

    use super::*;

    static BASE: LazyLock<DateTime<Utc>> = LazyLock::new(Utc::now);

    fn occurrence_at(offset_secs: i64) -> ErrorOccurrence {
        ErrorOccurrence::new("Widget 42 not found", "NotFound", 404, "/api/widgets/42")
            .with_route("/api/widgets/{id}")
            .with_created_at(*BASE + Duration::seconds(offset_secs))
    }

    #[tokio::test]
    async fn first_sight_creates_then_touches() {
        let store: Arc<dyn ErrorStore> = Arc::new(MemoryStore::new());
        let resolver = GroupResolver::new(Arc::clone(&store), DEFAULT_MAX_GROUP_ATTEMPTS);
        let signature = "a".repeat(64);

        let first = resolver.find_or_create(&signature, &occurrence_at(0)).await.unwrap();
        assert!(first.created);
        assert_eq!(first.group.occurrence_count, 1);

        let second = resolver.find_or_create(&signature, &occurrence_at(-30)).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.group.id, first.group.id);
        assert_eq!(second.group.occurrence_count, 2);
        assert!(second.group.first_seen < first.group.first_seen);
        assert_eq!(second.group.last_seen, first.group.last_seen);
    }

    #[tokio::test]
    async fn concurrent_creation_settles_on_one_group() {
        let store: Arc<dyn ErrorStore> = Arc::new(MemoryStore::new());
        let resolver = GroupResolver::new(Arc::clone(&store), DEFAULT_MAX_GROUP_ATTEMPTS);
        let signature = "b".repeat(64);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let resolver = resolver.clone();
                let signature = signature.clone();
                tokio::spawn(async move {
                    resolver
                        .find_or_create(&signature, &occurrence_at(i))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let group = store.find_group_by_signature(&signature).await.unwrap().unwrap();
        assert_eq!(group.occurrence_count, 16);
        assert_eq!(group.last_seen - group.first_seen, Duration::seconds(15));
    }
}
