//! Live event fan-out.
//!
//! Every event goes to the global topic and to the topic of its group, if
//! anyone subscribed to it. Publishing never blocks: a slow subscriber
//! lags and loses the oldest events.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use faultline_state::{ErrorGroup, ErrorSource, Resolution};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default per-topic buffer, in events.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorEvent {
    OccurrenceCreated {
        group_id: Uuid,
        occurrence_id: Uuid,
        status_code: u16,
        message: String,
        source: ErrorSource,
        created_at: DateTime<Utc>,
    },
    GroupCreated {
        group: ErrorGroup,
    },
    GroupResolved {
        group_id: Uuid,
        resolution: Resolution,
    },
    GroupReopened {
        group_id: Uuid,
    },
    ThresholdReached {
        group_id: Uuid,
        occurrence_count: u64,
        threshold: u64,
    },
}

impl ErrorEvent {
    pub const fn group_id(&self) -> Uuid {
        match self {
            Self::OccurrenceCreated { group_id, .. }
            | Self::GroupResolved { group_id, .. }
            | Self::GroupReopened { group_id }
            | Self::ThresholdReached { group_id, .. } => *group_id,
            Self::GroupCreated { group } => group.id,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::OccurrenceCreated { .. } => "occurrence_created",
            Self::GroupCreated { .. } => "group_created",
            Self::GroupResolved { .. } => "group_resolved",
            Self::GroupReopened { .. } => "group_reopened",
            Self::ThresholdReached { .. } => "threshold_reached",
        }
    }
}

#[derive(Debug)]
pub struct Broadcaster {
    all: broadcast::Sender<ErrorEvent>,
    groups: DashMap<Uuid, broadcast::Sender<ErrorEvent>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            all,
            groups: DashMap::new(),
            capacity,
        }
    }

    /// Deliver `event` to current subscribers. Never fails.
    pub fn publish(&self, event: ErrorEvent) {
        let group_id = event.group_id();
        tracing::trace!(event = event.name(), %group_id, "publishing event");

        let stale = match self.groups.get(&group_id) {
            Some(tx) => tx.send(event.clone()).is_err(),
            None => false,
        };
        if stale {
            self.groups
                .remove_if(&group_id, |_, tx| tx.receiver_count() == 0);
        }

        // No receivers is not an error here.
        let _ = self.all.send(event);
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ErrorEvent> {
        self.all.subscribe()
    }

    pub fn subscribe_group(&self, group_id: Uuid) -> broadcast::Receiver<ErrorEvent> {
        self.groups
            .entry(group_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop group topics nobody listens to any more.
    pub fn prune(&self) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, tx| tx.receiver_count() > 0);
        before - self.groups.len()
    }

    pub fn group_topic_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    use super::*;

    fn reopened(group_id: Uuid) -> ErrorEvent {
        ErrorEvent::GroupReopened { group_id }
    }

    #[tokio::test]
    async fn global_and_group_topics_receive_events() {
        let broadcaster = Broadcaster::default();
        let group = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut all = broadcaster.subscribe_all();
        let mut mine = broadcaster.subscribe_group(group);

        broadcaster.publish(reopened(group));
        broadcaster.publish(reopened(other));

        assert_eq!(all.recv().await.unwrap(), reopened(group));
        assert_eq!(all.recv().await.unwrap(), reopened(other));
        assert_eq!(mine.recv().await.unwrap(), reopened(group));
        assert!(matches!(mine.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let broadcaster = Broadcaster::default();
        broadcaster.publish(reopened(Uuid::new_v4()));
        assert_eq!(broadcaster.group_topic_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscribers_lose_oldest_events() {
        let broadcaster = Broadcaster::new(2);
        let group = Uuid::new_v4();
        let mut rx = broadcaster.subscribe_all();

        for _ in 0..5 {
            broadcaster.publish(reopened(group));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), reopened(group));
    }

    #[test]
    fn group_topics_are_pruned_when_unused() {
        let broadcaster = Broadcaster::default();
        let group = Uuid::new_v4();

        let rx = broadcaster.subscribe_group(group);
        assert_eq!(broadcaster.group_topic_count(), 1);
        assert_eq!(broadcaster.prune(), 0);

        drop(rx);
        broadcaster.publish(reopened(group));
        assert_eq!(broadcaster.group_topic_count(), 0);

        let _rx = broadcaster.subscribe_group(group);
        let rx2 = broadcaster.subscribe_group(Uuid::new_v4());
        drop(rx2);
        assert_eq!(broadcaster.prune(), 1);
        assert_eq!(broadcaster.group_topic_count(), 1);
    }

    #[test]
    fn events_serialise_with_type_tag() {
        let group_id = Uuid::nil();
        let json = serde_json::to_value(ErrorEvent::ThresholdReached {
            group_id,
            occurrence_count: 100,
            threshold: 100,
        })
        .unwrap();
        assert_eq!(json["type"], "threshold_reached");
        assert_eq!(json["occurrence_count"], 100);
        assert_eq!(json["group_id"], group_id.to_string());
    }
}
