use crate::clock::SharedClock;
use crate::events::WorkflowEvent;
use crate::store::{EventStore, StoreError, StoredItem};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// In-process event table keyed by (correlation id, timestamp).
///
/// Writing the same key twice overwrites, matching the put semantics of the
/// real table.
#[derive(Debug)]
pub struct MemoryEventStore {
    partitions: RwLock<HashMap<String, BTreeMap<i64, StoredItem>>>,
    clock: SharedClock,
    ttl_seconds: i64,
}

impl MemoryEventStore {
    pub fn new(clock: SharedClock, ttl_seconds: i64) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            clock,
            ttl_seconds,
        }
    }

    pub fn put(&self, item: StoredItem) {
        let mut guard = self
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(item.correlation_id.clone())
            .or_default()
            .insert(item.timestamp, item);
    }

    /// Store an event with the default time-to-live.
    pub fn put_event(&self, event: &WorkflowEvent) -> Result<(), StoreError> {
        let ttl = self.clock.now_ms() / 1_000 + self.ttl_seconds;
        self.put(StoredItem::from_event(event, Some(ttl))?);
        Ok(())
    }

    pub fn len(&self, correlation_id: &str) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(correlation_id)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, correlation_id: &str) -> bool {
        self.len(correlation_id) == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn query_after(
        &self,
        correlation_id: &str,
        after_timestamp: i64,
    ) -> Result<Vec<StoredItem>, StoreError> {
        let now_secs = self.clock.now_ms() / 1_000;
        let guard = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(partition) = guard.get(correlation_id) else {
            return Ok(Vec::new());
        };

        Ok(partition
            .range(after_timestamp.saturating_add(1)..)
            .map(|(_, item)| item)
            .filter(|item| !item.is_expired(now_secs))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn started(correlation_id: &str, timestamp: i64) -> WorkflowEvent {
        WorkflowEvent::from_value(json!({
            "event_type": "node_start",
            "workflow_id": correlation_id,
            "timestamp": timestamp,
            "node_id": "analyzer"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_after_is_strict_and_ascending() {
        let store = MemoryEventStore::new(Arc::new(ManualClock::new(0)), 60);
        for ts in [30, 10, 20] {
            store.put_event(&started("wf", ts)).unwrap();
        }
        store.put_event(&started("other", 15)).unwrap();

        let all = store.query_after("wf", 0).await.unwrap();
        let stamps: Vec<i64> = all.iter().map(|i| i.timestamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);

        let tail = store.query_after("wf", 20).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].timestamp, 30);

        assert!(store.query_after("missing", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_items_are_hidden() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryEventStore::new(Arc::<ManualClock>::clone(&clock), 60);
        store.put_event(&started("wf", 1)).unwrap();

        clock.set(59_000);
        assert_eq!(store.query_after("wf", 0).await.unwrap().len(), 1);

        clock.set(60_000);
        assert!(store.query_after("wf", 0).await.unwrap().is_empty());
        assert_eq!(store.len("wf"), 1);
    }
}
