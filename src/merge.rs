//! Merge layer: one deduplicated feed out of the realtime and polled
//! channels.
//!
//! Events are keyed by `(correlation_id, timestamp)`. The first arrival of a
//! key is forwarded tagged with its source; any later arrival, from either
//! channel, is dropped. Realtime events are forwarded as they arrive and
//! polled batches in their ascending order, so there is no cross-source
//! total order. Consumers that need one sort by timestamp.

use crate::events::{DedupKey, EventSource, SourcedEvent, WorkflowEvent};
use crate::polling::PolledBatch;
use std::collections::HashSet;

/// Merge buffer for the observation of one correlation id.
#[derive(Debug, Default)]
pub struct EventMerger {
    correlation_id: Option<String>,
    seen: HashSet<DedupKey>,
    buffer: Vec<SourcedEvent>,
}

impl EventMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything and start accepting events for `correlation_id`.
    /// `None` stops accepting events altogether.
    pub fn reset(&mut self, correlation_id: Option<String>) {
        self.correlation_id = correlation_id;
        self.seen.clear();
        self.buffer.clear();
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Offer one event. Returns it, tagged, when it is new.
    pub fn accept(&mut self, source: EventSource, event: WorkflowEvent) -> Option<SourcedEvent> {
        if self.correlation_id.as_deref() != Some(event.correlation_id.as_str()) {
            tracing::trace!(
                correlation_id = %event.correlation_id,
                ?source,
                "Dropping event for inactive correlation"
            );
            return None;
        }
        if !self.seen.insert(event.dedup_key()) {
            tracing::trace!(timestamp = event.timestamp, ?source, "Dropping duplicate event");
            return None;
        }

        let sourced = SourcedEvent { source, event };
        self.buffer.push(sourced.clone());
        Some(sourced)
    }

    /// Offer a polled batch, preserving its order.
    pub fn accept_batch(&mut self, batch: PolledBatch) -> Vec<SourcedEvent> {
        batch
            .events
            .into_iter()
            .filter_map(|event| self.accept(EventSource::Polled, event))
            .collect()
    }

    /// Everything forwarded so far, in forwarding order.
    pub fn buffered(&self) -> &[SourcedEvent] {
        &self.buffer
    }

    /// Everything forwarded so far, ordered by timestamp.
    pub fn events_by_timestamp(&self) -> Vec<&WorkflowEvent> {
        let mut events: Vec<&WorkflowEvent> = self.buffer.iter().map(|s| &s.event).collect();
        events.sort_by_key(|event| event.timestamp);
        events
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actor_started(correlation_id: &str, timestamp: i64) -> WorkflowEvent {
        WorkflowEvent::from_value(json!({
            "event_type": "actor_started",
            "correlation_id": correlation_id,
            "timestamp": timestamp,
            "actor_name": "analyzer"
        }))
        .unwrap()
    }

    #[test]
    fn test_same_event_on_both_channels_is_forwarded_once() {
        let mut merger = EventMerger::new();
        merger.reset(Some("wf".into()));

        let first = merger.accept(EventSource::Realtime, actor_started("wf", 100));
        assert_eq!(first.unwrap().source, EventSource::Realtime);

        let forwarded = merger.accept_batch(PolledBatch {
            correlation_id: "wf".into(),
            events: vec![actor_started("wf", 100), actor_started("wf", 200)],
        });
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].source, EventSource::Polled);
        assert_eq!(forwarded[0].event.timestamp, 200);

        assert!(
            merger
                .accept(EventSource::Realtime, actor_started("wf", 200))
                .is_none()
        );
        assert_eq!(merger.len(), 2);
    }

    #[test]
    fn test_reset_isolates_correlations() {
        let mut merger = EventMerger::new();
        merger.reset(Some("a".into()));
        assert!(merger.accept(EventSource::Polled, actor_started("a", 1)).is_some());

        merger.reset(Some("b".into()));
        assert!(merger.is_empty());
        assert!(merger.accept(EventSource::Realtime, actor_started("a", 2)).is_none());
        assert!(merger.accept(EventSource::Realtime, actor_started("b", 1)).is_some());
    }

    #[test]
    fn test_nothing_is_accepted_without_a_correlation() {
        let mut merger = EventMerger::new();
        assert!(merger.accept(EventSource::Realtime, actor_started("wf", 1)).is_none());
    }

    #[test]
    fn test_timestamp_order_is_available_on_demand() {
        let mut merger = EventMerger::new();
        merger.reset(Some("wf".into()));
        merger.accept(EventSource::Realtime, actor_started("wf", 300));
        merger.accept_batch(PolledBatch {
            correlation_id: "wf".into(),
            events: vec![actor_started("wf", 100), actor_started("wf", 200)],
        });

        let forwarded: Vec<i64> = merger.buffered().iter().map(|s| s.event.timestamp).collect();
        assert_eq!(forwarded, vec![300, 100, 200]);

        let ordered: Vec<i64> = merger
            .events_by_timestamp()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(ordered, vec![100, 200, 300]);
    }
}
