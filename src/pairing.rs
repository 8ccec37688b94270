//! Pairing of operation halves.
//!
//! Operation events are grouped by `(actor_name, subject, action)`. Within a
//! group the earliest `started` half and the earliest `completed`/`failed`
//! half are joined into one [`PairedOperation`] whose duration is the gap
//! between them. A group with only one kind of half yields that event
//! unchanged. Each group yields at most one record.

use crate::events::{OperationEvent, WorkflowEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One operation, joined with its start when both halves were seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedOperation {
    pub correlation_id: String,
    /// Timestamp of the carried event (the completion half when paired).
    pub timestamp: i64,
    pub operation: OperationEvent,
    /// Present only when both halves were found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Timestamp of the `started` half, when seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

impl PairedOperation {
    pub fn actor_name(&self) -> &str {
        &self.operation.actor_name
    }

    /// `true` when only the `started` half has been seen.
    pub fn is_in_flight(&self) -> bool {
        !self.operation.status.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.operation.status == crate::events::OperationStatus::Failed
    }
}

type GroupKey<'a> = (&'a str, &'a str, &'a str);

/// Pair the operation events among `events`. Other kinds are ignored.
///
/// Deterministic: the output is ordered by timestamp, then by group key.
pub fn pair<'a, I>(events: I) -> Vec<PairedOperation>
where
    I: IntoIterator<Item = &'a WorkflowEvent>,
{
    let mut groups: BTreeMap<GroupKey<'a>, Vec<(&'a WorkflowEvent, &'a OperationEvent)>> =
        BTreeMap::new();
    for event in events {
        if let Some(op) = event.as_operation() {
            groups
                .entry((
                    op.actor_name.as_str(),
                    op.subject.as_str(),
                    op.action.as_str(),
                ))
                .or_default()
                .push((event, op));
        }
    }

    let mut paired: Vec<(GroupKey<'a>, PairedOperation)> = groups
        .into_iter()
        .filter_map(|(key, mut halves)| {
            halves.sort_by_key(|(event, _)| event.timestamp);
            let started = halves.iter().find(|(_, op)| !op.status.is_terminal());
            let finished = halves.iter().find(|(_, op)| op.status.is_terminal());

            let record = match (started, finished) {
                (Some((start, _)), Some((end, op))) => PairedOperation {
                    correlation_id: end.correlation_id.clone(),
                    timestamp: end.timestamp,
                    operation: (*op).clone(),
                    duration_ms: u64::try_from(end.timestamp - start.timestamp).ok(),
                    started_at: Some(start.timestamp),
                },
                (Some((start, op)), None) => PairedOperation {
                    correlation_id: start.correlation_id.clone(),
                    timestamp: start.timestamp,
                    operation: (*op).clone(),
                    duration_ms: None,
                    started_at: Some(start.timestamp),
                },
                (None, Some((end, op))) => PairedOperation {
                    correlation_id: end.correlation_id.clone(),
                    timestamp: end.timestamp,
                    operation: (*op).clone(),
                    duration_ms: None,
                    started_at: None,
                },
                (None, None) => return None,
            };
            Some((key, record))
        })
        .collect();

    paired.sort_by(|(a_key, a), (b_key, b)| {
        a.timestamp.cmp(&b.timestamp).then_with(|| a_key.cmp(b_key))
    });
    paired.into_iter().map(|(_, record)| record).collect()
}
