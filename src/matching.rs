//! Attribution of paired operations to conversational turns.
//!
//! A turn is one actor's span of activity. Engine-internal actor ids and
//! human-facing names differ (`escalation` vs. `Escalation Handler`), so both
//! sides are reduced to their first word, lowercased, before comparing.

use crate::clock::Clock;
use crate::events::{CompletionStatus, EventKind, WorkflowEvent};
use crate::pairing::PairedOperation;
use serde::{Deserialize, Serialize};

/// One actor's period of activity. Open-ended while `end_timestamp` is
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationalTurn {
    pub actor_name: String,
    pub start_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
}

impl ConversationalTurn {
    pub fn new(actor_name: impl Into<String>, start_timestamp: i64) -> Self {
        Self {
            actor_name: actor_name.into(),
            start_timestamp,
            end_timestamp: None,
        }
    }

    #[must_use]
    pub fn ended_at(mut self, end_timestamp: i64) -> Self {
        self.end_timestamp = Some(end_timestamp);
        self
    }

    pub fn is_open(&self) -> bool {
        self.end_timestamp.is_none()
    }

    /// Inclusive window check. An open turn extends to `now_ms`.
    pub fn contains(&self, timestamp: i64, now_ms: i64) -> bool {
        let end = self.end_timestamp.unwrap_or(now_ms);
        (self.start_timestamp..=end).contains(&timestamp)
    }
}

/// A turn enriched with the operations attributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedTurn {
    #[serde(flatten)]
    pub turn: ConversationalTurn,
    pub operations: Vec<PairedOperation>,
}

/// First whitespace, `_` or `-` delimited token, lowercased.
pub fn normalize_actor_name(name: &str) -> String {
    name.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .find(|token| !token.is_empty())
        .unwrap_or_default()
        .to_lowercase()
}

/// Attach every operation to each turn whose normalized actor name matches
/// and whose window contains the operation's timestamp.
///
/// Turns keep their input order; operations keep theirs. An operation that
/// matches no turn is left out.
pub fn attach(
    turns: &[ConversationalTurn],
    operations: &[PairedOperation],
    clock: &dyn Clock,
) -> Vec<AttributedTurn> {
    let now_ms = clock.now_ms();
    let operation_keys: Vec<String> = operations
        .iter()
        .map(|op| normalize_actor_name(op.actor_name()))
        .collect();

    turns
        .iter()
        .map(|turn| {
            let turn_key = normalize_actor_name(&turn.actor_name);
            let matched = operations
                .iter()
                .zip(&operation_keys)
                .filter(|(op, key)| **key == turn_key && turn.contains(op.timestamp, now_ms))
                .map(|(op, _)| op.clone())
                .collect();
            AttributedTurn {
                turn: turn.clone(),
                operations: matched,
            }
        })
        .collect()
}

/// Reconstruct turns from actor lifecycle events.
///
/// Each `actor_started` opens a turn named after the actor's display name
/// (falling back to its id); the next `actor_stopped` of the same actor
/// closes it. Unclosed turns stay open.
pub fn derive_turns<'a, I>(events: I) -> Vec<ConversationalTurn>
where
    I: IntoIterator<Item = &'a WorkflowEvent>,
{
    let mut ordered: Vec<&WorkflowEvent> = events.into_iter().collect();
    ordered.sort_by_key(|event| event.timestamp);

    // (actor id, turn index) for turns still open
    let mut open: Vec<(&str, usize)> = Vec::new();
    let mut turns = Vec::new();

    for event in ordered {
        match &event.kind {
            EventKind::ActorStarted {
                actor_name,
                display_name,
                ..
            } => {
                let label = display_name.as_deref().unwrap_or(actor_name);
                open.push((actor_name.as_str(), turns.len()));
                turns.push(ConversationalTurn::new(label, event.timestamp));
            }
            EventKind::ActorStopped {
                actor_name,
                completion_status,
                ..
            } => {
                let Some(position) = open.iter().position(|(id, _)| *id == actor_name.as_str())
                else {
                    tracing::trace!(actor = %actor_name, "Stop without a matching start");
                    continue;
                };
                let (_, index) = open.remove(position);
                turns[index].end_timestamp = Some(event.timestamp);
                if *completion_status == CompletionStatus::Unknown {
                    tracing::debug!(actor = %actor_name, "Actor stopped with unknown status");
                }
            }
            _ => {}
        }
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pairing::pair;
    use serde_json::json;

    fn operation(timestamp: i64, actor: &str) -> WorkflowEvent {
        WorkflowEvent::from_value(json!({
            "event_type": "tool_call",
            "correlation_id": "wf",
            "timestamp": timestamp,
            "actor_name": actor,
            "subject": "ticketing",
            "action": "create_ticket",
            "status": "completed"
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_actor_name() {
        assert_eq!(normalize_actor_name("Escalation Handler"), "escalation");
        assert_eq!(normalize_actor_name("escalation"), "escalation");
        assert_eq!(normalize_actor_name("order_lookup"), "order");
        assert_eq!(normalize_actor_name("Order-Lookup Agent"), "order");
        assert_eq!(normalize_actor_name("  Triage"), "triage");
        assert_eq!(normalize_actor_name(""), "");
    }

    #[test]
    fn test_operation_attaches_inside_the_window_only() {
        let clock = ManualClock::new(100_000);
        let turns = [ConversationalTurn::new("Escalation Handler", 4_000).ended_at(6_000)];

        let inside = pair(&[operation(5_000, "escalation")]);
        let attributed = attach(&turns, &inside, &clock);
        assert_eq!(attributed[0].operations.len(), 1);

        let outside = pair(&[operation(7_000, "escalation")]);
        let attributed = attach(&turns, &outside, &clock);
        assert!(attributed[0].operations.is_empty());
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let clock = ManualClock::new(0);
        let turn = ConversationalTurn::new("escalation", 4_000).ended_at(6_000);
        assert!(turn.contains(4_000, clock.now_ms()));
        assert!(turn.contains(6_000, clock.now_ms()));
        assert!(!turn.contains(3_999, clock.now_ms()));
    }

    #[test]
    fn test_open_turn_extends_to_now() {
        let clock = ManualClock::new(8_000);
        let turns = [ConversationalTurn::new("Escalation Handler", 4_000)];
        let ops = pair(&[operation(9_000, "escalation")]);

        assert!(attach(&turns, &ops, &clock)[0].operations.is_empty());

        clock.advance(2_000);
        assert_eq!(attach(&turns, &ops, &clock)[0].operations.len(), 1);
    }

    #[test]
    fn test_name_mismatch_never_attaches() {
        let clock = ManualClock::new(10_000);
        let turns = [ConversationalTurn::new("Billing Agent", 0)];
        let ops = pair(&[operation(5_000, "escalation")]);
        assert!(attach(&turns, &ops, &clock)[0].operations.is_empty());
    }

    #[test]
    fn test_derive_turns_from_lifecycle_events() {
        let events: Vec<WorkflowEvent> = [
            json!({"event_type": "node_start", "workflow_id": "wf", "timestamp": 1_000,
                   "node_id": "triage", "node_name": "Triage Agent"}),
            json!({"event_type": "node_stop", "workflow_id": "wf", "timestamp": 3_000,
                   "node_id": "triage", "status": "completed"}),
            json!({"event_type": "node_start", "workflow_id": "wf", "timestamp": 4_000,
                   "node_id": "escalation"}),
        ]
        .into_iter()
        .map(|value| WorkflowEvent::from_value(value).unwrap())
        .collect();

        let turns = derive_turns(&events);
        assert_eq!(
            turns,
            vec![
                ConversationalTurn::new("Triage Agent", 1_000).ended_at(3_000),
                ConversationalTurn::new("escalation", 4_000),
            ]
        );
        assert!(turns[1].is_open());
    }
}
