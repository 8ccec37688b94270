//! Event classifier: raw [`WorkflowEvent`]s to [`DisplayEntry`]s.
//!
//! Token emissions and structure announcements are always suppressed: the
//! first are too frequent for a log view and the second is rendered
//! elsewhere. Every other kind maps to exactly one entry.

use crate::config::DisplayConfig;
use crate::display::{
    DisplayEntry, EntryCategory, EntryStatus, format_duration_ms, truncate_preview,
};
use crate::events::{
    CompletionStatus, EventKind, OperationEvent, OperationStatus, WorkflowEvent,
};
use serde_json::{Map, Value, json};

/// Classify with the default display settings.
pub fn classify(event: &WorkflowEvent) -> Option<DisplayEntry> {
    classify_with(event, &DisplayConfig::default())
}

pub fn classify_with(event: &WorkflowEvent, config: &DisplayConfig) -> Option<DisplayEntry> {
    let id = format!("{}:{}", event.correlation_id, event.timestamp);
    let entry = |category, actor: &str, summary: String, payload, status, duration_ms| {
        DisplayEntry::new(
            id.clone(),
            event.timestamp,
            category,
            actor.to_string(),
            summary,
            payload,
            status,
            duration_ms,
        )
    };

    match &event.kind {
        EventKind::TokenEmitted { .. } | EventKind::StructureAnnounced { .. } => None,

        EventKind::ToolCall(op) => classify_operation(op, config).map(|(summary, status, payload)| {
            entry(
                EntryCategory::Operation,
                &op.actor_name,
                summary,
                payload,
                status,
                op.duration_ms,
            )
        }),

        EventKind::ActorStarted {
            actor_name,
            display_name,
            from_actor,
            handoff_prompt,
        } => {
            let label = display_name.as_deref().unwrap_or(actor_name);
            let payload = object_payload([
                ("from_actor", from_actor.clone().map(Value::String)),
                ("handoff_prompt", handoff_prompt.clone().map(Value::String)),
            ]);
            Some(entry(
                EntryCategory::Actor,
                actor_name,
                format!("{label} started"),
                payload,
                EntryStatus::Neutral,
                None,
            ))
        }

        EventKind::ActorStopped {
            actor_name,
            display_name,
            completion_status,
            duration_ms,
            response,
            error,
        } => {
            let label = display_name.as_deref().unwrap_or(actor_name);
            let payload = object_payload([
                ("response", response.clone()),
                ("error", error.clone().map(Value::String)),
            ]);
            let (summary, status) = if *completion_status == CompletionStatus::Completed {
                let summary = match duration_ms {
                    Some(ms) => format!("{label} completed in {}", format_duration_ms(*ms)),
                    None => format!("{label} completed"),
                };
                (summary, EntryStatus::Success)
            } else {
                (format!("{label} failed"), EntryStatus::Error)
            };
            Some(entry(
                EntryCategory::Actor,
                actor_name,
                summary,
                payload,
                status,
                *duration_ms,
            ))
        }

        EventKind::RouterDecision {
            from_actor,
            next_actor,
            router_model,
            duration_ms,
        } => {
            let summary = match router_model {
                Some(model) => format!("Routed {from_actor} → {next_actor} ({model})"),
                None => format!("Routed {from_actor} → {next_actor}"),
            };
            Some(entry(
                EntryCategory::Routing,
                from_actor,
                summary,
                None,
                EntryStatus::Neutral,
                *duration_ms,
            ))
        }

        EventKind::ParallelStarted { actors, from_actor } => Some(entry(
            EntryCategory::Parallel,
            from_actor.as_deref().unwrap_or_default(),
            format!("Parallel start: {}", actors.join(", ")),
            Some(json!({ "actors": actors })),
            EntryStatus::Neutral,
            None,
        )),

        EventKind::ConvergenceReady {
            convergence_actor,
            completed_actors,
        } => {
            let summary = match convergence_actor {
                Some(actor) => format!(
                    "Converging at {actor} ({} completed)",
                    completed_actors.len()
                ),
                None => format!("Parallel branches done ({} completed)", completed_actors.len()),
            };
            Some(entry(
                EntryCategory::Parallel,
                convergence_actor.as_deref().unwrap_or_default(),
                summary,
                Some(json!({ "completed_actors": completed_actors })),
                EntryStatus::Neutral,
                None,
            ))
        }

        EventKind::WorkflowCompleted {
            total_duration_ms,
            execution_order,
            final_actor,
        } => {
            let mut summary = match total_duration_ms {
                Some(ms) => format!("Workflow completed in {}", format_duration_ms(*ms)),
                None => "Workflow completed".to_string(),
            };
            if !execution_order.is_empty() {
                summary.push_str(" · ");
                summary.push_str(&execution_order.join(" → "));
            }
            let payload = object_payload([
                ("execution_order", Some(json!(execution_order))),
                ("final_actor", final_actor.clone().map(Value::String)),
            ]);
            Some(entry(
                EntryCategory::Workflow,
                final_actor.as_deref().unwrap_or_default(),
                summary,
                payload,
                EntryStatus::Success,
                *total_duration_ms,
            ))
        }

        EventKind::WorkflowFailed {
            error_message,
            failed_actor,
        } => Some(entry(
            EntryCategory::Workflow,
            failed_actor.as_deref().unwrap_or_default(),
            format!(
                "Workflow failed: {}",
                truncate_preview(error_message, config.error_preview_chars)
            ),
            Some(json!({ "error": error_message })),
            EntryStatus::Error,
            None,
        )),
    }
}

fn classify_operation(
    op: &OperationEvent,
    config: &DisplayConfig,
) -> Option<(String, EntryStatus, Option<Value>)> {
    if op.action.trim().is_empty() || op.actor_name.trim().is_empty() {
        return None;
    }

    let target = if op.subject.is_empty() {
        op.action.clone()
    } else {
        format!("{} → {}", op.subject, op.action)
    };
    let payload = object_payload([
        ("input", op.input.clone()),
        ("output", op.output.clone()),
        ("error", op.error_message.clone().map(Value::String)),
    ]);

    let (summary, status) = match op.status {
        OperationStatus::Started => (target, EntryStatus::Neutral),
        OperationStatus::Completed => (target, EntryStatus::Success),
        OperationStatus::Failed => {
            let summary = match &op.error_message {
                Some(message) => format!(
                    "{target} failed: {}",
                    truncate_preview(message, config.error_preview_chars)
                ),
                None => format!("{target} failed"),
            };
            (summary, EntryStatus::Error)
        }
    };
    Some((summary, status, payload))
}

/// JSON object of the present fields, or `None` when all are absent.
fn object_payload<const N: usize>(fields: [(&str, Option<Value>); N]) -> Option<Value> {
    let map: Map<String, Value> = fields
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
        .collect();
    (!map.is_empty()).then_some(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(value: Value) -> WorkflowEvent {
        WorkflowEvent::from_value(value).unwrap()
    }

    #[test]
    fn test_suppressed_kinds_never_produce_entries() {
        let token = decode(json!({
            "event_type": "token_emitted", "correlation_id": "wf", "timestamp": 1, "text": "Hel"
        }));
        let structure = decode(json!({
            "event_type": "graph_structure", "workflow_id": "wf", "timestamp": 2,
            "graph": {"nodes": ["a", "b"], "edges": []}
        }));
        let empty_structure = decode(json!({
            "event_type": "structure_announced", "correlation_id": "wf", "timestamp": 3
        }));

        assert!(classify(&token).is_none());
        assert!(classify(&structure).is_none());
        assert!(classify(&empty_structure).is_none());
    }

    #[test]
    fn test_actor_lifecycle_entries() {
        let started = classify(&decode(json!({
            "event_type": "node_start", "workflow_id": "wf", "timestamp": 10,
            "node_id": "escalation", "node_name": "Escalation Handler"
        })))
        .unwrap();
        assert_eq!(started.summary(), "Escalation Handler started");
        assert_eq!(started.actor_name(), "escalation");
        assert_eq!(started.status(), EntryStatus::Neutral);
        assert_eq!(started.id(), "wf:10");

        let stopped = classify(&decode(json!({
            "event_type": "actor_stopped", "correlation_id": "wf", "timestamp": 20,
            "actor_name": "analyzer", "completion_status": "completed", "duration_ms": 1234
        })))
        .unwrap();
        assert_eq!(stopped.summary(), "analyzer completed in 1.2s");
        assert_eq!(stopped.status(), EntryStatus::Success);
        assert_eq!(stopped.duration_ms(), Some(1234));

        let failed = classify(&decode(json!({
            "event_type": "node_stop", "workflow_id": "wf", "timestamp": 30,
            "node_id": "analyzer", "status": "error", "error": "timeout"
        })))
        .unwrap();
        assert_eq!(failed.summary(), "analyzer failed");
        assert_eq!(failed.status(), EntryStatus::Error);
        assert_eq!(failed.payload().unwrap()["error"], "timeout");
    }

    #[test]
    fn test_operation_entries() {
        let started = classify(&decode(json!({
            "event_type": "tool_call", "correlation_id": "wf", "timestamp": 1000,
            "actor_name": "analyzer", "subject": "crm", "action": "lookup_user",
            "status": "started", "input": {"user_id": "u-1"}
        })))
        .unwrap();
        assert_eq!(started.summary(), "crm → lookup_user");
        assert_eq!(started.status(), EntryStatus::Neutral);
        assert_eq!(started.category(), EntryCategory::Operation);
        assert_eq!(started.payload().unwrap()["input"]["user_id"], "u-1");

        let failed = classify(&decode(json!({
            "event_type": "tool_call", "correlation_id": "wf", "timestamp": 1300,
            "agent": "analyzer", "tool_name": "lookup_user",
            "status": "error", "error_message": "user not found"
        })))
        .unwrap();
        assert_eq!(failed.summary(), "lookup_user failed: user not found");
        assert_eq!(failed.status(), EntryStatus::Error);
    }

    #[test]
    fn test_operation_without_action_is_skipped() {
        let event = decode(json!({
            "event_type": "tool_call", "correlation_id": "wf", "timestamp": 5,
            "actor_name": "analyzer", "action": "  ", "status": "started"
        }));
        assert!(classify(&event).is_none());
    }

    #[test]
    fn test_workflow_outcomes() {
        let done = classify(&decode(json!({
            "event_type": "workflow_completed", "correlation_id": "wf", "timestamp": 50,
            "total_duration_ms": 12_345, "execution_order": ["triage", "escalation"]
        })))
        .unwrap();
        assert_eq!(done.summary(), "Workflow completed in 12.3s · triage → escalation");
        assert_eq!(done.status(), EntryStatus::Success);

        let long_error = "x".repeat(500);
        let failed = classify(&decode(json!({
            "event_type": "workflow_error", "workflow_id": "wf", "timestamp": 60,
            "error": long_error
        })))
        .unwrap();
        assert_eq!(failed.status(), EntryStatus::Error);
        assert!(failed.summary().chars().count() < 150);
        assert_eq!(failed.payload().unwrap()["error"].as_str().unwrap().len(), 500);
    }

    #[test]
    fn test_routing_and_parallel_entries() {
        let routed = classify(&decode(json!({
            "event_type": "router_decision", "workflow_id": "wf", "timestamp": 70,
            "router_model": "haiku", "from_agent": "triage", "next_agent": "escalation",
            "duration_ms": 120
        })))
        .unwrap();
        assert_eq!(routed.summary(), "Routed triage → escalation (haiku)");
        assert_eq!(routed.category(), EntryCategory::Routing);

        let fan_out = classify(&decode(json!({
            "event_type": "parallel_node_start", "workflow_id": "wf", "timestamp": 80,
            "node_ids": ["billing", "shipping"]
        })))
        .unwrap();
        assert_eq!(fan_out.summary(), "Parallel start: billing, shipping");

        let converge = classify(&decode(json!({
            "event_type": "convergence_ready", "workflow_id": "wf", "timestamp": 90,
            "convergence_node": "summarizer", "completed_agents": ["billing", "shipping"]
        })))
        .unwrap();
        assert_eq!(converge.summary(), "Converging at summarizer (2 completed)");
    }
}
