//! Workflow event model shared by both event channels.
//!
//! Raw events arrive as JSON objects, either as one line of the local
//! process's stdout or as one item of the persistent store. Both decode into
//! a [`WorkflowEvent`]: the common envelope (`correlation_id`, `timestamp`)
//! plus an [`EventKind`] tagged union over every concrete kind.
//!
//! # Example
//!
//! ```rust
//! use workflow_monitor::events::{EventKind, WorkflowEvent};
//!
//! let event = WorkflowEvent::from_json_str(
//!     r#"{"event_type":"node_start","workflow_id":"wf-1","timestamp":1000,"node_id":"analyzer"}"#,
//! )
//! .unwrap();
//! assert!(matches!(event.kind, EventKind::ActorStarted { .. }));
//! assert_eq!(event.actor_name(), Some("analyzer"));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which channel delivered an event. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Pushed by the locally running process.
    Realtime,
    /// Fetched from the persistent store.
    Polled,
}

/// Deduplication key. Unique per event within a correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub correlation_id: String,
    pub timestamp: i64,
}

/// One raw event of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Identifies the workflow run.
    pub correlation_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Status of one half of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Started,
    Completed,
    #[serde(alias = "error")]
    Failed,
}

impl OperationStatus {
    /// `true` for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// Outcome reported when an actor stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    #[serde(alias = "error")]
    Failed,
    #[serde(other)]
    Unknown,
}

/// A tool invocation (or any other asynchronous sub-operation) performed by
/// an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    /// Logical component performing the operation.
    #[serde(alias = "agent")]
    pub actor_name: String,
    /// System or capability being invoked.
    #[serde(default, alias = "system")]
    pub subject: String,
    /// Specific operation.
    #[serde(alias = "tool_name", alias = "operation")]
    pub action: String,
    pub status: OperationStatus,
    #[serde(default, alias = "parameters", skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Duration measured by the emitter, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Every concrete kind of workflow event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    // ─────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────
    /// One half (start or completion) of an operation.
    #[serde(alias = "tool_event")]
    ToolCall(OperationEvent),

    // ─────────────────────────────────────────────────────────────────────
    // Actor lifecycle
    // ─────────────────────────────────────────────────────────────────────
    #[serde(alias = "node_start")]
    ActorStarted {
        #[serde(alias = "node_id")]
        actor_name: String,
        #[serde(default, alias = "node_name", skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, alias = "from_agent", skip_serializing_if = "Option::is_none")]
        from_actor: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handoff_prompt: Option<String>,
    },

    #[serde(alias = "node_stop", alias = "parallel_node_stop")]
    ActorStopped {
        #[serde(alias = "node_id")]
        actor_name: String,
        #[serde(default, alias = "node_name", skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(alias = "status")]
        completion_status: CompletionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Routing and fan-out
    // ─────────────────────────────────────────────────────────────────────
    RouterDecision {
        #[serde(alias = "from_agent")]
        from_actor: String,
        #[serde(alias = "next_agent")]
        next_actor: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        router_model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    #[serde(alias = "parallel_node_start")]
    ParallelStarted {
        #[serde(default, alias = "node_ids")]
        actors: Vec<String>,
        #[serde(default, alias = "from_agent", skip_serializing_if = "Option::is_none")]
        from_actor: Option<String>,
    },

    ConvergenceReady {
        #[serde(default, alias = "convergence_node", skip_serializing_if = "Option::is_none")]
        convergence_actor: Option<String>,
        #[serde(default, alias = "completed_agents")]
        completed_actors: Vec<String>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Workflow lifecycle
    // ─────────────────────────────────────────────────────────────────────
    #[serde(alias = "workflow_complete")]
    WorkflowCompleted {
        #[serde(default, alias = "duration_ms", skip_serializing_if = "Option::is_none")]
        total_duration_ms: Option<u64>,
        #[serde(default)]
        execution_order: Vec<String>,
        #[serde(default, alias = "final_agent", skip_serializing_if = "Option::is_none")]
        final_actor: Option<String>,
    },

    #[serde(alias = "workflow_error")]
    WorkflowFailed {
        #[serde(alias = "error")]
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_actor: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Suppressed from the log view
    // ─────────────────────────────────────────────────────────────────────
    /// Initial topology description.
    #[serde(alias = "graph_structure")]
    StructureAnnounced {
        #[serde(default, alias = "graph")]
        structure: Value,
    },

    /// Streaming model output.
    #[serde(alias = "stream_token", alias = "token")]
    TokenEmitted {
        #[serde(default, alias = "agent", skip_serializing_if = "Option::is_none")]
        actor_name: Option<String>,
        #[serde(default, alias = "data")]
        text: String,
    },
}

/// Failure to turn a raw JSON value into a [`WorkflowEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("invalid event: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowEvent {
    /// Decode a raw JSON object.
    ///
    /// The discriminator may be named `event_type`, `type` or `kind`; the
    /// correlation may be named `correlation_id`, `workflow_id` or
    /// `session_id` (first present wins).
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        if !map.contains_key("event_type") {
            let tag = map
                .remove("type")
                .or_else(|| map.remove("kind"))
                .ok_or(DecodeError::MissingField("event_type"))?;
            map.insert("event_type".to_string(), tag);
        }

        if !map.contains_key("correlation_id") {
            let correlation = ["workflow_id", "session_id"]
                .into_iter()
                .find_map(|key| map.remove(key).filter(|v| !v.is_null()))
                .ok_or(DecodeError::MissingField("correlation_id"))?;
            map.insert("correlation_id".to_string(), correlation);
        }

        let event: Self = serde_json::from_value(Value::Object(map))?;
        if event.timestamp <= 0 {
            return Err(DecodeError::InvalidTimestamp(event.timestamp));
        }
        if event.correlation_id.trim().is_empty() {
            return Err(DecodeError::MissingField("correlation_id"));
        }
        Ok(event)
    }

    /// Decode one JSON line.
    pub fn from_json_str(line: &str) -> Result<Self, DecodeError> {
        Self::from_value(serde_json::from_str(line)?)
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            correlation_id: self.correlation_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// `true` for `workflow_completed` and `workflow_failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. }
        )
    }

    pub fn as_operation(&self) -> Option<&OperationEvent> {
        match &self.kind {
            EventKind::ToolCall(op) => Some(op),
            _ => None,
        }
    }

    /// The actor this event is attributed to, if any.
    pub fn actor_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ToolCall(op) => Some(&op.actor_name),
            EventKind::ActorStarted { actor_name, .. }
            | EventKind::ActorStopped { actor_name, .. } => Some(actor_name),
            EventKind::RouterDecision { from_actor, .. } => Some(from_actor),
            EventKind::ParallelStarted { from_actor, .. } => from_actor.as_deref(),
            EventKind::ConvergenceReady {
                convergence_actor, ..
            } => convergence_actor.as_deref(),
            EventKind::WorkflowCompleted { final_actor, .. } => final_actor.as_deref(),
            EventKind::WorkflowFailed { failed_actor, .. } => failed_actor.as_deref(),
            EventKind::TokenEmitted { actor_name, .. } => actor_name.as_deref(),
            EventKind::StructureAnnounced { .. } => None,
        }
    }

    /// Wire name of the event kind.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::ToolCall(_) => "tool_call",
            EventKind::ActorStarted { .. } => "actor_started",
            EventKind::ActorStopped { .. } => "actor_stopped",
            EventKind::RouterDecision { .. } => "router_decision",
            EventKind::ParallelStarted { .. } => "parallel_started",
            EventKind::ConvergenceReady { .. } => "convergence_ready",
            EventKind::WorkflowCompleted { .. } => "workflow_completed",
            EventKind::WorkflowFailed { .. } => "workflow_failed",
            EventKind::StructureAnnounced { .. } => "structure_announced",
            EventKind::TokenEmitted { .. } => "token_emitted",
        }
    }
}

/// An event together with the channel that delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedEvent {
    pub source: EventSource,
    pub event: WorkflowEvent,
}
