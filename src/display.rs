//! Display projection of workflow events.
//!
//! A [`DisplayEntry`] is what the presentation layer renders for one event.
//! Its identity (id, timestamp, category, actor, summary, payload, status,
//! duration) is fixed at creation; only the view-state flags change later.

use crate::config::DisplayConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCategory {
    Actor,
    Operation,
    Routing,
    Parallel,
    Workflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Neutral,
    Success,
    Error,
}

/// One line of the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayEntry {
    id: String,
    timestamp: i64,
    category: EntryCategory,
    actor_name: String,
    summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    /// Row expanded in the log view.
    #[serde(default)]
    pub expanded: bool,
    /// Full payload shown instead of the preview.
    #[serde(default)]
    pub payload_expanded: bool,
}

/// Rendered payload text, possibly cut down to a preview window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadView {
    pub text: String,
    pub truncated: bool,
    pub total_lines: usize,
}

impl DisplayEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        timestamp: i64,
        category: EntryCategory,
        actor_name: String,
        summary: String,
        payload: Option<Value>,
        status: EntryStatus,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            id,
            timestamp,
            category,
            actor_name,
            summary,
            payload,
            status,
            duration_ms,
            expanded: false,
            payload_expanded: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn category(&self) -> EntryCategory {
        self.category
    }

    pub fn actor_name(&self) -> &str {
        &self.actor_name
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn toggle_expanded(&mut self) {
        self.expanded = !self.expanded;
    }

    /// Show the full payload. Calling it again changes nothing.
    pub fn expand_payload(&mut self) {
        self.payload_expanded = true;
    }

    pub fn collapse_payload(&mut self) {
        self.payload_expanded = false;
    }

    /// Pretty-printed payload. Payloads longer than the configured line
    /// threshold are cut to the preview window unless expanded.
    pub fn payload_view(&self, config: &DisplayConfig) -> Option<PayloadView> {
        let payload = self.payload.as_ref()?;
        let text = match payload {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        let total_lines = text.lines().count();

        if self.payload_expanded || total_lines <= config.payload_line_threshold {
            return Some(PayloadView {
                text,
                truncated: false,
                total_lines,
            });
        }

        let preview = text
            .lines()
            .take(config.payload_preview_lines)
            .collect::<Vec<_>>()
            .join("\n");
        Some(PayloadView {
            text: preview,
            truncated: true,
            total_lines,
        })
    }
}

/// `1234` -> `"1.2s"`.
#[allow(clippy::cast_precision_loss)]
pub fn format_duration_ms(duration_ms: u64) -> String {
    format!("{:.1}s", duration_ms as f64 / 1000.0)
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
