//! Tool usage aggregated over paired operations.

use crate::pairing::PairedOperation;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Usage of one `(subject, action)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolUsage {
    pub subject: String,
    pub action: String,
    pub invocations: usize,
    pub failures: usize,
    /// Sum of the durations that could be computed.
    pub total_duration_ms: u64,
    pub actors: BTreeSet<String>,
}

impl ToolUsage {
    /// `subject.action`, or just the action when there is no subject.
    pub fn label(&self) -> String {
        if self.subject.is_empty() {
            self.action.clone()
        } else {
            format!("{}.{}", self.subject, self.action)
        }
    }
}

/// Per-tool usage, ordered by `(subject, action)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolUsageReport {
    tools: BTreeMap<(String, String), ToolUsage>,
}

impl ToolUsageReport {
    pub fn from_operations(operations: &[PairedOperation]) -> Self {
        let mut report = Self::default();
        for paired in operations {
            report.record(paired);
        }
        report
    }

    pub fn record(&mut self, paired: &PairedOperation) {
        let op = &paired.operation;
        let usage = self
            .tools
            .entry((op.subject.clone(), op.action.clone()))
            .or_insert_with(|| ToolUsage {
                subject: op.subject.clone(),
                action: op.action.clone(),
                ..ToolUsage::default()
            });
        usage.invocations += 1;
        if paired.is_failed() {
            usage.failures += 1;
        }
        usage.total_duration_ms += paired.duration_ms.unwrap_or(0);
        usage.actors.insert(op.actor_name.clone());
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolUsage> {
        self.tools.values()
    }

    pub fn get(&self, subject: &str, action: &str) -> Option<&ToolUsage> {
        self.tools.get(&(subject.to_string(), action.to_string()))
    }

    /// Tools used by at least `min_actors` distinct actors.
    pub fn shared_tools(&self, min_actors: usize) -> Vec<&ToolUsage> {
        self.tools
            .values()
            .filter(|usage| usage.actors.len() >= min_actors)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
