//! Persistent event store boundary.
//!
//! The store is the durable source of truth for a workflow run. Items are
//! partitioned by correlation id and sorted by epoch-millisecond timestamp;
//! every item carries an event-type discriminator, the actor name, a
//! structured payload and a time-to-live marker.
//!
//! - [`EventStore`]: query seam used by the polling engine
//! - [`StoredItem`]: one item as it sits in the table
//! - [`providers`]: in-memory and jsonl-file implementations

use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::events::{DecodeError, WorkflowEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod providers;

/// Store I/O failures. All of them are retried by the polling engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store throttled: {0}")]
    Throttled(String),

    #[error("table not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Network, throttling and I/O failures are expected to clear up on
    /// their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Throttled(_) | Self::Io(_)
        )
    }
}

/// One item of the event table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Partition key.
    pub correlation_id: String,
    /// Sort key, epoch milliseconds.
    pub timestamp: i64,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    /// Remaining event attributes.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Expiry, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl StoredItem {
    pub fn from_event(event: &WorkflowEvent, ttl: Option<i64>) -> Result<Self, StoreError> {
        let value =
            serde_json::to_value(event).map_err(|e| StoreError::Decode(e.to_string()))?;
        let Value::Object(mut payload) = value else {
            return Err(StoreError::Decode("event did not serialize to an object".into()));
        };
        payload.remove("correlation_id");
        payload.remove("timestamp");
        payload.remove("event_type");

        Ok(Self {
            correlation_id: event.correlation_id.clone(),
            timestamp: event.timestamp,
            event_type: event.kind_name().to_string(),
            actor_name: event.actor_name().map(str::to_string),
            payload,
            ttl,
        })
    }

    pub fn into_event(self) -> Result<WorkflowEvent, DecodeError> {
        let mut map = self.payload;
        map.insert("correlation_id".into(), Value::String(self.correlation_id));
        map.insert("timestamp".into(), Value::from(self.timestamp));
        map.insert("event_type".into(), Value::String(self.event_type));
        WorkflowEvent::from_value(Value::Object(map))
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.ttl.is_some_and(|ttl| ttl <= now_secs)
    }
}

/// Query seam over the persistent store.
#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    /// All items of `correlation_id` with a timestamp strictly greater than
    /// `after_timestamp`, ascending.
    async fn query_after(
        &self,
        correlation_id: &str,
        after_timestamp: i64,
    ) -> Result<Vec<StoredItem>, StoreError>;
}

/// Build the store described by `config`.
pub fn from_config(
    config: &StoreConfig,
    clock: SharedClock,
) -> Result<Arc<dyn EventStore>, StoreError> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(providers::MemoryEventStore::new(
            clock,
            config.ttl_seconds,
        ))),
        "jsonl" => {
            let path = config.path.as_deref().ok_or_else(|| {
                StoreError::NotFound("store.path is required for the jsonl provider".into())
            })?;
            Ok(Arc::new(providers::JsonlEventStore::new(path)))
        }
        other => Err(StoreError::NotFound(format!(
            "unknown store provider '{other}' (table {})",
            config.table_name
        ))),
    }
}
