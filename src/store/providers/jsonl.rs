use crate::events::WorkflowEvent;
use crate::store::{EventStore, StoreError, StoredItem};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Reads an NDJSON export of the event table (or a captured stdout of the
/// local process) on every query.
///
/// A missing file is an empty history: the writer may not have started yet.
#[derive(Debug, Clone)]
pub struct JsonlEventStore {
    path: PathBuf,
}

impl JsonlEventStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn query_after(
        &self,
        correlation_id: &str,
        after_timestamp: i64,
    ) -> Result<Vec<StoredItem>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events: Vec<WorkflowEvent> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match WorkflowEvent::from_json_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::debug!(path = %self.path.display(), error = %e, "Skipping malformed line");
                    None
                }
            })
            .filter(|event| {
                event.correlation_id == correlation_id && event.timestamp > after_timestamp
            })
            .collect();
        events.sort_by_key(|event| event.timestamp);

        events
            .iter()
            .map(|event| StoredItem::from_event(event, None))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_matching_lines_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"event_type":"node_start","workflow_id":"wf","timestamp":20,"node_id":"b"}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"event_type":"node_start","workflow_id":"wf","timestamp":10,"node_id":"a"}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"event_type":"node_start","workflow_id":"other","timestamp":30,"node_id":"c"}}"#
        )
        .unwrap();

        let store = JsonlEventStore::new(file.path());
        let items = store.query_after("wf", 0).await.unwrap();
        let stamps: Vec<i64> = items.iter().map(|i| i.timestamp).collect();
        assert_eq!(stamps, vec![10, 20]);

        let items = store.query_after("wf", 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].actor_name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlEventStore::new(dir.path().join("absent.jsonl"));
        assert!(store.query_after("wf", 0).await.unwrap().is_empty());
    }
}
