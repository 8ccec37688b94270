//! Realtime channel: newline-delimited JSON events from the local process.

use crate::events::WorkflowEvent;
use futures::Stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Decode one stdout line. Blank and malformed lines yield `None`.
pub fn decode_line(line: &str) -> Option<WorkflowEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match WorkflowEvent::from_json_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed realtime line");
            None
        }
    }
}

/// Events read line by line from `reader` until EOF or a read error.
pub fn event_stream<R>(reader: R) -> impl Stream<Item = WorkflowEvent> + Send
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(event) = decode_line(&line) {
                        yield event;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Realtime channel read failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_decode_line_skips_noise() {
        assert!(decode_line("").is_none());
        assert!(decode_line("   ").is_none());
        assert!(decode_line("Starting workflow...").is_none());
        assert!(decode_line(r#"{"event_type":"mystery","correlation_id":"wf","timestamp":1}"#).is_none());
        assert!(decode_line(r#"{"event_type":"node_start","workflow_id":"wf","node_id":"a"}"#).is_none());

        let event = decode_line(
            r#"  {"type":"node_start","workflow_id":"wf","timestamp":42,"node_id":"a"}  "#,
        )
        .unwrap();
        assert_eq!(event.timestamp, 42);
    }

    #[tokio::test]
    async fn test_event_stream_reads_until_eof() {
        let input: &'static [u8] = b"{\"type\":\"node_start\",\"workflow_id\":\"wf\",\"timestamp\":1,\"node_id\":\"a\"}\n\
            not json\n\
            \n\
            {\"type\":\"workflow_complete\",\"workflow_id\":\"wf\",\"timestamp\":2}\n";

        let events: Vec<WorkflowEvent> = event_stream(input).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }
}
