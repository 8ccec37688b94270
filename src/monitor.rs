//! Monitor facade: the outbound surface consumed by a presentation layer.
//!
//! A [`WorkflowMonitor`] owns one [`PollingEngine`] and one [`EventMerger`].
//! Polled batches arrive through a pump task holding a
//! [`PollSubscription`]; realtime events are pushed with
//! [`WorkflowMonitor::ingest_realtime`] or read from a stream with
//! [`WorkflowMonitor::attach_realtime`]. Every newly merged event is
//! classified and, unless suppressed, buffered and broadcast as a
//! [`DisplayEntry`].

use crate::classify::classify_with;
use crate::clock::SharedClock;
use crate::config::{AppConfig, DisplayConfig, ReportingConfig};
use crate::display::DisplayEntry;
use crate::events::{EventSource, SourcedEvent, WorkflowEvent};
use crate::matching::{AttributedTurn, ConversationalTurn, attach, derive_turns};
use crate::merge::EventMerger;
use crate::pairing::{PairedOperation, pair};
use crate::polling::{
    PollError, PollSubscription, PolledBatch, PollUpdate, PollingEngine, PollingError,
};
use crate::realtime::event_stream;
use crate::report::{ToolUsage, ToolUsageReport};
use crate::store::EventStore;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::AsyncBufRead;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error(transparent)]
    Polling(#[from] PollingError),
}

#[derive(Debug, Default)]
struct MonitorState {
    merger: EventMerger,
    entries: Vec<DisplayEntry>,
    /// Externally supplied turns. Derived from lifecycle events when empty.
    turns: Vec<ConversationalTurn>,
    /// Bumped on every observe/stop; pumps of older observations are ignored.
    observation: u64,
    accepting: bool,
    terminal: bool,
    pump: Option<CancellationToken>,
    disposed: bool,
}

#[derive(Debug)]
struct MonitorShared {
    engine: PollingEngine,
    clock: SharedClock,
    display: DisplayConfig,
    reporting: ReportingConfig,
    entries_tx: broadcast::Sender<DisplayEntry>,
    errors_tx: broadcast::Sender<PollError>,
    /// Cancelled on dispose; ends every realtime reader.
    lifetime: CancellationToken,
    state: Mutex<MonitorState>,
}

/// Reconciles both event channels of one workflow run into display entries,
/// paired operations and attributed turns.
///
/// Dropping the monitor disposes it.
#[derive(Debug)]
pub struct WorkflowMonitor {
    shared: Arc<MonitorShared>,
}

impl WorkflowMonitor {
    pub fn new(
        engine: PollingEngine,
        clock: SharedClock,
        display: DisplayConfig,
        reporting: ReportingConfig,
        capacity: usize,
    ) -> Self {
        let (entries_tx, _) = broadcast::channel(capacity);
        let (errors_tx, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(MonitorShared {
                engine,
                clock,
                display,
                reporting,
                entries_tx,
                errors_tx,
                lifetime: CancellationToken::new(),
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    pub fn from_config(store: Arc<dyn EventStore>, config: &AppConfig, clock: SharedClock) -> Self {
        Self::new(
            PollingEngine::from_config(store, &config.polling),
            clock,
            config.display,
            config.reporting,
            config.polling.channel_capacity,
        )
    }

    /// Start observing `correlation_id` on both channels.
    ///
    /// Observing the correlation that is already being observed is a no-op.
    /// Any other call clears the buffered events, entries and turns.
    #[instrument(skip(self, correlation_id), fields(correlation_id = tracing::field::Empty))]
    pub fn observe(&self, correlation_id: impl Into<String>) -> Result<(), MonitorError> {
        let correlation_id = correlation_id.into();
        if correlation_id.trim().is_empty() {
            return Err(PollingError::InvalidCorrelationId.into());
        }
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let mut state = self.shared.lock();
        if state.disposed {
            return Err(PollingError::Disposed.into());
        }
        if state.accepting && state.merger.correlation_id() == Some(correlation_id.as_str()) {
            tracing::debug!("Correlation already observed");
            return Ok(());
        }

        if let Some(pump) = state.pump.take() {
            pump.cancel();
        }
        self.shared.engine.stop();

        state.observation += 1;
        state.merger.reset(Some(correlation_id.clone()));
        state.entries.clear();
        state.turns.clear();
        state.accepting = true;
        state.terminal = false;

        let subscription = self.shared.engine.subscribe()?;
        self.shared.engine.start(correlation_id)?;

        let token = CancellationToken::new();
        state.pump = Some(token.clone());
        let observation = state.observation;
        drop(state);

        tokio::spawn(pump(
            Arc::clone(&self.shared),
            subscription,
            observation,
            token,
        ));
        Ok(())
    }

    /// Stop both channels. Buffered entries, events and turns stay readable.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if let Some(pump) = state.pump.take() {
            pump.cancel();
        }
        state.observation += 1;
        state.accepting = false;
        drop(state);
        self.shared.engine.stop();
    }

    /// Stop everything and release the engine. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.shared.lock();
        if state.disposed {
            return;
        }
        if let Some(pump) = state.pump.take() {
            pump.cancel();
        }
        state.observation += 1;
        state.accepting = false;
        state.disposed = true;
        drop(state);
        self.shared.lifetime.cancel();
        self.shared.engine.dispose();
        tracing::debug!("Workflow monitor disposed");
    }

    /// Feed one event from the realtime channel.
    ///
    /// Returns the display entry it produced, if any.
    pub fn ingest_realtime(&self, event: WorkflowEvent) -> Option<DisplayEntry> {
        self.shared.ingest(EventSource::Realtime, event)
    }

    /// Read NDJSON events from `reader` in the background until EOF or
    /// dispose.
    pub fn attach_realtime<R>(&self, reader: R) -> JoinHandle<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let shared: Weak<MonitorShared> = Arc::downgrade(&self.shared);
        let lifetime = self.shared.lifetime.clone();
        tokio::spawn(async move {
            let events = event_stream(reader);
            futures::pin_mut!(events);
            loop {
                let next = tokio::select! {
                    () = lifetime.cancelled() => break,
                    next = events.next() => next,
                };
                let Some(event) = next else {
                    tracing::debug!("Realtime channel closed");
                    break;
                };
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.ingest(EventSource::Realtime, event);
            }
        })
    }

    /// Display entries produced from now on.
    pub fn subscribe_entries(&self) -> impl Stream<Item = DisplayEntry> + Send + 'static {
        BroadcastStream::new(self.shared.entries_tx.subscribe())
            .filter_map(|entry| futures::future::ready(entry.ok()))
    }

    /// Non-fatal poll errors reported from now on.
    pub fn subscribe_errors(&self) -> impl Stream<Item = PollError> + Send + 'static {
        BroadcastStream::new(self.shared.errors_tx.subscribe())
            .filter_map(|error| futures::future::ready(error.ok()))
    }

    /// Buffered entries in arrival order.
    pub fn entries(&self) -> Vec<DisplayEntry> {
        self.shared.lock().entries.clone()
    }

    pub fn entry(&self, id: &str) -> Option<DisplayEntry> {
        self.shared
            .lock()
            .entries
            .iter()
            .find(|entry| entry.id() == id)
            .cloned()
    }

    pub fn expand_entry(&self, id: &str) -> bool {
        self.shared.update_entry(id, |entry| entry.expanded = true)
    }

    pub fn collapse_entry(&self, id: &str) -> bool {
        self.shared.update_entry(id, |entry| entry.expanded = false)
    }

    pub fn expand_payload(&self, id: &str) -> bool {
        self.shared.update_entry(id, DisplayEntry::expand_payload)
    }

    pub fn collapse_payload(&self, id: &str) -> bool {
        self.shared.update_entry(id, DisplayEntry::collapse_payload)
    }

    /// Replace the externally owned turn list.
    pub fn set_turns(&self, turns: Vec<ConversationalTurn>) {
        self.shared.lock().turns = turns;
    }

    /// Insert a turn, or replace the one with the same actor and start.
    pub fn upsert_turn(&self, turn: ConversationalTurn) {
        let mut state = self.shared.lock();
        match state.turns.iter_mut().find(|existing| {
            existing.actor_name == turn.actor_name
                && existing.start_timestamp == turn.start_timestamp
        }) {
            Some(existing) => *existing = turn,
            None => state.turns.push(turn),
        }
    }

    /// Turns enriched with the operations attributed to them.
    pub fn turns(&self) -> Vec<AttributedTurn> {
        let state = self.shared.lock();
        let operations = pair(state.merger.buffered().iter().map(|s| &s.event));
        let turns = if state.turns.is_empty() {
            derive_turns(state.merger.buffered().iter().map(|s| &s.event))
        } else {
            state.turns.clone()
        };
        attach(&turns, &operations, self.shared.clock.as_ref())
    }

    pub fn paired_operations(&self) -> Vec<PairedOperation> {
        let state = self.shared.lock();
        pair(state.merger.buffered().iter().map(|s| &s.event))
    }

    pub fn tool_usage(&self) -> ToolUsageReport {
        ToolUsageReport::from_operations(&self.paired_operations())
    }

    /// Tools used by at least the configured number of actors.
    pub fn shared_tools(&self) -> Vec<ToolUsage> {
        self.tool_usage()
            .shared_tools(self.shared.reporting.shared_tool_min_actors)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every merged event, tagged with its source, in arrival order.
    pub fn events(&self) -> Vec<SourcedEvent> {
        self.shared.lock().merger.buffered().to_vec()
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.shared
            .lock()
            .merger
            .correlation_id()
            .map(str::to_string)
    }

    /// `true` once a terminal workflow event was merged.
    pub fn is_terminal(&self) -> bool {
        self.shared.lock().terminal
    }

    pub fn engine(&self) -> &PollingEngine {
        &self.shared.engine
    }
}

impl Drop for WorkflowMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl MonitorShared {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ingest(&self, source: EventSource, event: WorkflowEvent) -> Option<DisplayEntry> {
        let mut state = self.lock();
        if !state.accepting {
            return None;
        }
        self.merge_one(&mut state, source, event)
    }

    fn ingest_batch(&self, observation: u64, batch: PolledBatch) {
        let mut state = self.lock();
        if !state.accepting || state.observation != observation {
            tracing::debug!(
                correlation_id = %batch.correlation_id,
                "Dropping batch of a previous observation"
            );
            return;
        }
        for event in batch.events {
            self.merge_one(&mut state, EventSource::Polled, event);
        }
    }

    fn merge_one(
        &self,
        state: &mut MonitorState,
        source: EventSource,
        event: WorkflowEvent,
    ) -> Option<DisplayEntry> {
        let sourced = state.merger.accept(source, event)?;
        if sourced.event.is_terminal() {
            state.terminal = true;
        }
        let entry = classify_with(&sourced.event, &self.display)?;
        state.entries.push(entry.clone());
        let _ = self.entries_tx.send(entry.clone());
        Some(entry)
    }

    fn update_entry(&self, id: &str, update: impl FnOnce(&mut DisplayEntry)) -> bool {
        let mut state = self.lock();
        match state.entries.iter_mut().find(|entry| entry.id() == id) {
            Some(entry) => {
                update(entry);
                true
            }
            None => false,
        }
    }
}

async fn pump(
    shared: Arc<MonitorShared>,
    mut subscription: PollSubscription,
    observation: u64,
    token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            () = token.cancelled() => break,
            update = subscription.recv() => update,
        };
        match update {
            Some(PollUpdate::Batch(batch)) => shared.ingest_batch(observation, batch),
            Some(PollUpdate::Error(error)) => {
                let _ = shared.errors_tx.send(error);
            }
            None => break,
        }
    }
}
