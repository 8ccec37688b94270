//! Polling engine against the persistent store.
//!
//! One engine observes at most one correlation id at a time. While at least
//! one [`PollSubscription`] is alive and the workflow has not reached a
//! terminal event, a single task queries the store for everything newer than
//! the highest timestamp seen so far, emits the new events as a
//! [`PolledBatch`], then sleeps for the interval chosen by the
//! [`BackoffPolicy`].
//!
//! # Lifecycle
//!
//! - [`PollingEngine::start`] discards the previous activation (dedup set,
//!   high-water mark, backoff) and begins a fresh one.
//! - Dropping the last subscription pauses polling; subscribing again
//!   resumes the same activation unless it reached a terminal event.
//! - A batch containing `workflow_completed` or `workflow_failed` ends the
//!   activation after the batch is emitted.
//! - Store failures never escape: they are broadcast as [`PollError`]s and
//!   retried with escalating delays.
//!
//! Every run of the polling task carries a generation number. Cancelling a
//! run (stop, restart, last unsubscribe) bumps the generation, so a query
//! that was already in flight is allowed to finish but its result is
//! dropped. At most one store query is outstanding per engine: a new run
//! waits for such a leftover query before issuing its own. A run resumed
//! after a pause also waits out a pending retry delay.

mod backoff;

pub use backoff::BackoffPolicy;

use crate::config::PollingConfig;
use crate::events::{DedupKey, WorkflowEvent};
use crate::store::{EventStore, StoreError, StoredItem};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// New events fetched by one successful poll, ascending by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledBatch {
    pub correlation_id: String,
    pub events: Vec<WorkflowEvent>,
}

/// A failed poll. Informational only; the engine keeps retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollError {
    pub correlation_id: String,
    pub consecutive_failures: u32,
    /// Delay before the next attempt.
    pub retry_in: Duration,
    pub transient: bool,
    pub message: String,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    Batch(PolledBatch),
    Error(PollError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PollingError {
    #[error("polling engine has been disposed")]
    Disposed,

    #[error("correlation id must not be empty")]
    InvalidCorrelationId,
}

/// Per-correlation state. Dropped wholesale on restart.
#[derive(Debug)]
struct Activation {
    correlation_id: String,
    seen: HashSet<DedupKey>,
    high_water: i64,
    consecutive_failures: u32,
    /// Earliest instant of the next attempt after a failed poll.
    retry_at: Option<Instant>,
    terminal: bool,
}

impl Activation {
    fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            seen: HashSet::new(),
            high_water: 0,
            consecutive_failures: 0,
            retry_at: None,
            terminal: false,
        }
    }
}

#[derive(Debug)]
struct EngineState {
    activation: Option<Activation>,
    subscribers: usize,
    /// Bumped whenever a polling run starts or is cancelled.
    generation: u64,
    /// Bumped on dispose so leases taken before it are ignored.
    lease_epoch: u64,
    run: Option<CancellationToken>,
    /// A store query is outstanding, possibly from a cancelled run.
    in_flight: bool,
    next_delay: Option<Duration>,
    batches: Option<broadcast::Sender<PolledBatch>>,
    errors: Option<broadcast::Sender<PollError>>,
    disposed: bool,
}

impl EngineState {
    fn cancel_run(&mut self) {
        if let Some(token) = self.run.take() {
            token.cancel();
            self.generation += 1;
        }
    }
}

#[derive(Debug)]
struct EngineShared {
    store: Arc<dyn EventStore>,
    policy: BackoffPolicy,
    state: Mutex<EngineState>,
    /// Signalled whenever an outstanding query completes.
    idle: Notify,
}

#[derive(Debug, Clone, Copy)]
enum PollOutcome {
    Continue(Duration),
    Terminal,
}

/// Periodic poller of the persistent store.
///
/// Cloning yields another handle to the same engine. Methods that may start
/// polling (`start`, `subscribe`) must be called from within a Tokio runtime.
#[derive(Debug, Clone)]
pub struct PollingEngine {
    shared: Arc<EngineShared>,
}

impl PollingEngine {
    pub fn new(store: Arc<dyn EventStore>, policy: BackoffPolicy, capacity: usize) -> Self {
        let (batches, _) = broadcast::channel(capacity);
        let (errors, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(EngineShared {
                store,
                policy,
                state: Mutex::new(EngineState {
                    activation: None,
                    subscribers: 0,
                    generation: 0,
                    lease_epoch: 0,
                    run: None,
                    in_flight: false,
                    next_delay: None,
                    batches: Some(batches),
                    errors: Some(errors),
                    disposed: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn from_config(store: Arc<dyn EventStore>, config: &PollingConfig) -> Self {
        Self::new(
            store,
            BackoffPolicy::from_config(config),
            config.channel_capacity,
        )
    }

    /// Begin observing `correlation_id`.
    ///
    /// Starting the correlation that is already being observed (and has not
    /// finished) is a no-op. Any other call replaces the current activation.
    #[instrument(skip(self, correlation_id), fields(correlation_id = tracing::field::Empty))]
    pub fn start(&self, correlation_id: impl Into<String>) -> Result<(), PollingError> {
        let correlation_id = correlation_id.into();
        if correlation_id.trim().is_empty() {
            return Err(PollingError::InvalidCorrelationId);
        }
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let mut state = self.shared.lock();
        if state.disposed {
            return Err(PollingError::Disposed);
        }

        if let Some(current) = &state.activation {
            if current.correlation_id == correlation_id && !current.terminal {
                tracing::debug!("Correlation already active");
                return Ok(());
            }
            tracing::info!(previous = %current.correlation_id, "Restarting polling for new correlation");
        }

        state.cancel_run();
        state.activation = Some(Activation::new(correlation_id));
        state.next_delay = None;

        if state.subscribers > 0 {
            self.shared.spawn_run(&mut state);
        } else {
            tracing::debug!("No subscribers yet; polling deferred");
        }
        Ok(())
    }

    /// Stop polling and forget the current activation.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.cancel_run();
        if let Some(activation) = state.activation.take() {
            tracing::info!(correlation_id = %activation.correlation_id, "Polling stopped");
        }
        state.next_delay = None;
    }

    /// Attach a subscriber. Polling runs while at least one is attached.
    pub fn subscribe(&self) -> Result<PollSubscription, PollingError> {
        let mut state = self.shared.lock();
        if state.disposed {
            return Err(PollingError::Disposed);
        }
        let (Some(batches), Some(errors)) = (&state.batches, &state.errors) else {
            return Err(PollingError::Disposed);
        };
        let subscription = PollSubscription {
            batches: batches.subscribe(),
            errors: errors.subscribe(),
            engine: Arc::downgrade(&self.shared),
            lease: state.lease_epoch,
        };

        state.subscribers += 1;
        let resumable = state
            .activation
            .as_ref()
            .is_some_and(|activation| !activation.terminal);
        if resumable && state.run.is_none() {
            self.shared.spawn_run(&mut state);
        }
        Ok(subscription)
    }

    /// Stop everything and release all resources. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.shared.lock();
        if state.disposed {
            return;
        }
        state.cancel_run();
        state.activation = None;
        state.subscribers = 0;
        state.lease_epoch += 1;
        state.next_delay = None;
        state.batches = None;
        state.errors = None;
        state.disposed = true;
        tracing::debug!("Polling engine disposed");
    }

    /// `true` while a polling run is scheduled.
    pub fn is_active(&self) -> bool {
        self.shared.lock().run.is_some()
    }

    pub fn current_correlation_id(&self) -> Option<String> {
        self.shared
            .lock()
            .activation
            .as_ref()
            .map(|activation| activation.correlation_id.clone())
    }

    /// `true` once the current activation saw a terminal workflow event.
    pub fn is_terminal(&self) -> bool {
        self.shared
            .lock()
            .activation
            .as_ref()
            .is_some_and(|activation| activation.terminal)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers
    }

    /// Delay chosen after the most recent completed poll.
    pub fn next_delay(&self) -> Option<Duration> {
        self.shared.lock().next_delay
    }

    /// Highest timestamp seen in the current activation.
    pub fn high_water_mark(&self) -> Option<i64> {
        self.shared
            .lock()
            .activation
            .as_ref()
            .map(|activation| activation.high_water)
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.shared.policy
    }
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_run(self: &Arc<Self>, state: &mut EngineState) {
        let token = CancellationToken::new();
        state.generation += 1;
        state.run = Some(token.clone());
        let generation = state.generation;
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run(generation, token).await });
    }

    fn release(&self, lease: u64) {
        let mut state = self.lock();
        if state.lease_epoch != lease || state.subscribers == 0 {
            return;
        }
        state.subscribers -= 1;
        if state.subscribers == 0 && state.run.is_some() {
            tracing::debug!("Last subscriber left; pausing polling");
            state.cancel_run();
        }
    }

    /// Waits until this run may query the store, then claims the single
    /// query slot. `None` when the run was cancelled meanwhile.
    async fn acquire_query(
        &self,
        generation: u64,
        token: &CancellationToken,
    ) -> Option<(String, i64)> {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let retry_at = {
                let mut state = self.lock();
                if state.generation != generation {
                    return None;
                }
                let activation = state.activation.as_ref()?;
                let retry_at = activation.retry_at.filter(|at| *at > Instant::now());
                let target = (activation.correlation_id.clone(), activation.high_water);
                if retry_at.is_none() && !state.in_flight {
                    state.in_flight = true;
                    return Some(target);
                }
                retry_at
            };

            match retry_at {
                Some(at) => {
                    tracing::debug!(generation, "Waiting out pending retry delay");
                    tokio::select! {
                        () = token.cancelled() => return None,
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    tracing::debug!(generation, "Waiting for outstanding query");
                    tokio::select! {
                        () = token.cancelled() => return None,
                        () = &mut idle => {}
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>, generation: u64, token: CancellationToken) {
        loop {
            let Some((correlation_id, after)) = self.acquire_query(generation, &token).await
            else {
                return;
            };

            metrics::counter!("workflow_monitor.polls").increment(1);
            let result = self.store.query_after(&correlation_id, after).await;

            let outcome = {
                let mut state = self.lock();
                state.in_flight = false;
                self.idle.notify_waiters();
                if state.generation != generation || token.is_cancelled() {
                    tracing::debug!(
                        correlation_id = %correlation_id,
                        generation,
                        "Discarding stale poll response"
                    );
                    return;
                }
                let outcome = self.apply(&mut state, result);
                match outcome {
                    PollOutcome::Continue(delay) => state.next_delay = Some(delay),
                    PollOutcome::Terminal => {
                        state.run = None;
                        state.next_delay = None;
                    }
                }
                outcome
            };

            let PollOutcome::Continue(delay) = outcome else {
                return;
            };

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn apply(
        &self,
        state: &mut EngineState,
        result: Result<Vec<StoredItem>, StoreError>,
    ) -> PollOutcome {
        let Some(activation) = state.activation.as_mut() else {
            return PollOutcome::Terminal;
        };

        match result {
            Ok(items) => {
                activation.consecutive_failures = 0;
                activation.retry_at = None;

                let mut fresh = Vec::with_capacity(items.len());
                for item in items {
                    activation.high_water = activation.high_water.max(item.timestamp);
                    let event = match item.into_event() {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping malformed store item");
                            continue;
                        }
                    };
                    if event.correlation_id != activation.correlation_id {
                        continue;
                    }
                    if !activation.seen.insert(event.dedup_key()) {
                        metrics::counter!("workflow_monitor.duplicates_dropped").increment(1);
                        continue;
                    }
                    fresh.push(event);
                }
                fresh.sort_by_key(|event| event.timestamp);

                let terminal = fresh.iter().any(WorkflowEvent::is_terminal);
                if !fresh.is_empty() {
                    tracing::debug!(
                        correlation_id = %activation.correlation_id,
                        batch_size = fresh.len(),
                        high_water = activation.high_water,
                        "Emitting polled batch"
                    );
                    metrics::counter!("workflow_monitor.events_emitted")
                        .increment(fresh.len() as u64);
                    if let Some(tx) = &state.batches {
                        let _ = tx.send(PolledBatch {
                            correlation_id: activation.correlation_id.clone(),
                            events: fresh,
                        });
                    }
                }

                if terminal {
                    activation.terminal = true;
                    tracing::info!(
                        correlation_id = %activation.correlation_id,
                        "Terminal workflow event seen; polling finished"
                    );
                    return PollOutcome::Terminal;
                }
                PollOutcome::Continue(self.policy.base())
            }
            Err(e) => {
                activation.consecutive_failures += 1;
                let retry_in = self.policy.delay(activation.consecutive_failures);
                activation.retry_at = Some(Instant::now() + retry_in);
                metrics::counter!("workflow_monitor.poll_failures").increment(1);
                tracing::warn!(
                    correlation_id = %activation.correlation_id,
                    consecutive_failures = activation.consecutive_failures,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Poll failed; backing off"
                );
                if let Some(tx) = &state.errors {
                    let _ = tx.send(PollError {
                        correlation_id: activation.correlation_id.clone(),
                        consecutive_failures: activation.consecutive_failures,
                        retry_in,
                        transient: e.is_transient(),
                        message: e.to_string(),
                    });
                }
                PollOutcome::Continue(retry_in)
            }
        }
    }
}

/// A live subscription to a [`PollingEngine`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct PollSubscription {
    batches: broadcast::Receiver<PolledBatch>,
    errors: broadcast::Receiver<PollError>,
    engine: Weak<EngineShared>,
    lease: u64,
}

impl PollSubscription {
    /// Next batch or error. `None` once the engine is disposed.
    pub async fn recv(&mut self) -> Option<PollUpdate> {
        loop {
            let result = tokio::select! {
                biased;
                batch = self.batches.recv() => batch.map(PollUpdate::Batch),
                error = self.errors.recv() => error.map(PollUpdate::Error),
            };
            match result {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Poll subscriber lagged; updates dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Pending update without waiting, if any.
    pub fn try_recv(&mut self) -> Option<PollUpdate> {
        if let Ok(batch) = self.batches.try_recv() {
            return Some(PollUpdate::Batch(batch));
        }
        self.errors.try_recv().ok().map(PollUpdate::Error)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for PollSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.engine.upgrade() {
            shared.release(self.lease);
        }
    }
}
