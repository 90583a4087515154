//! Invalidation scheduling
//!
//! Caches signal "I am stale" through a [`SignalHandle`]; a dispatcher task
//! drains the signal queue and executes invalidation handlers on a
//! semaphore-bounded pool, in parallel across distinct caches and strictly
//! serialized per cache. Signals arriving while a run is in flight coalesce
//! into exactly one follow-up run. Handler errors and panics are caught,
//! reported and never stop the dispatcher.

#[cfg(test)]
mod scheduler_test;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::errors::Result;
use crate::metrics::INVALIDATION_DURATION_SECONDS;
use crate::metrics::INVALIDATION_RUNS;
use crate::metrics::SIGNALS_COALESCED;
use crate::utils::join_with_timeout;
use crate::utils::spawn_named;

/// Invalidation callback of one registered cache. Runs are never concurrent
/// for the same registration.
#[async_trait]
pub trait InvalidationHandler: Send + Sync + 'static {
    async fn on_invalidated(&self) -> Result<()>;
}

/// Per-registration signal state machine.
///
/// `Idle -> Signaled -> Running -> Idle`, with `RunningSignaled` capturing
/// "signaled again while running": any number of signals during a run
/// collapse into one follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Idle,
    Signaled,
    Running,
    RunningSignaled,
}

struct SignalEntry {
    id: u64,
    state: Mutex<SignalState>,
    handler: Arc<dyn InvalidationHandler>,
    /// Cleared on unregister; a cleared entry is never executed again.
    active: AtomicBool,
}

struct SchedulerInner {
    entries: DashMap<u64, Arc<SignalEntry>>,
    queue_tx: mpsc::UnboundedSender<u64>,
    cancel: CancellationToken,
}

impl SchedulerInner {
    fn enqueue(&self, id: u64) {
        // Send failure only happens after shutdown; pending signals are
        // deliberately dropped then.
        if self.queue_tx.send(id).is_err() {
            trace!("signal for entry {id} dropped, scheduler stopped");
        }
    }
}

/// Handle used to signal that a registered cache is stale. Cheap to clone;
/// one clone typically lives inside each dependency subscription.
#[derive(Clone)]
pub struct SignalHandle {
    id: u64,
    inner: Arc<SchedulerInner>,
}

impl SignalHandle {
    /// Mark the registration stale. Idempotent while a run is already
    /// pending; signals during a run cause exactly one follow-up run.
    pub fn set(&self) {
        let Some(entry) = self.inner.entries.get(&self.id).map(|e| e.value().clone()) else {
            return;
        };
        let enqueue = {
            let mut state = entry.state.lock();
            match *state {
                SignalState::Idle => {
                    *state = SignalState::Signaled;
                    true
                }
                SignalState::Running => {
                    *state = SignalState::RunningSignaled;
                    SIGNALS_COALESCED.inc();
                    false
                }
                SignalState::Signaled | SignalState::RunningSignaled => {
                    SIGNALS_COALESCED.inc();
                    false
                }
            }
        };
        if enqueue {
            self.inner.enqueue(self.id);
        }
    }

    /// Remove the registration this handle signals. Equivalent to
    /// `InvalidationScheduler::unregister`, callable where only the handle
    /// is in scope (query teardown closures).
    pub(crate) fn retire(&self) {
        if let Some((_, entry)) = self.inner.entries.remove(&self.id) {
            entry.active.store(false, Ordering::Release);
            debug!("unregistered invalidation entry {}", entry.id);
        }
    }
}

/// Bounded background executor for cache invalidation handlers.
pub struct InvalidationScheduler {
    inner: Arc<SchedulerInner>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationScheduler {
    /// Start the dispatcher with at most `concurrency` handlers in flight.
    pub fn start(concurrency: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SchedulerInner {
            entries: DashMap::new(),
            queue_tx,
            cancel: CancellationToken::new(),
        });
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let dispatcher = spawn_named("invalidation-dispatcher", {
            let inner = inner.clone();
            async move {
                dispatch(inner, queue_rx, permits).await;
                Ok(())
            }
        });
        Self {
            inner,
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Register an invalidation handler. With `initial_armed` the first run
    /// is scheduled immediately.
    pub fn register(
        &self,
        initial_armed: bool,
        handler: Arc<dyn InvalidationHandler>,
    ) -> SignalHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SignalEntry {
            id,
            state: Mutex::new(SignalState::Idle),
            handler,
            active: AtomicBool::new(true),
        });
        self.inner.entries.insert(id, entry);
        let handle = SignalHandle {
            id,
            inner: self.inner.clone(),
        };
        if initial_armed {
            handle.set();
        }
        handle
    }

    /// Remove a registration. The handler is not invoked again; a run
    /// already in flight completes normally.
    pub fn unregister(&self, handle: &SignalHandle) {
        handle.retire();
    }

    /// Stop the dispatcher, letting in-flight handlers finish within
    /// `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.inner.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            join_with_timeout("invalidation-dispatcher", handle, deadline).await?;
        }
        Ok(())
    }
}

async fn dispatch(
    inner: Arc<SchedulerInner>,
    mut queue_rx: mpsc::UnboundedReceiver<u64>,
    permits: Arc<Semaphore>,
) {
    let mut running: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            biased;

            _ = inner.cancel.cancelled() => {
                break;
            }

            // Reap finished runs so the set does not accumulate results.
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("invalidation run task panicked: {e:?}");
                    }
                }
            }

            maybe_id = queue_rx.recv() => {
                let Some(id) = maybe_id else { break };
                let Some(entry) = inner.entries.get(&id).map(|e| e.value().clone()) else {
                    trace!("signal for unregistered entry {id} ignored");
                    continue;
                };
                let permit = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let inner = inner.clone();
                running.spawn(async move {
                    let _permit = permit;
                    run_entry(inner, entry).await;
                });
            }
        }
    }
    // Graceful stop: let in-flight runs finish. The engine bounds this wait
    // with its shutdown deadline.
    while running.join_next().await.is_some() {}
}

async fn run_entry(inner: Arc<SchedulerInner>, entry: Arc<SignalEntry>) {
    {
        let mut state = entry.state.lock();
        if *state != SignalState::Signaled || !entry.active.load(Ordering::Acquire) {
            *state = SignalState::Idle;
            return;
        }
        *state = SignalState::Running;
    }

    // Handler futures are treated as unwind safe: a panicked run abandons
    // whatever state it was mutating and the entry stays at its last good
    // state.
    let timer = INVALIDATION_DURATION_SECONDS.start_timer();
    let outcome = std::panic::AssertUnwindSafe(entry.handler.on_invalidated())
        .catch_unwind()
        .await;
    timer.observe_duration();

    match outcome {
        Ok(Ok(())) => {
            INVALIDATION_RUNS.with_label_values(&["ok"]).inc();
        }
        Ok(Err(e)) => {
            // Isolated per cache: the entry stays registered and its state
            // remains whatever the last successful run produced.
            INVALIDATION_RUNS.with_label_values(&["error"]).inc();
            warn!("invalidation handler for entry {} failed: {e:?}", entry.id);
        }
        Err(panic) => {
            INVALIDATION_RUNS.with_label_values(&["panic"]).inc();
            error!(
                "invalidation handler for entry {} panicked: {panic:?}",
                entry.id
            );
        }
    }

    let follow_up = {
        let mut state = entry.state.lock();
        if *state == SignalState::RunningSignaled {
            *state = SignalState::Signaled;
            true
        } else {
            *state = SignalState::Idle;
            false
        }
    };
    if follow_up && entry.active.load(Ordering::Acquire) {
        inner.enqueue(entry.id);
    }
}
