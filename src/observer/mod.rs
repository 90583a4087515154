//! Materialized query observers
//!
//! A [`MaterializedQuery`] folds a diff cache's initial rows and subsequent
//! diffs into a keyed, thread-safely readable collection. All mutations
//! happen under one data-access lock, so a reader snapshot never observes a
//! partially applied diff. Readers take a snapshot under the lock and
//! iterate without holding it.


use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::DiffCache;
use crate::errors::Result;
use crate::row::QueryId;
use crate::row::Row;
use crate::scheduler::InvalidationHandler;
use crate::scheduler::SignalHandle;
use crate::utils::DisposalGate;

pub(crate) type RowMapper<TRow> = Box<dyn Fn(&Row) -> TRow + Send + Sync>;
pub(crate) type KeyExtractor<TRow, TKey> = Box<dyn Fn(&TRow) -> TKey + Send + Sync>;

/// Tracks whether the initial read has been applied and whether a signal
/// arrived before it was. Both transitions happen under one lock so a
/// deferred signal can never race past the re-arm sweep in `initialize`.
#[derive(Default)]
struct InitState {
    initialized: bool,
    missed_signal: bool,
}

/// Shared state of one open query: the diff cache, the materialized keyed
/// collection and the typed mapping functions. The engine attaches all
/// teardown (signal retirement, watch release, remote drops) to the gate.
pub(crate) struct QueryCore<TRow, TKey> {
    cache: DiffCache,
    rows: Mutex<HashMap<TKey, TRow>>,
    map_row: RowMapper<TRow>,
    extract_key: KeyExtractor<TRow, TKey>,
    pub(crate) gate: DisposalGate,
    init: Mutex<InitState>,
    signal: Mutex<Option<SignalHandle>>,
}

impl<TRow, TKey> QueryCore<TRow, TKey>
where
    TRow: Send + Sync + 'static,
    TKey: Eq + Hash + Send + Sync + 'static,
{
    pub(crate) fn new(
        cache: DiffCache,
        map_row: RowMapper<TRow>,
        extract_key: KeyExtractor<TRow, TKey>,
    ) -> Self {
        Self {
            cache,
            rows: Mutex::new(HashMap::new()),
            map_row,
            extract_key,
            gate: DisposalGate::new(),
            init: Mutex::new(InitState::default()),
            signal: Mutex::new(None),
        }
    }

    pub(crate) fn query(&self) -> &QueryId {
        self.cache.query()
    }

    pub(crate) fn attach_signal(&self, signal: SignalHandle) {
        *self.signal.lock() = Some(signal);
    }

    /// First full read: populate the keyed collection from the cache's
    /// baseline. Re-arms the signal if dependency changes arrived while
    /// initialization was still running.
    pub(crate) async fn initialize(&self) -> Result<()> {
        let initial = self.cache.initialize().await?;
        {
            let mut rows = self.rows.lock();
            rows.clear();
            for row in &initial {
                let mapped = (self.map_row)(row);
                rows.insert((self.extract_key)(&mapped), mapped);
            }
        }
        let missed = {
            let mut init = self.init.lock();
            init.initialized = true;
            std::mem::take(&mut init.missed_signal)
        };
        if missed {
            if let Some(signal) = self.signal.lock().as_ref() {
                signal.set();
            }
        }
        Ok(())
    }

    /// Idempotent disposal: runs the engine-attached teardown actions and
    /// releases the cache exactly once.
    pub(crate) fn dispose(&self) {
        if self.gate.dispose() {
            self.cache.dispose();
            self.rows.lock().clear();
            debug!("materialized query {} closed", self.query());
        }
    }

    fn apply<'a>(&self, rows: &mut HashMap<TKey, TRow>, upserts: impl Iterator<Item = &'a Row>) {
        for row in upserts {
            let mapped = (self.map_row)(row);
            rows.insert((self.extract_key)(&mapped), mapped);
        }
    }
}

#[async_trait]
impl<TRow, TKey> InvalidationHandler for QueryCore<TRow, TKey>
where
    TRow: Send + Sync + 'static,
    TKey: Eq + Hash + Send + Sync + 'static,
{
    async fn on_invalidated(&self) -> Result<()> {
        if self.gate.is_disposed() {
            return Ok(());
        }
        {
            let mut init = self.init.lock();
            if !init.initialized {
                // The initial read still in flight will re-arm the signal
                // when it completes, so this change is not lost.
                init.missed_signal = true;
                return Ok(());
            }
        }
        let diff = self.cache.calculate_changes().await?;
        if diff.is_empty() {
            return Ok(());
        }
        let mut rows = self.rows.lock();
        self.apply(&mut rows, diff.inserted.iter());
        self.apply(&mut rows, diff.updated.iter());
        for row in &diff.deleted {
            let mapped = (self.map_row)(row);
            rows.remove(&(self.extract_key)(&mapped));
        }
        Ok(())
    }
}

/// A live, keyed view of one query's result set. Obtained from
/// `LiveQueryEngine::open_query*`; closing (or dropping) it releases the
/// diff cache and, transitively, all dependency watches.
pub struct MaterializedQuery<TRow, TKey>
where
    TRow: Send + Sync + 'static,
    TKey: Eq + Hash + Send + Sync + 'static,
{
    core: Arc<QueryCore<TRow, TKey>>,
}

impl<TRow, TKey> MaterializedQuery<TRow, TKey>
where
    TRow: Clone + Send + Sync + 'static,
    TKey: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<QueryCore<TRow, TKey>>) -> Self {
        Self { core }
    }

    pub fn query(&self) -> &QueryId {
        self.core.query()
    }

    /// Point-in-time copy of the materialized rows. Taken under the
    /// data-access lock; iterate the returned vector freely.
    pub fn snapshot(&self) -> Vec<TRow> {
        self.core.rows.lock().values().cloned().collect()
    }

    pub fn get(&self, key: &TKey) -> Option<TRow> {
        self.core.rows.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.core.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.rows.lock().is_empty()
    }

    /// Stop observing and release everything owned by this query. Safe to
    /// call repeatedly and concurrently with in-flight refreshes.
    pub fn close(&self) {
        self.core.dispose();
    }
}

impl<TRow, TKey> Drop for MaterializedQuery<TRow, TKey>
where
    TRow: Send + Sync + 'static,
    TKey: Eq + Hash + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.dispose();
    }
}
