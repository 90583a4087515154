//! Engine composition root
//!
//! [`LiveQueryEngine`] wires the collaborators together: the shared watch
//! registry, the invalidation scheduler, the change pump draining the
//! transport and the maintenance task executing deferred remote cleanup.
//! Lifecycle is explicit; nothing lives in ambient statics. Opening a query
//! runs the full setup pipeline (remote view, dependency resolution, diff
//! cache, scheduler registration, watch subscriptions, initial read) and
//! every partial-failure path releases what was already set up.

mod maintenance;


pub(crate) use maintenance::MaintenanceJob;

use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cache::CachePolicy;
use crate::cache::DiffCache;
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::errors::SetupError;
use crate::metrics::register_metrics;
use crate::observer::KeyExtractor;
use crate::observer::MaterializedQuery;
use crate::observer::QueryCore;
use crate::observer::RowMapper;
use crate::registry::SharedRegistry;
use crate::registry::WatchHandle;
use crate::resolver::DependencyResolver;
use crate::row::QueryId;
use crate::row::RelationId;
use crate::row::Row;
use crate::row::RowKey;
use crate::row::RowSchema;
use crate::scheduler::InvalidationHandler;
use crate::scheduler::InvalidationScheduler;
use crate::store::ChangeTransport;
use crate::store::CompiledQuery;
use crate::store::QueryExecutor;
use crate::store::SchemaCatalog;
use crate::store::SchemaMutator;
use crate::transport::run_change_pump;
use crate::utils::join_with_timeout;
use crate::utils::spawn_named;
use crate::watch::SubscriberId;
use crate::watch::TableWatch;

/// Type-erased disposal of an open query, used at engine shutdown to close
/// whatever the embedder has not closed yet.
trait DisposeHook: Send + Sync {
    fn dispose_now(&self);
}

impl<TRow, TKey> DisposeHook for QueryCore<TRow, TKey>
where
    TRow: Send + Sync + 'static,
    TKey: Eq + Hash + Send + Sync + 'static,
{
    fn dispose_now(&self) {
        self.dispose();
    }
}

struct EngineShared {
    config: EngineConfig,
    catalog: Arc<dyn SchemaCatalog>,
    mutator: Arc<dyn SchemaMutator>,
    executor: Arc<dyn QueryExecutor>,
    watches: SharedRegistry<RelationId, TableWatch>,
    scheduler: InvalidationScheduler,
    resolver: DependencyResolver,
    maintenance_tx: mpsc::UnboundedSender<MaintenanceJob>,
    open_queries: Mutex<Vec<Weak<dyn DisposeHook>>>,
    cancel: CancellationToken,
}

pub struct LiveQueryEngine {
    shared: Arc<EngineShared>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    shutdown_started: AtomicBool,
}

impl LiveQueryEngine {
    /// Start the engine's background tasks. Must run inside a tokio
    /// runtime. The collaborators stay owned by the caller's store binding;
    /// the engine only drives them.
    pub fn start(
        config: EngineConfig,
        catalog: Arc<dyn SchemaCatalog>,
        mutator: Arc<dyn SchemaMutator>,
        executor: Arc<dyn QueryExecutor>,
        transport: Arc<dyn ChangeTransport>,
    ) -> Result<Self> {
        config.validate()?;
        register_metrics();

        let (maintenance_tx, maintenance_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let watches: SharedRegistry<RelationId, TableWatch> = SharedRegistry::new();
        let scheduler = InvalidationScheduler::start(config.scheduler.worker_concurrency);
        let resolver = DependencyResolver::new(catalog.clone());

        let pump = spawn_named(
            "change-pump",
            run_change_pump(
                transport,
                watches.clone(),
                config.transport.clone(),
                cancel.clone(),
            ),
        );
        let maintenance = spawn_named(
            "store-maintenance",
            maintenance::run_maintenance(
                maintenance_rx,
                mutator.clone(),
                watches.clone(),
                cancel.clone(),
            ),
        );

        info!("live query engine started");
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                catalog,
                mutator,
                executor,
                watches,
                scheduler,
                resolver,
                maintenance_tx,
                open_queries: Mutex::new(Vec::new()),
                cancel,
            }),
            tasks: Mutex::new(vec![("change-pump", pump), ("store-maintenance", maintenance)]),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Open an untyped live query with the configured default cache policy.
    pub async fn open_query(
        &self,
        query: CompiledQuery,
    ) -> Result<MaterializedQuery<Row, RowKey>> {
        self.open_query_with(query, self.shared.config.query.default_cache_policy)
            .await
    }

    /// Open an untyped live query, keyed by [`RowKey`].
    pub async fn open_query_with(
        &self,
        query: CompiledQuery,
        policy: CachePolicy,
    ) -> Result<MaterializedQuery<Row, RowKey>> {
        self.open_inner(query, policy, |schema| {
            let schema = schema.clone();
            (
                Box::new(|row: &Row| row.clone()) as RowMapper<Row>,
                Box::new(move |row: &Row| schema.key_of(row)) as KeyExtractor<Row, RowKey>,
            )
        })
        .await
    }

    /// Open a typed live query. `map_row` projects each result row into the
    /// caller's type and `extract_key` derives the collection key from it.
    pub async fn open_query_mapped<TRow, TKey>(
        &self,
        query: CompiledQuery,
        policy: CachePolicy,
        map_row: impl Fn(&Row) -> TRow + Send + Sync + 'static,
        extract_key: impl Fn(&TRow) -> TKey + Send + Sync + 'static,
    ) -> Result<MaterializedQuery<TRow, TKey>>
    where
        TRow: Clone + Send + Sync + 'static,
        TKey: Eq + Hash + Clone + Send + Sync + 'static,
    {
        self.open_inner(query, policy, move |_schema| {
            (
                Box::new(map_row) as RowMapper<TRow>,
                Box::new(extract_key) as KeyExtractor<TRow, TKey>,
            )
        })
        .await
    }

    async fn open_inner<TRow, TKey>(
        &self,
        compiled: CompiledQuery,
        policy: CachePolicy,
        make_mappers: impl FnOnce(&RowSchema) -> (RowMapper<TRow>, KeyExtractor<TRow, TKey>),
    ) -> Result<MaterializedQuery<TRow, TKey>>
    where
        TRow: Clone + Send + Sync + 'static,
        TKey: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let shared = &self.shared;
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(SetupError::Disposed.into());
        }

        let query_id = QueryId::generate();
        let view = shared
            .mutator
            .create_query_view(&query_id, &compiled.command_text)
            .await
            .map_err(|source| SetupError::QueryView {
                query: query_id.clone(),
                source,
            })?;
        debug!("query {query_id} wrapped in view {view}");

        // From here on, every failure path must get rid of the view again.
        let drop_view = || {
            let _ = shared
                .maintenance_tx
                .send(MaintenanceJob::DropQueryView(query_id.clone()));
        };

        let columns = match shared.catalog.get_columns(&view).await {
            Ok(columns) => columns,
            Err(source) => {
                drop_view();
                return Err(SetupError::SchemaRead {
                    relation: view,
                    source,
                }
                .into());
            }
        };
        let schema = match RowSchema::new(columns, &compiled.key_columns) {
            Ok(schema) => schema,
            Err(e) => {
                drop_view();
                return Err(e.into());
            }
        };
        let dependencies = match shared.resolver.resolve(&view).await {
            Ok(dependencies) => dependencies,
            Err(e) => {
                drop_view();
                return Err(e);
            }
        };

        let cache = DiffCache::build(
            policy,
            query_id.clone(),
            view,
            schema.clone(),
            compiled.command_text,
            compiled.key_columns,
            shared.executor.clone(),
            shared.mutator.clone(),
            shared.maintenance_tx.clone(),
        );
        let (map_row, extract_key) = make_mappers(&schema);
        let core = Arc::new(QueryCore::new(cache, map_row, extract_key));
        let handler: Arc<dyn InvalidationHandler> = core.clone();
        let signal = shared.scheduler.register(false, handler);
        core.attach_signal(signal.clone());

        // Subscribe before the initial read so no change slips between the
        // read and the first signal; the core skips runs until initialized.
        let mut subscriptions: Vec<(WatchHandle<RelationId, TableWatch>, SubscriberId)> =
            Vec::new();
        let mut failure = None;
        for relation in dependencies {
            let subscribed = shared
                .watches
                .get_or_create(relation, |rel| {
                    TableWatch::open(
                        rel,
                        &shared.catalog,
                        &shared.mutator,
                        shared.maintenance_tx.clone(),
                    )
                })
                .await
                .and_then(|handle| {
                    let signal = signal.clone();
                    handle
                        .subscribe(move |_batch| signal.set())
                        .map(|id| (handle, id))
                });
            match subscribed {
                Ok(pair) => subscriptions.push(pair),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            signal.retire();
            for (handle, id) in subscriptions {
                handle.unsubscribe(id);
            }
            core.dispose();
            drop_view();
            return Err(e);
        }

        // Teardown order mirrors setup in reverse: stop new runs, release
        // the watches, then get rid of the remote view. The cache's own
        // shadow cleanup hangs off its gate inside `core.dispose`.
        core.gate.attach({
            let signal = signal.clone();
            move || signal.retire()
        });
        core.gate.attach(move || {
            for (handle, id) in subscriptions {
                handle.unsubscribe(id);
            }
        });
        core.gate.attach({
            let maintenance_tx = shared.maintenance_tx.clone();
            let query_id = query_id.clone();
            move || {
                let _ = maintenance_tx.send(MaintenanceJob::DropQueryView(query_id));
            }
        });

        {
            let hook: Arc<dyn DisposeHook> = core.clone();
            let mut open_queries = shared.open_queries.lock();
            open_queries.retain(|w| w.strong_count() > 0);
            open_queries.push(Arc::downgrade(&hook));
        }

        if let Err(e) = core.initialize().await {
            core.dispose();
            return Err(e);
        }
        info!("query {query_id} open");
        Ok(MaterializedQuery::new(core))
    }

    /// Stop background tasks and release every remaining remote object.
    /// Idempotent; queries still open are closed on the embedder's behalf.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("live query engine shutting down");

        // Close leftover queries first so their cleanup jobs land on the
        // maintenance queue before it drains.
        let hooks: Vec<Weak<dyn DisposeHook>> = {
            let mut open_queries = self.shared.open_queries.lock();
            open_queries.drain(..).collect()
        };
        for weak in hooks {
            if let Some(core) = weak.upgrade() {
                core.dispose_now();
            }
        }

        self.shared.cancel.cancel();
        let deadline = self.shared.config.scheduler.shutdown_timeout();
        let tasks: Vec<(&'static str, JoinHandle<()>)> = self.tasks.lock().drain(..).collect();
        for (name, handle) in tasks {
            if let Err(e) = join_with_timeout(name, handle, deadline).await {
                warn!("shutdown of task '{name}' incomplete: {e}");
            }
        }
        if let Err(e) = self.shared.scheduler.shutdown(deadline).await {
            warn!("scheduler shutdown incomplete: {e}");
        }

        // Watches that are somehow still live missed the maintenance queue;
        // uninstall their capture inline.
        let leftovers = self.shared.watches.live_keys();
        self.shared.watches.dispose_all();
        for relation in leftovers {
            if let Err(e) = self.shared.mutator.uninstall_change_capture(&relation).await {
                warn!("failed to uninstall change capture on {relation}: {e}");
            }
        }
        info!("live query engine stopped");
        Ok(())
    }

    /// Number of relations currently instrumented for change capture.
    pub fn live_watch_count(&self) -> usize {
        self.shared.watches.live_count()
    }
}

impl Drop for LiveQueryEngine {
    fn drop(&mut self) {
        // Graceful release of remote objects needs `shutdown`; dropping
        // only stops the background tasks.
        self.shared.cancel.cancel();
    }
}
