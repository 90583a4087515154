//! Query diff caches
//!
//! A [`DiffCache`] owns the last-known state of one query's result set and
//! produces (inserted, updated, deleted) diffs against the current remote
//! state when the scheduler asks it to recompute. The variants share one
//! contract and differ only in where the previous state lives and who
//! computes the difference: in-process against a keyed baseline map, or
//! remotely against a shadow table reconciled by the store.

mod in_process;
mod remote_table;


use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::MaintenanceJob;
use crate::errors::InvalidationError;
use crate::errors::Result;
use crate::errors::SetupError;
use crate::row::QueryId;
use crate::row::RelationId;
use crate::row::Row;
use crate::row::RowDiff;
use crate::row::RowSchema;
use crate::store::QueryExecutor;
use crate::store::SchemaMutator;
use crate::utils::DisposalGate;

use in_process::InProcessDiff;
use remote_table::RemoteTableDiff;

/// Which diff mechanism a query uses. The in-process and remote-table
/// designs are co-equal options with different tradeoffs: the in-process
/// variant re-reads and compares the full result per invalidation without
/// remote-side state; the remote variants keep a shadow copy in the store
/// and let a merge reconciliation compute the diff there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    InProcess,
    RemoteTable,
    RemoteMemoryTable,
}

enum DiffEngine {
    InProcess(InProcessDiff),
    Remote(RemoteTableDiff),
}

pub(crate) struct DiffCache {
    query: QueryId,
    schema: RowSchema,
    engine: DiffEngine,
    gate: DisposalGate,
}

impl DiffCache {
    /// Assemble a cache for one opened query. Remote variants defer shadow
    /// creation to `initialize`; the shadow drop is attached to the
    /// disposal gate here so it runs even if initialization never happened
    /// (drops are idempotent on the store side).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        policy: CachePolicy,
        query: QueryId,
        view: RelationId,
        schema: RowSchema,
        command_text: String,
        key_columns: Vec<String>,
        executor: Arc<dyn QueryExecutor>,
        mutator: Arc<dyn SchemaMutator>,
        maintenance: mpsc::UnboundedSender<MaintenanceJob>,
    ) -> Self {
        let gate = DisposalGate::new();
        let engine = match policy {
            CachePolicy::InProcess => {
                DiffEngine::InProcess(InProcessDiff::new(executor, command_text))
            }
            CachePolicy::RemoteTable | CachePolicy::RemoteMemoryTable => {
                let memory_optimized = policy == CachePolicy::RemoteMemoryTable;
                gate.attach({
                    let maintenance = maintenance.clone();
                    let query = query.clone();
                    move || {
                        let _ = maintenance.send(MaintenanceJob::DropShadowTable(query.clone()));
                    }
                });
                DiffEngine::Remote(RemoteTableDiff::new(
                    mutator,
                    view,
                    key_columns,
                    memory_optimized,
                ))
            }
        };
        Self {
            query,
            schema,
            engine,
            gate,
        }
    }

    pub(crate) fn query(&self) -> &QueryId {
        &self.query
    }

    pub(crate) fn schema(&self) -> &RowSchema {
        &self.schema
    }

    /// First full read. Sets the internal baseline so that an immediately
    /// following `calculate_changes` yields an empty diff.
    pub(crate) async fn initialize(&self) -> Result<Vec<Row>> {
        if self.gate.is_disposed() {
            return Err(SetupError::Disposed.into());
        }
        match &self.engine {
            DiffEngine::InProcess(diff) => diff.initialize(&self.query, &self.schema).await,
            DiffEngine::Remote(diff) => diff.initialize(&self.query, &self.schema).await,
        }
    }

    /// Compute the diff against the baseline and advance it. Invoked only
    /// by the scheduler, never concurrently with itself for one cache.
    pub(crate) async fn calculate_changes(&self) -> Result<RowDiff> {
        if self.gate.is_disposed() {
            return Err(InvalidationError::Disposed {
                query: self.query.clone(),
            }
            .into());
        }
        match &self.engine {
            DiffEngine::InProcess(diff) => diff.calculate(&self.query, &self.schema).await,
            DiffEngine::Remote(diff) => diff.calculate(&self.query, &self.schema).await,
        }
    }

    /// Idempotent. Runs the attached remote-object cleanup exactly once.
    pub(crate) fn dispose(&self) {
        if self.gate.dispose() {
            debug!("diff cache for query {} disposed", self.query);
        }
    }
}
