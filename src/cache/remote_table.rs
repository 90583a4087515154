use std::sync::Arc;

use tracing::debug;

use crate::errors::InvalidationError;
use crate::errors::Result;
use crate::errors::SetupError;
use crate::row::QueryId;
use crate::row::RelationId;
use crate::row::Row;
use crate::row::RowDiff;
use crate::row::RowSchema;
use crate::store::SchemaMutator;

/// Diff variant keeping the previous result as a remote shadow table. The
/// store reconciles shadow and live view in one merge operation that
/// returns the three row sets directly, and initialization reads the
/// shadow instead of re-executing the possibly expensive query body.
/// `memory_optimized` selects the memory-optimized shadow sub-variant.
pub(super) struct RemoteTableDiff {
    mutator: Arc<dyn SchemaMutator>,
    view: RelationId,
    key_columns: Vec<String>,
    memory_optimized: bool,
}

impl RemoteTableDiff {
    pub(super) fn new(
        mutator: Arc<dyn SchemaMutator>,
        view: RelationId,
        key_columns: Vec<String>,
        memory_optimized: bool,
    ) -> Self {
        Self {
            mutator,
            view,
            key_columns,
            memory_optimized,
        }
    }

    pub(super) async fn initialize(&self, query: &QueryId, schema: &RowSchema) -> Result<Vec<Row>> {
        self.mutator
            .create_shadow_table(query, &self.view, &self.key_columns, self.memory_optimized)
            .await
            .map_err(|source| SetupError::ShadowTable {
                query: query.clone(),
                source,
            })?;
        debug!(
            "shadow table created for query {query} (memory_optimized: {})",
            self.memory_optimized
        );
        self.mutator
            .read_shadow_table(query, schema)
            .await
            .map_err(|source| SetupError::InitialRead {
                query: query.clone(),
                source,
            })
            .map_err(Into::into)
    }

    pub(super) async fn calculate(&self, query: &QueryId, schema: &RowSchema) -> Result<RowDiff> {
        self.mutator
            .reconcile_shadow_table(query, schema)
            .await
            .map_err(|source| InvalidationError::Reconcile {
                query: query.clone(),
                source,
            })
            .map_err(Into::into)
    }
}
