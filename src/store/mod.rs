//! Store collaborator contracts
//!
//! The engine core never talks SQL itself. Everything remote goes through
//! these traits: the catalog answers schema questions, the mutator installs
//! and removes the per-relation / per-query artifacts (change capture,
//! views, shadow tables), the executor runs opaque command text, and the
//! transport delivers raw change batches. Production implementations own
//! the SQL text generation; tests plug in mocks or the in-memory fake store.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::errors::StoreError;
use crate::row::Column;
use crate::row::ObjectKind;
use crate::row::QueryId;
use crate::row::RelationId;
use crate::row::Row;
use crate::row::RowChangeKind;
use crate::row::RowDiff;
use crate::row::RowSchema;

/// One raw change event as carried by the transport: the mutated relation,
/// the change kind and the affected rows as (column name, textual-or-null
/// value) pairs. Decoding into typed rows happens in the core.
#[derive(Debug, Clone)]
pub struct RawChangeMessage {
    pub relation: RelationId,
    pub kind: RowChangeKind,
    pub rows: Vec<Vec<(String, Option<String>)>>,
}

/// Output of the external query compiler: opaque command text plus the
/// ordered key columns of its result set. The core never inspects the text.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub command_text: String,
    pub key_columns: Vec<String>,
}

impl CompiledQuery {
    pub fn new(command_text: impl Into<String>, key_columns: Vec<String>) -> Self {
        Self {
            command_text: command_text.into(),
            key_columns,
        }
    }
}

/// Read-only schema metadata of the remote store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Ordered column list of a relation.
    async fn get_columns(&self, relation: &RelationId) -> Result<Vec<Column>, StoreError>;

    /// Ordered key-column names of a relation.
    async fn get_key_columns(&self, relation: &RelationId) -> Result<Vec<String>, StoreError>;

    /// Objects a derived view reads from, one hop deep. Base tables are
    /// leaves; views are expanded further by the dependency resolver.
    async fn get_references(
        &self,
        relation: &RelationId,
    ) -> Result<Vec<(RelationId, ObjectKind)>, StoreError>;
}

/// Remote DDL operations the core drives through lifecycle events. All
/// operations are idempotent on construction/teardown: installing capture
/// twice or dropping an already absent object must not fail.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaMutator: Send + Sync {
    async fn install_change_capture(&self, relation: &RelationId) -> Result<(), StoreError>;

    async fn uninstall_change_capture(&self, relation: &RelationId) -> Result<(), StoreError>;

    /// Wrap an opened query's command text in a named remote view and
    /// return the view's identity.
    async fn create_query_view(
        &self,
        query: &QueryId,
        command_text: &str,
    ) -> Result<RelationId, StoreError>;

    async fn drop_query_view(&self, query: &QueryId) -> Result<(), StoreError>;

    /// Create (and populate) the shadow copy of a query's current result.
    async fn create_shadow_table(
        &self,
        query: &QueryId,
        view: &RelationId,
        key_columns: &[String],
        memory_optimized: bool,
    ) -> Result<(), StoreError>;

    async fn drop_shadow_table(&self, query: &QueryId) -> Result<(), StoreError>;

    /// Full read of the shadow table, decoded against `schema`.
    async fn read_shadow_table(
        &self,
        query: &QueryId,
        schema: &RowSchema,
    ) -> Result<Vec<Row>, StoreError>;

    /// Run the remote merge reconciliation between the query view and its
    /// shadow table, returning the rows that were inserted, updated and
    /// deleted since the previous reconciliation.
    async fn reconcile_shadow_table(
        &self,
        query: &QueryId,
        schema: &RowSchema,
    ) -> Result<RowDiff, StoreError>;
}

/// Executes opaque command text and returns the full result set.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn read_rows(
        &self,
        command_text: &str,
        schema: &RowSchema,
    ) -> Result<Vec<Row>, StoreError>;
}

/// Delivers raw change batches. `receive` blocks up to `timeout` and may
/// return an empty batch list on timeout; the pump loops forever around it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    async fn receive(&self, timeout: Duration) -> Result<Vec<RawChangeMessage>, StoreError>;
}
