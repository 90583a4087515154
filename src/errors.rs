//! Live-query engine error hierarchy
//!
//! Errors are grouped by the phase they occur in: setup (instrumenting
//! relations, creating remote shadow objects), transport (receiving and
//! decoding change batches) and invalidation (recomputing a cache). Setup
//! failures propagate synchronously to the caller that opened the watch or
//! query; invalidation failures are isolated per cache and never unwind the
//! scheduler or the transport loop.

use std::time::Duration;

use tokio::task::JoinError;

use crate::row::QueryId;
use crate::row::RelationId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Instrumenting a relation or creating a remote object failed.
    /// Fatal to the watch/cache being constructed, not to the engine.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Receiving or decoding change batches failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A cache recomputation failed. The cache keeps serving its
    /// last successfully materialized state.
    #[error(transparent)]
    Invalidation(#[from] InvalidationError),

    /// Engine configuration validation failures
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Unrecoverable failures requiring engine shutdown
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Error surface of the store collaborators (`SchemaCatalog`,
/// `SchemaMutator`, `QueryExecutor`, `ChangeTransport`). The core wraps
/// these with the identity of the object it was working on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("object not found: {0}")]
    NotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Reading column or key metadata for a relation failed
    #[error("failed to read schema of {relation}: {source}")]
    SchemaRead {
        relation: RelationId,
        source: StoreError,
    },

    /// Installing change-capture instrumentation failed
    #[error("failed to install change capture on {relation}: {source}")]
    ChangeCapture {
        relation: RelationId,
        source: StoreError,
    },

    /// Creating the remote view wrapping an opened query failed
    #[error("failed to create view for query {query}: {source}")]
    QueryView { query: QueryId, source: StoreError },

    /// Creating the remote shadow table for a remote-diff cache failed
    #[error("failed to create shadow table for query {query}: {source}")]
    ShadowTable { query: QueryId, source: StoreError },

    /// Resolving the dependency set of a derived object failed
    #[error("failed to resolve dependencies of {relation}: {source}")]
    DependencyResolution {
        relation: RelationId,
        source: StoreError,
    },

    /// The initial full read of a query's result set failed
    #[error("initial read of query {query} failed: {source}")]
    InitialRead { query: QueryId, source: StoreError },

    /// A declared key column is not part of the declared column list
    #[error("key column '{column}' is not a declared column")]
    KeyColumnMissing { column: String },

    /// The key columns must form a subsequence of the declared columns
    #[error("key column '{column}' is out of declared-column order")]
    KeyColumnOrder { column: String },

    /// The same column name was declared twice
    #[error("column '{column}' declared more than once")]
    DuplicateColumn { column: String },

    /// A row schema needs at least one key column
    #[error("schema declares no key columns")]
    NoKeyColumns,

    /// Operation attempted on an already disposed object
    #[error("object is disposed")]
    Disposed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport receive call failed; retried with backoff
    #[error("change transport receive failed: {0}")]
    Receive(#[from] StoreError),

    /// A raw change message did not match the relation's schema
    #[error("cannot decode change message for {relation}: {reason}")]
    Decode {
        relation: RelationId,
        reason: String,
    },

    /// A background task did not stop within the shutdown deadline
    #[error("background task did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("background task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidationError {
    /// Recomputing a cache's result set failed
    #[error("recompute of query {query} failed: {source}")]
    Recompute { query: QueryId, source: StoreError },

    /// The remote shadow-table reconciliation failed
    #[error("shadow reconciliation of query {query} failed: {source}")]
    Reconcile { query: QueryId, source: StoreError },

    /// The cache was disposed while a signal was still pending
    #[error("cache for query {query} is disposed")]
    Disposed { query: QueryId },
}
