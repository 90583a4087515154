//! Live, strongly-typed collections kept in sync with a remote relational
//! store.
//!
//! The engine instruments base relations for change capture, shares one
//! watch per relation between all dependent queries, coalesces invalidation
//! signals, and applies (inserted, updated, deleted) diffs to in-process
//! materialized collections. Everything store-specific is behind the
//! collaborator traits (`SchemaCatalog`, `SchemaMutator`, `QueryExecutor`,
//! `ChangeTransport`); the core never generates SQL.

mod cache;
mod config;
mod engine;
mod errors;
mod metrics;
mod observer;
mod registry;
mod resolver;
mod row;
mod scheduler;
mod store;
mod transport;
mod utils;
mod watch;

pub use cache::*;
pub use config::*;
pub use engine::*;
pub use errors::*;
pub use metrics::*;
pub use observer::*;
pub use registry::*;
pub use resolver::*;
pub use row::*;
pub use scheduler::*;
pub use store::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
