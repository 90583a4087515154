use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::errors::InvalidationError;
use crate::errors::Result;
use crate::errors::SetupError;
use crate::row::QueryId;
use crate::row::Row;
use crate::row::RowDiff;
use crate::row::RowKey;
use crate::row::RowSchema;
use crate::store::QueryExecutor;

/// Diff variant keeping the full previous result keyed by row key in
/// process. Each recompute re-reads the current result and classifies rows
/// by key membership and value equality; same-key rows with equal values
/// are no-ops. O(current size) work per invalidation, no remote-side state.
pub(super) struct InProcessDiff {
    executor: Arc<dyn QueryExecutor>,
    command_text: String,
    /// Last-known rows keyed by `key_of`. Mutated only inside this cache's
    /// own invalidation handler, which the scheduler serializes.
    baseline: Mutex<HashMap<RowKey, Row>>,
}

impl InProcessDiff {
    pub(super) fn new(executor: Arc<dyn QueryExecutor>, command_text: String) -> Self {
        Self {
            executor,
            command_text,
            baseline: Mutex::new(HashMap::new()),
        }
    }

    pub(super) async fn initialize(&self, query: &QueryId, schema: &RowSchema) -> Result<Vec<Row>> {
        let rows = self
            .executor
            .read_rows(&self.command_text, schema)
            .await
            .map_err(|source| SetupError::InitialRead {
                query: query.clone(),
                source,
            })?;
        let mut baseline = self.baseline.lock().await;
        baseline.clear();
        for row in &rows {
            baseline.insert(schema.key_of(row), row.clone());
        }
        Ok(rows)
    }

    pub(super) async fn calculate(&self, query: &QueryId, schema: &RowSchema) -> Result<RowDiff> {
        let current = self
            .executor
            .read_rows(&self.command_text, schema)
            .await
            .map_err(|source| InvalidationError::Recompute {
                query: query.clone(),
                source,
            })?;

        let mut baseline = self.baseline.lock().await;
        let mut vanished: HashMap<RowKey, Row> = baseline.clone();
        let mut diff = RowDiff::default();

        for row in current {
            let key = schema.key_of(&row);
            match baseline.get(&key) {
                Some(previous) => {
                    vanished.remove(&key);
                    if previous != &row {
                        baseline.insert(key, row.clone());
                        diff.updated.push(row);
                    }
                }
                None => {
                    baseline.insert(key, row.clone());
                    diff.inserted.push(row);
                }
            }
        }

        for (key, row) in vanished {
            baseline.remove(&key);
            diff.deleted.push(row);
        }
        Ok(diff)
    }
}
