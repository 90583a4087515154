use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::StoreError;
use crate::row::Column;
use crate::row::ObjectKind;
use crate::row::QueryId;
use crate::row::RelationId;
use crate::row::Row;
use crate::row::RowChangeKind;
use crate::row::RowDiff;
use crate::row::RowKey;
use crate::row::RowSchema;
use crate::row::SqlValue;
use crate::store::ChangeTransport;
use crate::store::QueryExecutor;
use crate::store::RawChangeMessage;
use crate::store::SchemaCatalog;
use crate::store::SchemaMutator;

/// In-memory store standing in for all four collaborators at once.
///
/// Command text convention: the text is the qualified name of one base
/// table ("schema.table") and the query result is that table's full row
/// set. Mutating a table through the helpers feeds the change queue the
/// way a real capture mechanism would, but only for relations whose
/// capture is currently installed.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    wakeup: Notify,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<RelationId, FakeTable>,
    views: HashMap<RelationId, ViewDef>,
    views_by_query: HashMap<QueryId, RelationId>,
    captured: HashSet<RelationId>,
    install_counts: HashMap<RelationId, usize>,
    uninstall_counts: HashMap<RelationId, usize>,
    shadows: HashMap<QueryId, HashMap<RowKey, Row>>,
    feed: VecDeque<RawChangeMessage>,
}

struct FakeTable {
    columns: Vec<Column>,
    key_columns: Vec<String>,
    rows: HashMap<RowKey, Row>,
}

struct ViewDef {
    source: RelationId,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn define_table(&self, relation: RelationId, columns: Vec<Column>, key_columns: Vec<&str>) {
        let mut state = self.state.lock();
        state.tables.insert(
            relation,
            FakeTable {
                columns,
                key_columns: key_columns.into_iter().map(str::to_string).collect(),
                rows: HashMap::new(),
            },
        );
    }

    pub fn insert_row(&self, relation: &RelationId, row: Row) {
        self.mutate(relation, row, RowChangeKind::Inserted);
    }

    pub fn update_row(&self, relation: &RelationId, row: Row) {
        self.mutate(relation, row, RowChangeKind::Updated);
    }

    pub fn delete_row(&self, relation: &RelationId, row: Row) {
        self.mutate(relation, row, RowChangeKind::Deleted);
    }

    /// Enqueue a raw message directly, bypassing table state. Lets tests
    /// exercise decode failures and unwatched-relation drops.
    pub fn push_raw(&self, message: RawChangeMessage) {
        self.state.lock().feed.push_back(message);
        self.wakeup.notify_waiters();
    }

    pub fn capture_installed(&self, relation: &RelationId) -> bool {
        self.state.lock().captured.contains(relation)
    }

    pub fn install_count(&self, relation: &RelationId) -> usize {
        self.state
            .lock()
            .install_counts
            .get(relation)
            .copied()
            .unwrap_or(0)
    }

    pub fn uninstall_count(&self, relation: &RelationId) -> usize {
        self.state
            .lock()
            .uninstall_counts
            .get(relation)
            .copied()
            .unwrap_or(0)
    }

    pub fn view_exists(&self, query: &QueryId) -> bool {
        self.state.lock().views_by_query.contains_key(query)
    }

    pub fn shadow_exists(&self, query: &QueryId) -> bool {
        self.state.lock().shadows.contains_key(query)
    }

    fn mutate(&self, relation: &RelationId, row: Row, kind: RowChangeKind) {
        let mut state = self.state.lock();
        let Some(table) = state.tables.get_mut(relation) else {
            panic!("table {relation} not defined");
        };
        let key = key_of(&table.key_columns, &table.columns, &row);
        match kind {
            RowChangeKind::Inserted | RowChangeKind::Updated => {
                table.rows.insert(key, row.clone());
            }
            RowChangeKind::Deleted => {
                table.rows.remove(&key);
            }
        }
        if state.captured.contains(relation) {
            let columns = state.tables[relation].columns.clone();
            state.feed.push_back(RawChangeMessage {
                relation: relation.clone(),
                kind,
                rows: vec![encode_row(&columns, &row)],
            });
            drop(state);
            self.wakeup.notify_waiters();
        }
    }

    fn current_result(
        state: &StoreState,
        text_or_view: &RelationId,
    ) -> Result<HashMap<RowKey, Row>, StoreError> {
        let source = match state.views.get(text_or_view) {
            Some(view) => &view.source,
            None => text_or_view,
        };
        state
            .tables
            .get(source)
            .map(|t| t.rows.clone())
            .ok_or_else(|| StoreError::NotFound(source.to_string()))
    }
}

fn key_of(key_columns: &[String], columns: &[Column], row: &Row) -> RowKey {
    let key = key_columns
        .iter()
        .map(|name| {
            let index = columns
                .iter()
                .position(|c| &c.name == name)
                .unwrap_or_else(|| panic!("key column {name} not declared"));
            row[index].clone()
        })
        .collect();
    RowKey(key)
}

fn encode_value(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Bool(b) => Some(b.to_string()),
        SqlValue::Int(i) => Some(i.to_string()),
        SqlValue::Float(f) => Some(f.to_string()),
        SqlValue::Text(s) => Some(s.clone()),
        SqlValue::Bytes(b) => Some(b.iter().map(|byte| format!("{byte:02x}")).collect()),
    }
}

fn encode_row(columns: &[Column], row: &Row) -> Vec<(String, Option<String>)> {
    columns
        .iter()
        .zip(row.values())
        .map(|(column, value)| (column.name.clone(), encode_value(value)))
        .collect()
}

fn parse_relation(text: &str) -> Result<RelationId, StoreError> {
    match text.split_once('.') {
        Some((schema, name)) => Ok(RelationId::new(schema, name)),
        None => Err(StoreError::Statement(format!(
            "unparseable command text '{text}'"
        ))),
    }
}

#[async_trait]
impl SchemaCatalog for FakeStore {
    async fn get_columns(&self, relation: &RelationId) -> Result<Vec<Column>, StoreError> {
        let state = self.state.lock();
        let source = match state.views.get(relation) {
            Some(view) => &view.source,
            None => relation,
        };
        state
            .tables
            .get(source)
            .map(|t| t.columns.clone())
            .ok_or_else(|| StoreError::NotFound(relation.to_string()))
    }

    async fn get_key_columns(&self, relation: &RelationId) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock();
        let source = match state.views.get(relation) {
            Some(view) => &view.source,
            None => relation,
        };
        state
            .tables
            .get(source)
            .map(|t| t.key_columns.clone())
            .ok_or_else(|| StoreError::NotFound(relation.to_string()))
    }

    async fn get_references(
        &self,
        relation: &RelationId,
    ) -> Result<Vec<(RelationId, ObjectKind)>, StoreError> {
        let state = self.state.lock();
        match state.views.get(relation) {
            Some(view) => Ok(vec![(view.source.clone(), ObjectKind::BaseTable)]),
            None if state.tables.contains_key(relation) => Ok(vec![]),
            None => Err(StoreError::NotFound(relation.to_string())),
        }
    }
}

#[async_trait]
impl SchemaMutator for FakeStore {
    async fn install_change_capture(&self, relation: &RelationId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(relation) {
            return Err(StoreError::NotFound(relation.to_string()));
        }
        state.captured.insert(relation.clone());
        *state.install_counts.entry(relation.clone()).or_default() += 1;
        Ok(())
    }

    async fn uninstall_change_capture(&self, relation: &RelationId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.captured.remove(relation);
        *state.uninstall_counts.entry(relation.clone()).or_default() += 1;
        Ok(())
    }

    async fn create_query_view(
        &self,
        query: &QueryId,
        command_text: &str,
    ) -> Result<RelationId, StoreError> {
        let source = parse_relation(command_text)?;
        let mut state = self.state.lock();
        if !state.tables.contains_key(&source) {
            return Err(StoreError::NotFound(source.to_string()));
        }
        let view = RelationId::new("fake", format!("v_{query}"));
        state.views.insert(view.clone(), ViewDef { source });
        state.views_by_query.insert(query.clone(), view.clone());
        Ok(view)
    }

    async fn drop_query_view(&self, query: &QueryId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(view) = state.views_by_query.remove(query) {
            state.views.remove(&view);
        }
        Ok(())
    }

    async fn create_shadow_table(
        &self,
        query: &QueryId,
        view: &RelationId,
        _key_columns: &[String],
        _memory_optimized: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let snapshot = FakeStore::current_result(&state, view)?;
        state.shadows.insert(query.clone(), snapshot);
        Ok(())
    }

    async fn drop_shadow_table(&self, query: &QueryId) -> Result<(), StoreError> {
        self.state.lock().shadows.remove(query);
        Ok(())
    }

    async fn read_shadow_table(
        &self,
        query: &QueryId,
        _schema: &RowSchema,
    ) -> Result<Vec<Row>, StoreError> {
        let state = self.state.lock();
        state
            .shadows
            .get(query)
            .map(|shadow| shadow.values().cloned().collect())
            .ok_or_else(|| StoreError::NotFound(format!("shadow of {query}")))
    }

    async fn reconcile_shadow_table(
        &self,
        query: &QueryId,
        _schema: &RowSchema,
    ) -> Result<RowDiff, StoreError> {
        let mut state = self.state.lock();
        let view = state
            .views_by_query
            .get(query)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("view of {query}")))?;
        let current = FakeStore::current_result(&state, &view)?;
        let shadow = state
            .shadows
            .get_mut(query)
            .ok_or_else(|| StoreError::NotFound(format!("shadow of {query}")))?;

        let mut diff = RowDiff::default();
        for (key, row) in &current {
            match shadow.get(key) {
                Some(previous) if previous == row => {}
                Some(_) => diff.updated.push(row.clone()),
                None => diff.inserted.push(row.clone()),
            }
        }
        for (key, row) in shadow.iter() {
            if !current.contains_key(key) {
                diff.deleted.push(row.clone());
            }
        }
        *shadow = current;
        Ok(diff)
    }
}

#[async_trait]
impl QueryExecutor for FakeStore {
    async fn read_rows(
        &self,
        command_text: &str,
        _schema: &RowSchema,
    ) -> Result<Vec<Row>, StoreError> {
        let source = parse_relation(command_text)?;
        let state = self.state.lock();
        FakeStore::current_result(&state, &source).map(|rows| rows.into_values().collect())
    }
}

#[async_trait]
impl ChangeTransport for FakeStore {
    async fn receive(&self, timeout: Duration) -> Result<Vec<RawChangeMessage>, StoreError> {
        loop {
            let wakeup = self.wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.feed.is_empty() {
                    return Ok(state.feed.drain(..).collect());
                }
            }
            tokio::select! {
                _ = wakeup => {}
                _ = tokio::time::sleep(timeout) => return Ok(vec![]),
            }
        }
    }
}
