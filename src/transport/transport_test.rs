use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::*;
use crate::config::TransportConfig;
use crate::errors::StoreError;
use crate::row::RowChangeKind;
use crate::row::SqlValue;
use crate::store::MockChangeTransport;
use crate::store::RawChangeMessage;
use crate::store::SchemaCatalog;
use crate::store::SchemaMutator;
use crate::test_utils::int_col;
use crate::test_utils::row_it;
use crate::test_utils::text_col;
use crate::test_utils::FakeStore;
use crate::watch::TableWatch;

fn users() -> RelationId {
    RelationId::new("app", "users")
}

fn pump_config() -> TransportConfig {
    TransportConfig {
        receive_timeout_in_ms: 20,
        backoff_base_in_ms: 5,
        backoff_max_in_ms: 40,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn pump_routes_messages_to_the_live_watch() {
    let store = FakeStore::new();
    store.define_table(users(), vec![int_col("id"), text_col("name")], vec!["id"]);

    let watches: SharedRegistry<RelationId, TableWatch> = SharedRegistry::new();
    let catalog: Arc<dyn SchemaCatalog> = store.clone();
    let mutator: Arc<dyn SchemaMutator> = store.clone();
    let (maintenance_tx, _maintenance_rx) = mpsc::unbounded_channel();
    let watch = watches
        .get_or_create(users(), |rel| {
            TableWatch::open(rel, &catalog, &mutator, maintenance_tx.clone())
        })
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    watch
        .subscribe(move |batch| {
            seen_clone
                .lock()
                .push((batch.kind, batch.rows[0][0].clone()));
        })
        .unwrap();

    let cancel = CancellationToken::new();
    let pump = tokio::spawn(run_change_pump(
        store.clone(),
        watches.clone(),
        pump_config(),
        cancel.clone(),
    ));

    store.insert_row(&users(), row_it(1, "ada"));
    store.delete_row(&users(), row_it(1, "ada"));
    wait_until(|| seen.lock().len() == 2).await;
    assert_eq!(
        *seen.lock(),
        vec![
            (RowChangeKind::Inserted, SqlValue::Int(1)),
            (RowChangeKind::Deleted, SqlValue::Int(1)),
        ]
    );

    cancel.cancel();
    pump.await.unwrap().unwrap();
}

#[tokio::test]
async fn messages_for_unwatched_relations_are_dropped() {
    let store = FakeStore::new();
    store.define_table(users(), vec![int_col("id"), text_col("name")], vec!["id"]);

    let watches: SharedRegistry<RelationId, TableWatch> = SharedRegistry::new();
    let cancel = CancellationToken::new();
    let pump = tokio::spawn(run_change_pump(
        store.clone(),
        watches,
        pump_config(),
        cancel.clone(),
    ));

    // No watch exists; the pump must swallow this and keep looping.
    store.push_raw(RawChangeMessage {
        relation: users(),
        kind: RowChangeKind::Inserted,
        rows: vec![vec![("id".to_string(), Some("1".to_string()))]],
    });
    sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    pump.await.unwrap().unwrap();
}

#[tokio::test]
async fn receive_failures_back_off_and_recover() {
    let mut transport = MockChangeTransport::new();
    let mut calls = 0;
    transport.expect_receive().returning_st(move |_| {
        calls += 1;
        match calls {
            1 | 2 => Err(StoreError::Unavailable("flaky".to_string())),
            _ => Ok(vec![]),
        }
    });

    let watches: SharedRegistry<RelationId, TableWatch> = SharedRegistry::new();
    let cancel = CancellationToken::new();
    let pump = tokio::spawn(run_change_pump(
        Arc::new(transport),
        watches,
        pump_config(),
        cancel.clone(),
    ));

    // Two failures back off briefly, then the pump settles back into
    // polling. Surviving this window proves the loop did not terminate.
    sleep(Duration::from_millis(100)).await;
    assert!(!pump.is_finished());

    cancel.cancel();
    pump.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_stops_the_pump_promptly() {
    let store = FakeStore::new();
    let watches: SharedRegistry<RelationId, TableWatch> = SharedRegistry::new();
    let cancel = CancellationToken::new();
    let pump = tokio::spawn(run_change_pump(
        store,
        watches,
        TransportConfig::default(),
        cancel.clone(),
    ));

    sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), pump)
        .await
        .expect("pump did not stop")
        .unwrap()
        .unwrap();
}
