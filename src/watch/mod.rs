//! Per-relation change watches
//!
//! A [`TableWatch`] represents "this base relation is instrumented for
//! change capture". It decodes raw transport deliveries against the
//! relation's schema and fans the typed batches out to all current
//! subscribers in arrival order. Watches are shared through the registry;
//! construction installs the capture instrumentation and teardown removes
//! it (deferred to the engine's maintenance task).


use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::engine::MaintenanceJob;
use crate::errors::Result;
use crate::errors::SetupError;
use crate::metrics::CHANGE_BATCHES_DROPPED;
use crate::metrics::CHANGE_BATCHES_RECEIVED;
use crate::metrics::LIVE_WATCHES;
use crate::registry::Teardown;
use crate::row::RelationId;
use crate::row::RowChangeBatch;
use crate::row::RowSchema;
use crate::store::RawChangeMessage;
use crate::store::SchemaCatalog;
use crate::store::SchemaMutator;
use crate::utils::DisposalGate;

pub type SubscriberId = u64;
type ChangeCallback = Arc<dyn Fn(&RowChangeBatch) + Send + Sync>;

pub struct TableWatch {
    relation: RelationId,
    schema: RowSchema,
    subscribers: DashMap<SubscriberId, ChangeCallback>,
    next_subscriber: AtomicU64,
    gate: DisposalGate,
}

impl TableWatch {
    /// Instrument `relation` for change capture. A failure (schema read or
    /// capture install) propagates and leaves nothing registered.
    pub(crate) async fn open(
        relation: RelationId,
        catalog: &Arc<dyn SchemaCatalog>,
        mutator: &Arc<dyn SchemaMutator>,
        maintenance: mpsc::UnboundedSender<MaintenanceJob>,
    ) -> Result<Self> {
        let columns =
            catalog
                .get_columns(&relation)
                .await
                .map_err(|source| SetupError::SchemaRead {
                    relation: relation.clone(),
                    source,
                })?;
        let key_columns =
            catalog
                .get_key_columns(&relation)
                .await
                .map_err(|source| SetupError::SchemaRead {
                    relation: relation.clone(),
                    source,
                })?;
        let schema = RowSchema::new(columns, &key_columns)?;

        mutator
            .install_change_capture(&relation)
            .await
            .map_err(|source| SetupError::ChangeCapture {
                relation: relation.clone(),
                source,
            })?;
        debug!("change capture installed on {relation}");
        LIVE_WATCHES.inc();

        let gate = DisposalGate::new();
        gate.attach({
            let relation = relation.clone();
            move || {
                LIVE_WATCHES.dec();
                // Remote DDL runs on the maintenance task; at engine
                // shutdown the channel is gone and dispose_all cleans up
                // directly instead.
                if maintenance
                    .send(MaintenanceJob::UninstallChangeCapture(relation.clone()))
                    .is_err()
                {
                    trace!("maintenance queue closed, uninstall of {relation} left to shutdown");
                }
            }
        });

        Ok(Self {
            relation,
            schema,
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            gate,
        })
    }

    pub fn relation(&self) -> &RelationId {
        &self.relation
    }

    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    /// Register a change callback. Callbacks see batches in arrival order.
    pub fn subscribe(
        &self,
        callback: impl Fn(&RowChangeBatch) + Send + Sync + 'static,
    ) -> Result<SubscriberId> {
        self.gate
            .run(|| {
                let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
                self.subscribers.insert(id, Arc::new(callback));
                id
            })
            .ok_or_else(|| SetupError::Disposed.into())
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Decode a raw delivery and re-emit it to all subscribers. Deliveries
    /// after teardown has begun are dropped; undecodable batches are
    /// counted and dropped, never faulting the transport loop.
    pub(crate) fn deliver(&self, message: &RawChangeMessage) {
        let delivered = self.gate.run(|| match self.schema.decode_batch(message) {
            Ok(batch) => {
                CHANGE_BATCHES_RECEIVED
                    .with_label_values(&[&self.relation.to_string()])
                    .inc();
                for subscriber in self.subscribers.iter() {
                    (subscriber.value())(&batch);
                }
            }
            Err(e) => {
                CHANGE_BATCHES_DROPPED.inc();
                warn!("dropping undecodable change batch: {e}");
            }
        });
        if delivered.is_none() {
            trace!("dropping delivery for {}, watch disposed", self.relation);
        }
    }
}

impl Teardown for TableWatch {
    fn teardown(&self) {
        if self.gate.dispose() {
            self.subscribers.clear();
            debug!("table watch for {} torn down", self.relation);
        }
    }
}
