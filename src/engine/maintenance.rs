use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::errors::Result;
use crate::registry::SharedRegistry;
use crate::row::QueryId;
use crate::row::RelationId;
use crate::store::SchemaMutator;
use crate::watch::TableWatch;

/// Deferred remote cleanup, enqueued by synchronous teardown paths (handle
/// drops, disposal gates) and executed serially on the maintenance task.
#[derive(Debug)]
pub(crate) enum MaintenanceJob {
    UninstallChangeCapture(RelationId),
    DropShadowTable(QueryId),
    DropQueryView(QueryId),
}

/// Serial executor for [`MaintenanceJob`]s. After cancellation the already
/// enqueued backlog is drained, so drops requested while shutting down
/// still reach the store.
pub(crate) async fn run_maintenance(
    mut jobs: mpsc::UnboundedReceiver<MaintenanceJob>,
    mutator: Arc<dyn SchemaMutator>,
    watches: SharedRegistry<RelationId, TableWatch>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            job = jobs.recv() => match job {
                Some(job) => execute(job, &mutator, &watches).await,
                None => return Ok(()),
            }
        }
    }
    while let Ok(job) = jobs.try_recv() {
        execute(job, &mutator, &watches).await;
    }
    Ok(())
}

async fn execute(
    job: MaintenanceJob,
    mutator: &Arc<dyn SchemaMutator>,
    watches: &SharedRegistry<RelationId, TableWatch>,
) {
    match job {
        MaintenanceJob::UninstallChangeCapture(relation) => {
            // The relation may have been re-watched between the teardown
            // that enqueued this job and now; the newer watch needs the
            // instrumentation to stay.
            if watches.try_get_existing(&relation).is_some() {
                debug!("capture on {relation} re-acquired, skipping uninstall");
                return;
            }
            match mutator.uninstall_change_capture(&relation).await {
                Ok(()) => debug!("change capture uninstalled from {relation}"),
                Err(e) => warn!("failed to uninstall change capture on {relation}: {e}"),
            }
        }
        MaintenanceJob::DropShadowTable(query) => {
            if let Err(e) = mutator.drop_shadow_table(&query).await {
                warn!("failed to drop shadow table of query {query}: {e}");
            }
        }
        MaintenanceJob::DropQueryView(query) => {
            if let Err(e) = mutator.drop_query_view(&query).await {
                warn!("failed to drop view of query {query}: {e}");
            }
        }
    }
}
