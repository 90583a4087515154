//! Change transport pump
//!
//! One background task drains the store's change feed and routes each raw
//! message to the live watch of its relation. Messages for relations
//! without a live watch are dropped (the capture uninstall is asynchronous,
//! so a short tail of deliveries after the last release is expected).
//! Receive failures back off exponentially with jitter and never terminate
//! the pump; only cancellation does.

#[cfg(test)]
mod transport_test;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::TransportConfig;
use crate::errors::Result;
use crate::metrics::CHANGE_BATCHES_DROPPED;
use crate::metrics::TRANSPORT_RECEIVE_FAILURES;
use crate::registry::SharedRegistry;
use crate::row::RelationId;
use crate::store::ChangeTransport;
use crate::watch::TableWatch;

pub(crate) async fn run_change_pump(
    transport: Arc<dyn ChangeTransport>,
    watches: SharedRegistry<RelationId, TableWatch>,
    config: TransportConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = config.backoff_base();
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("change pump stopping");
                return Ok(());
            }
            received = transport.receive(config.receive_timeout()) => received,
        };
        match received {
            Ok(messages) => {
                backoff = config.backoff_base();
                for message in messages {
                    // The transient handle keeps the watch alive for the
                    // duration of the delivery even if the last observer
                    // releases it concurrently.
                    match watches.try_get_existing(&message.relation) {
                        Some(watch) => watch.deliver(&message),
                        None => {
                            CHANGE_BATCHES_DROPPED.inc();
                            trace!("no live watch for {}, dropping batch", message.relation);
                        }
                    }
                }
            }
            Err(e) => {
                TRANSPORT_RECEIVE_FAILURES.inc();
                warn!("change transport receive failed, retrying in {backoff:?}: {e}");
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis().max(4) / 4) as u64);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("change pump stopping");
                        return Ok(());
                    }
                    _ = sleep(backoff + jitter) => {}
                }
                backoff = (backoff * 2).min(config.backoff_max());
            }
        }
    }
}
