use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::error;

use crate::errors::Result;
use crate::errors::TransportError;

/// Spawn a background task that logs instead of propagating its error.
pub(crate) fn spawn_named<F>(name: &str, task: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("background task '{name}' stopped with error: {e:?}");
        }
    })
}

/// Join a background task, bounded by the shutdown deadline.
pub(crate) async fn join_with_timeout(
    name: &str,
    handle: JoinHandle<()>,
    deadline: Duration,
) -> Result<()> {
    match timeout(deadline, handle).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("background task '{name}' join failed: {e:?}");
            Err(TransportError::TaskFailed(e).into())
        }
        Err(_) => {
            error!("background task '{name}' did not stop within {deadline:?}");
            Err(TransportError::ShutdownTimeout(deadline).into())
        }
    }
}
