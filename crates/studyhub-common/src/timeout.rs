//! Optional time bounds for network calls.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::StudyHubError;

/// Run an operation, bounded by `limit` when one is given.
///
/// With `None` the operation runs to completion however long it takes.
pub async fn with_timeout<T, Fut>(limit: Option<Duration>, operation: Fut) -> Result<T, StudyHubError>
where
    Fut: Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation).await.map_err(|_| {
            debug!(?limit, "Operation timed out");
            StudyHubError::Timeout(limit)
        }),
        None => Ok(operation.await),
    }
}
