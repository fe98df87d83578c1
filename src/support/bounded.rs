use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Runs a store call, turning an overrun of `limit` into [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(r) => r,
        Err(_) => Err(StoreError::Timeout { timeout: limit }),
    }
}
