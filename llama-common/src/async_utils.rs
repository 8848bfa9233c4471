//! Timeout helpers for shutdown paths

use std::time::Duration;
use tokio::time::timeout;

/// What to do when an operation does not finish in time
#[derive(Debug)]
pub enum TimeoutAction<E> {
    /// Fail with the given error
    ReturnError(E),
    /// Log a warning and return `Ok(None)`
    LogWarning,
}

/// Run `operation` with a deadline, handling expiry according to `action`
pub async fn with_timeout_action<T, E, F>(
    operation: F,
    timeout_duration: Duration,
    action: TimeoutAction<E>,
    context: &str,
) -> Result<Option<T>, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    match timeout(timeout_duration, operation).await {
        Ok(result) => result.map(Some),
        Err(_) => match action {
            TimeoutAction::ReturnError(error) => Err(error),
            TimeoutAction::LogWarning => {
                tracing::warn!("{} timed out after {:?}", context, timeout_duration);
                Ok(None)
            }
        },
    }
}
