//! Timeout defaults and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{LdapError, Result};

/// Default timeout for establishing a connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-operation deadline
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the reader expires overdue requests
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Sleep between event-poller checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run `fut`, mapping an elapsed deadline to [`LdapError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(LdapError::Timeout),
    }
}

/// Deadline `timeout` from now; a zero timeout means no deadline
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_maps_to_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(LdapError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_result_passes_through() {
        let ok = with_timeout_error(async { Ok(7) }, Duration::from_secs(1)).await;
        assert_eq!(ok.ok(), Some(7));

        let err: Result<()> = with_timeout_error(
            async { Err(LdapError::ConnectionClosed) },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(err, Err(LdapError::ConnectionClosed)));
    }

    #[test]
    fn test_zero_means_no_deadline() {
        assert!(deadline_after(Duration::ZERO).is_none());
    }
}
