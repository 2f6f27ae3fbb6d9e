//! Transaction-level retry for transient storage failures.

use std::future::Future;
use std::time::Duration;

use tessera_types::config::EngineConfig;

use super::error::{EngineError, ErrorKind};

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt must open its own transaction: a failed attempt's writes
/// are rolled back when its transaction handle drops.
pub async fn retry_transient<T, F, Fut>(
    config: &EngineConfig,
    operation: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_attempts = config.transaction_max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.kind() == ErrorKind::Retryable && attempt < max_attempts => {
                let backoff = config.transaction_retry_backoff_ms * u64::from(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff,
                    error = %e,
                    "transient storage error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tessera_types::error::RepositoryError;

    fn config(attempts: u32) -> EngineConfig {
        EngineConfig {
            transaction_max_attempts: attempts,
            transaction_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&config(3), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::from(RepositoryError::Busy("locked".into())))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&config(2), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::from(RepositoryError::Connection))
        })
        .await;
        assert!(matches!(result, Err(EngineError::Repository(RepositoryError::Connection))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&config(5), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Input("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
