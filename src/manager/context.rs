//! Cancellation and timeout for manager calls.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ManagerError, Result};

/// Carried into every manager operation.
///
/// Cancelling the token or exceeding the timeout abandons the outstanding
/// call. It does not cancel a job the manager already accepted.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl CallContext {
    /// A context that is never cancelled and has no timeout.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose calls each fail after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Tie this context to an externally owned token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `fut` to completion unless cancelled or timed out first.
    pub(crate) async fn run<F, T>(&self, method: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.timeout {
                Some(after) => tokio::time::timeout(after, fut)
                    .await
                    .map_err(|_| ManagerError::TimedOut {
                        method: method.to_string(),
                        after,
                    })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ManagerError::Cancelled {
                method: method.to_string(),
            }),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = CallContext::background();
        let value = ctx.run("Test", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_timeout_elapses() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let result: Result<()> = ctx
            .run("Slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ManagerError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let token = CancellationToken::new();
        let ctx = CallContext::background().with_token(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());

        let result = ctx.run("StartUnit", async { Ok(1) }).await;
        match result {
            Err(ManagerError::Cancelled { method }) => assert_eq!(method, "StartUnit"),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }
}
