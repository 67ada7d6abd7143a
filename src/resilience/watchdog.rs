//! Per-attempt deadline.
//!
//! Each attempt runs on its own task. When the deadline passes first the
//! attempt is reported as a timeout and its task is detached: the upstream
//! call may still finish in the background, but its result is discarded.

use crate::error_code::StandardErrorCode;
use crate::upstream::UpstreamError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Maximum time one upstream attempt may run.
    pub timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { timeout_ms: 25_000 }
    }
}

impl WatchdogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
}

impl Watchdog {
    pub fn new(cfg: &WatchdogConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one attempt under the deadline.
    ///
    /// A panicking attempt is classified `unknown` and is not retried.
    pub async fn run<T, Fut>(&self, attempt: Fut) -> Result<T, UpstreamError>
    where
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(attempt);
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "upstream attempt task failed");
                Err(UpstreamError::new(
                    StandardErrorCode::Unknown,
                    format!("upstream attempt task failed: {join_err}"),
                ))
            }
            // The JoinHandle was dropped with the timeout future; the task is detached.
            Err(_) => Err(UpstreamError::timeout(format!(
                "no upstream response within {} ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn watchdog(ms: u64) -> Watchdog {
        Watchdog::new(&WatchdogConfig::new().with_timeout(Duration::from_millis(ms)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_attempt_passes_through() {
        let out = watchdog(1_000)
            .run(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, UpstreamError>(42)
            })
            .await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_keeps_running() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let out = watchdog(100)
            .run(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, UpstreamError>(())
            })
            .await;

        let err = out.unwrap_err();
        assert_eq!(err.code, StandardErrorCode::Timeout);
        assert!(err.retryable());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(finished.load(Ordering::SeqCst), "detached attempt should still complete");
    }

    async fn explode() -> Result<(), UpstreamError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_unknown() {
        let out = watchdog(1_000).run(explode()).await;
        let err = out.unwrap_err();
        assert_eq!(err.code, StandardErrorCode::Unknown);
        assert!(!err.retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_is_returned_unchanged() {
        let out: Result<(), UpstreamError> = watchdog(1_000)
            .run(async { Err(UpstreamError::network("connection reset")) })
            .await;
        assert_eq!(out.unwrap_err().code, StandardErrorCode::Network);
    }
}
