//! Retry / backoff executor.
//!
//! One `execute` call is: breaker check, then up to `max_attempts` attempts
//! each under the watchdog, then exactly one outcome report to the breaker.
//! Every attempt is recorded to metrics whatever the final result.

use crate::error::{Error, ErrorKind};
use crate::metrics::{
    now_ms, AttemptOutcome, AttemptSink, CallAttemptRecord, MetricsAggregator, NoopAttemptSink,
};
use crate::resilience::circuit_breaker::{
    CallDecision, CallOutcome, CallPermit, CircuitBreakerConfig, CircuitBreakerRegistry,
};
use crate::resilience::retry::{RetryConfig, RetryDecision, RetryPolicy};
use crate::resilience::watchdog::{Watchdog, WatchdogConfig};
use crate::upstream::{OpClass, UpstreamError};
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Executor {
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    sink: Arc<dyn AttemptSink>,
    retry: RetryPolicy,
    watchdog: Watchdog,
}

impl Executor {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsAggregator>,
        retry: RetryConfig,
        watchdog: &WatchdogConfig,
    ) -> Self {
        Self {
            breakers,
            metrics,
            sink: Arc::new(NoopAttemptSink),
            retry: RetryPolicy::new(retry),
            watchdog: Watchdog::new(watchdog),
        }
    }

    /// Standalone executor with its own breaker registry and metrics.
    pub fn standalone(
        breaker: CircuitBreakerConfig,
        retry: RetryConfig,
        watchdog: &WatchdogConfig,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self::new(
            Arc::new(CircuitBreakerRegistry::new(breaker)),
            metrics,
            retry,
            watchdog,
        )
    }

    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Flush buffered attempt records to the sink.
    pub async fn flush(&self) -> Result<()> {
        self.sink.flush().await
    }

    /// Run `operation` for `op_class` under breaker, watchdog and retry.
    ///
    /// `operation` is called once per attempt and must produce a fresh future
    /// each time. A timed-out attempt keeps running detached, so the upstream
    /// call must tolerate being issued more than once.
    pub async fn execute<T, F, Fut>(&self, op_class: &OpClass, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_with(op_class, false, operation).await
    }

    /// Like [`execute`](Self::execute); `bypass_breaker` skips the circuit
    /// check and leaves breaker state untouched.
    pub async fn execute_with<T, F, Fut>(
        &self,
        op_class: &OpClass,
        bypass_breaker: bool,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = if bypass_breaker {
            None
        } else {
            match self.breakers.before_call(op_class) {
                CallDecision::Proceed(permit) => Some(permit),
                CallDecision::FailFast {
                    reason,
                    retry_after_ms,
                } => {
                    debug!(op_class = %op_class, ?reason, retry_after_ms, "circuit fail-fast");
                    self.metrics.record_rejection(ErrorKind::CircuitOpen);
                    return Err(Error::CircuitOpen {
                        op_class: op_class.clone(),
                        retry_after_ms,
                    });
                }
            }
        };

        // A half-open probe decides the circuit on a single attempt.
        let max_attempts = if permit.as_ref().is_some_and(CallPermit::is_probe) {
            1
        } else {
            self.retry.max_attempts()
        };
        let request_id = Uuid::new_v4();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started_at_ms = now_ms();
            let started = Instant::now();
            let result = self.watchdog.run(operation()).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(value) => {
                    self.record(CallAttemptRecord {
                        request_id,
                        op_class: op_class.clone(),
                        attempt_number: attempt,
                        started_at_ms,
                        outcome: AttemptOutcome::Success,
                        latency_ms,
                        error_kind: None,
                        http_status: None,
                    })
                    .await;
                    self.settle(permit, CallOutcome::Success);
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.record(CallAttemptRecord {
                request_id,
                op_class: op_class.clone(),
                attempt_number: attempt,
                started_at_ms,
                outcome: AttemptOutcome::Failure,
                latency_ms,
                error_kind: Some(err.code),
                http_status: err.status,
            })
            .await;

            match self.retry.decide(&err, attempt, max_attempts) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        op_class = %op_class,
                        attempt,
                        latency_ms,
                        error_code = %err.code,
                        delay_ms = delay.as_millis() as u64,
                        "upstream attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp if err.retryable() => {
                    warn!(op_class = %op_class, attempts = attempt, error_code = %err.code, "upstream call failed");
                    self.settle(permit, CallOutcome::Failure);
                    return Err(Error::UpstreamTransient {
                        op_class: op_class.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
                RetryDecision::GiveUp => {
                    debug!(op_class = %op_class, error_code = %err.code, "upstream rejected request");
                    self.settle(permit, CallOutcome::Rejected);
                    return Err(Error::UpstreamPermanent {
                        op_class: op_class.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    fn settle(&self, permit: Option<CallPermit>, outcome: CallOutcome) {
        if let Some(permit) = permit {
            permit.report(outcome);
        }
    }

    async fn record(&self, record: CallAttemptRecord) {
        if let Err(e) = self.sink.report(&record).await {
            warn!(error = %e, "attempt sink failed");
        }
        self.metrics.record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::StandardErrorCode;
    use crate::metrics::{InMemoryAttemptSink, JsonlAttemptSink, MetricsConfig};
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn executor() -> Executor {
        Executor::standalone(
            CircuitBreakerConfig::new()
                .with_min_samples(5)
                .with_failure_ratio(0.5)
                .with_cooldown(Duration::from_secs(30)),
            RetryConfig::new().with_max_attempts(3).with_jitter(false),
            &WatchdogConfig::new().with_timeout(Duration::from_secs(2)),
            Arc::new(MetricsAggregator::new(&MetricsConfig::new())),
        )
    }

    fn counted<T: Send + 'static>(
        calls: &Arc<AtomicU32>,
        result: std::result::Result<T, UpstreamError>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<T, UpstreamError>> + Send>>
    where
        T: Clone,
    {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let r = result.clone();
            Box::pin(async move { r })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let ex = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let out = ex.execute(&OpClass::tts(), counted(&calls, Ok("audio"))).await.unwrap();
        assert_eq!(out, "audio");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ex.metrics().summary().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success_retries_with_backoff() {
        let ex = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let start = Instant::now();
        let out = ex
            .execute(&OpClass::stt(), move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(UpstreamError::from_status(503, "busy"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        // 250 ms then 500 ms of backoff
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(750) && waited < Duration::from_millis(800));

        let summary = ex.metrics().summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.op_classes["stt"].failure_count, 2);
        assert_eq!(
            ex.breakers().get(&OpClass::stt()).snapshot().success_count,
            1,
            "one breaker report per execute"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let ex = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let err = ex
            .execute(
                &OpClass::tts(),
                counted::<()>(&calls, Err(UpstreamError::from_status(422, "bad voice"))),
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::UpstreamPermanent);
        assert_eq!(err.http_status(), 422);
        let snap = ex.breakers().get(&OpClass::tts()).snapshot();
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_transient() {
        let ex = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let err = ex
            .execute(
                &OpClass::stt(),
                counted::<()>(&calls, Err(UpstreamError::network("reset"))),
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::UpstreamTransient { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ex.breakers().get(&OpClass::stt()).snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_timeout_is_transient() {
        let ex = Executor::standalone(
            CircuitBreakerConfig::new(),
            RetryConfig::new().with_max_attempts(1),
            &WatchdogConfig::new().with_timeout(Duration::from_millis(100)),
            Arc::new(MetricsAggregator::default()),
        );
        let err = ex
            .execute(&OpClass::tts(), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, UpstreamError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_TIMEOUT");
        let errs = ex.metrics().recent_errors(1);
        assert_eq!(errs[0].error_kind, Some(StandardErrorCode::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let ex = executor();
        let op = OpClass::stt();
        let failing = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let _ = ex
                .execute(&op, counted::<()>(&failing, Err(UpstreamError::network("down"))))
                .await;
        }
        assert_eq!(ex.breakers().get(&op).state(), CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let err = ex
            .execute(&op, counted(&calls, Ok(())))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.retry_after_ms().unwrap_or(0) > 0);
        assert_eq!(ex.metrics().rejections()[&ErrorKind::CircuitOpen], 1);

        // Bypass still reaches the upstream.
        ex.execute_with(&op, true, counted(&calls, Ok(()))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gets_single_attempt() {
        let ex = executor();
        let op = OpClass::chain();
        let failing = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let _ = ex
                .execute(&op, counted::<()>(&failing, Err(UpstreamError::network("down"))))
                .await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe_calls = Arc::new(AtomicU32::new(0));
        let err = ex
            .execute(&op, counted::<()>(&probe_calls, Err(UpstreamError::network("still down"))))
            .await
            .unwrap_err();
        assert_eq!(probe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::UpstreamTransient);
        assert_eq!(ex.breakers().get(&op).state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_sees_every_attempt() {
        let sink = Arc::new(InMemoryAttemptSink::new(100));
        let ex = executor().with_sink(sink.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let _ = ex
            .execute(&OpClass::tts(), counted::<()>(&calls, Err(UpstreamError::timeout("slow"))))
            .await;
        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.request_id == records[0].request_id));
        assert_eq!(
            records.iter().map(|r| r.attempt_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_attempt_log_does_not_delay_requests() {
        let (writer, _reader) = tokio::io::duplex(1);
        let sink = Arc::new(JsonlAttemptSink::from_writer(writer, 4));
        let ex = executor().with_sink(sink.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let served = tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..20 {
                ex.execute(&OpClass::tts(), counted(&calls, Ok(()))).await.unwrap();
            }
        })
        .await;
        assert!(served.is_ok(), "requests waited on the attempt log");
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(ex.metrics().summary().count, 20);
        assert!(sink.dropped() > 0);
    }
}
