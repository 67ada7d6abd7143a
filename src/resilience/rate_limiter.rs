use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const REJECT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Which bucket rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    Global,
    Client,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateScope::Global => f.write_str("global"),
            RateScope::Client => f.write_str("client"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Steady-state requests per minute across all clients. `0` disables the global bucket.
    pub global_rpm: f64,
    /// Steady-state requests per minute per client identity. `0` disables per-client buckets.
    pub client_rpm: f64,
    /// Bucket capacity multiplier over `rpm`.
    pub burst_factor: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rpm: 300.0,
            client_rpm: 150.0,
            burst_factor: 2.0,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_rpm(mut self, rpm: f64) -> Self {
        self.global_rpm = rpm;
        self
    }

    pub fn with_client_rpm(mut self, rpm: f64) -> Self {
        self.client_rpm = rpm;
        self
    }

    pub fn with_burst_factor(mut self, factor: f64) -> Self {
        self.burst_factor = factor;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketParams {
    capacity: f64,
    refill_per_sec: f64,
}

impl BucketParams {
    fn from_rpm(rpm: f64, burst_factor: f64) -> Option<Self> {
        if !rpm.is_finite() || rpm <= 0.0 {
            return None;
        }
        let burst = if burst_factor.is_finite() && burst_factor > 0.0 {
            burst_factor
        } else {
            1.0
        };
        Some(Self {
            capacity: (rpm * burst).max(1.0),
            refill_per_sec: rpm / 60.0,
        })
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    last_reject_log: Option<Instant>,
}

impl TokenBucket {
    /// New scopes start full so the first burst after idle time is never throttled.
    fn full(params: Option<BucketParams>, now: Instant) -> Self {
        Self {
            tokens: params.map(|p| p.capacity).unwrap_or(0.0),
            last_refill: now,
            last_seen: now,
            last_reject_log: None,
        }
    }

    fn refill(&mut self, p: &BucketParams, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * p.refill_per_sec).min(p.capacity);
            self.last_refill = now;
        }
    }

    fn wait_ms(&self, p: &BucketParams) -> u64 {
        let missing = (1.0 - self.tokens).max(0.0);
        ((missing / p.refill_per_sec) * 1000.0).ceil().max(1.0) as u64
    }

    fn should_log_reject(&mut self, now: Instant) -> bool {
        match self.last_reject_log {
            Some(at) if now.saturating_duration_since(at) < REJECT_LOG_INTERVAL => false,
            _ => {
                self.last_reject_log = Some(now);
                true
            }
        }
    }
}

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Reject { scope: RateScope, retry_after_ms: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub scope: RateScope,
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub tokens: f64,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Bucket arithmetic leaves no broken invariants behind a panic.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Token-bucket limiter over a global scope and one scope per client identity.
///
/// - Lazy refill on every call, no background timer
/// - A request consumes one token from both buckets, or from neither
/// - Per-bucket locks; unrelated clients never contend on each other's state
pub struct RateLimiter {
    global_params: Option<BucketParams>,
    client_params: Option<BucketParams>,
    global: Mutex<TokenBucket>,
    clients: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let global_params = BucketParams::from_rpm(cfg.global_rpm, cfg.burst_factor);
        let client_params = BucketParams::from_rpm(cfg.client_rpm, cfg.burst_factor);
        Self {
            global_params,
            client_params,
            global: Mutex::new(TokenBucket::full(global_params, Instant::now())),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn client_bucket(&self, client_id: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        {
            let map = self.clients.read().unwrap_or_else(|p| p.into_inner());
            if let Some(bucket) = map.get(client_id) {
                return Arc::clone(bucket);
            }
        }
        let mut map = self.clients.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            map.entry(client_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(self.client_params, now)))),
        )
    }

    /// Admit one request from `client_id`.
    pub fn admit(&self, client_id: &str) -> Admission {
        let now = Instant::now();
        let client = self
            .client_params
            .map(|_| self.client_bucket(client_id, now));

        // Lock order is always global then client.
        let mut global = lock(&self.global);
        let mut client_guard = client.as_ref().map(|c| lock(c));

        let global_wait = self.global_params.as_ref().and_then(|p| {
            global.refill(p, now);
            (global.tokens < 1.0).then(|| global.wait_ms(p))
        });
        let client_wait = match (&self.client_params, client_guard.as_mut()) {
            (Some(p), Some(bucket)) => {
                bucket.last_seen = now;
                bucket.refill(p, now);
                (bucket.tokens < 1.0).then(|| bucket.wait_ms(p))
            }
            _ => None,
        };

        // With both buckets empty, retry-after is the later of the two refills.
        let rejection = match (global_wait, client_wait) {
            (Some(g), Some(c)) if c > g => Some((RateScope::Client, c)),
            (Some(g), _) => Some((RateScope::Global, g)),
            (None, Some(c)) => Some((RateScope::Client, c)),
            (None, None) => None,
        };
        if let Some((scope, retry_after_ms)) = rejection {
            match scope {
                RateScope::Global => {
                    if global.should_log_reject(now) {
                        info!(retry_after_ms, "global rate limit exceeded");
                    }
                }
                RateScope::Client => {
                    if client_guard.as_mut().is_some_and(|b| b.should_log_reject(now)) {
                        info!(client = client_id, retry_after_ms, "client rate limit exceeded");
                    }
                }
            }
            return Admission::Reject {
                scope,
                retry_after_ms,
            };
        }

        if let (Some(_), Some(bucket)) = (&self.client_params, client_guard.as_mut()) {
            bucket.tokens -= 1.0;
        }
        if self.global_params.is_some() {
            global.tokens -= 1.0;
        }
        Admission::Allow
    }

    pub fn global_snapshot(&self) -> Option<RateLimiterSnapshot> {
        let p = self.global_params?;
        let mut st = lock(&self.global);
        st.refill(&p, Instant::now());
        Some(Self::snapshot_of(RateScope::Global, &p, &st))
    }

    /// Snapshot of a client bucket, if that client has been seen.
    pub fn client_snapshot(&self, client_id: &str) -> Option<RateLimiterSnapshot> {
        let p = self.client_params?;
        let bucket = {
            let map = self.clients.read().unwrap_or_else(|p| p.into_inner());
            map.get(client_id).cloned()?
        };
        let mut st = lock(&bucket);
        st.refill(&p, Instant::now());
        Some(Self::snapshot_of(RateScope::Client, &p, &st))
    }

    fn snapshot_of(scope: RateScope, p: &BucketParams, st: &TokenBucket) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            scope,
            capacity: p.capacity,
            refill_per_sec: p.refill_per_sec,
            tokens: st.tokens,
            estimated_wait_ms: (st.tokens < 1.0).then(|| st.wait_ms(p)),
        }
    }

    /// Number of client scopes currently tracked.
    pub fn scope_count(&self) -> usize {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drops client buckets that are full again and unused for `idle_for`.
    ///
    /// A dropped scope is recreated full on its next request, which is exactly
    /// the state it had, so pruning never changes admission decisions.
    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        let Some(p) = self.client_params else {
            return 0;
        };
        let now = Instant::now();
        let mut map = self.clients.write().unwrap_or_else(|p| p.into_inner());
        let before = map.len();
        map.retain(|_, bucket| {
            let mut st = lock(bucket);
            st.refill(&p, now);
            let idle = now.saturating_duration_since(st.last_seen) >= idle_for;
            !(idle && st.tokens >= p.capacity)
        });
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(global_rpm: f64, client_rpm: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(
            &RateLimitConfig::new()
                .with_global_rpm(global_rpm)
                .with_client_rpm(client_rpm)
                .with_burst_factor(burst),
        )
    }

    #[test]
    fn test_config_defaults() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.global_rpm, 300.0);
        assert_eq!(cfg.client_rpm, 150.0);
        assert_eq!(cfg.burst_factor, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_capacity_is_rpm_times_burst() {
        let rl = limiter(180.0, 150.0, 2.0);
        for i in 0..360 {
            assert!(rl.admit(&format!("client-{i}")).is_allowed(), "call {i} rejected");
        }
        match rl.admit("client-extra") {
            Admission::Reject {
                scope,
                retry_after_ms,
            } => {
                assert_eq!(scope, RateScope::Global);
                assert!(retry_after_ms > 0);
            }
            Admission::Allow => panic!("361st call within the minute must be rejected"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_bucket_rejects_independently() {
        let rl = limiter(1000.0, 3.0, 1.0);
        for _ in 0..3 {
            assert!(rl.admit("10.0.0.1").is_allowed());
        }
        assert!(matches!(
            rl.admit("10.0.0.1"),
            Admission::Reject {
                scope: RateScope::Client,
                ..
            }
        ));
        // Another client still has a full bucket
        assert!(rl.admit("10.0.0.2").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_consume_global_token() {
        let rl = limiter(60.0, 1.0, 1.0);
        assert!(rl.admit("a").is_allowed());
        let before = rl.global_snapshot().unwrap().tokens;
        assert!(!rl.admit("a").is_allowed());
        let after = rl.global_snapshot().unwrap().tokens;
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_buckets_empty_reports_longer_wait() {
        // Global refills 1 token/s, client 1 token per 10 s.
        let rl = limiter(60.0, 6.0, 1.0);
        for _ in 0..6 {
            assert!(rl.admit("slow").is_allowed());
        }
        for i in 0..54 {
            assert!(rl.admit(&format!("other-{i}")).is_allowed());
        }

        assert_eq!(
            rl.admit("slow"),
            Admission::Reject {
                scope: RateScope::Client,
                retry_after_ms: 10_000,
            }
        );
        assert_eq!(
            rl.admit("fresh"),
            Admission::Reject {
                scope: RateScope::Global,
                retry_after_ms: 1_000,
            }
        );

        // Waiting out only the global refill is not enough for "slow".
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(matches!(
            rl.admit("slow"),
            Admission::Reject {
                scope: RateScope::Client,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_wait() {
        // 60 rpm = 1 token per second
        let rl = limiter(60.0, 0.0, 1.0);
        let mut allowed = 0;
        while rl.admit("x").is_allowed() {
            allowed += 1;
        }
        assert_eq!(allowed, 60);

        let Admission::Reject { retry_after_ms, .. } = rl.admit("x") else {
            panic!("bucket should be empty");
        };
        assert!(retry_after_ms <= 1000);

        tokio::time::advance(Duration::from_millis(retry_after_ms)).await;
        assert!(rl.admit("x").is_allowed());
        assert!(!rl.admit("x").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_negative() {
        let rl = limiter(10.0, 10.0, 2.0);
        let mut allowed = 0;
        for _ in 0..100 {
            if rl.admit("same").is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
        assert!(rl.global_snapshot().unwrap().tokens >= 0.0);
        assert!(rl.client_snapshot("same").unwrap().tokens >= 0.0);
    }

    #[test]
    fn test_zero_rpm_disables_scope() {
        let rl = limiter(0.0, 0.0, 2.0);
        for _ in 0..10_000 {
            assert!(rl.admit("anyone").is_allowed());
        }
        assert!(rl.global_snapshot().is_none());
        assert_eq!(rl.scope_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_only_drops_full_buckets() {
        let rl = limiter(0.0, 60.0, 1.0);
        rl.admit("busy");
        rl.admit("idle");
        assert_eq!(rl.scope_count(), 2);

        // Nothing is idle long enough yet
        assert_eq!(rl.prune_idle(Duration::from_secs(120)), 0);

        tokio::time::advance(Duration::from_secs(200)).await;
        rl.admit("busy");
        assert_eq!(rl.prune_idle(Duration::from_secs(120)), 1);
        assert!(rl.client_snapshot("idle").is_none());
        assert!(rl.client_snapshot("busy").is_some());
    }

    #[test]
    fn test_concurrent_admits_do_not_lose_updates() {
        use std::thread;

        let rl = Arc::new(limiter(0.0, 50.0, 1.0));
        let mut handles = vec![];
        for _ in 0..8 {
            let rl = Arc::clone(&rl);
            handles.push(thread::spawn(move || {
                (0..20).filter(|_| rl.admit("shared").is_allowed()).count()
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 50 tokens; a few may refill during the run but never far above capacity
        assert!((50..=52).contains(&total), "admitted {total}");
    }
}
