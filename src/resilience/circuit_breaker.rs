use crate::upstream::OpClass;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Retry hint given to callers turned away while a probe is in flight.
const PROBE_BUSY_RETRY_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the observation window at which the circuit opens.
    pub failure_ratio: f64,
    /// Number of most recent call outcomes kept per operation class.
    pub window_size: usize,
    /// Minimum outcomes observed before the ratio is evaluated.
    pub min_samples: usize,
    /// Time spent open before a probe is allowed.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            window_size: 20,
            min_samples: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn with_window_size(mut self, n: usize) -> Self {
        self.window_size = n;
        self
    }

    pub fn with_min_samples(mut self, n: usize) -> Self {
        self.min_samples = n;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Health-relevant result of one gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Transient upstream failure (network, 5xx, timeout).
    Failure,
    /// Upstream answered but refused the request (4xx). Proves reachability.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailFastReason {
    Open,
    ProbeInFlight,
}

/// Result of [`CircuitBreaker::before_call`].
#[derive(Debug)]
pub enum CallDecision {
    Proceed(CallPermit),
    FailFast {
        reason: FailFastReason,
        retry_after_ms: u64,
    },
}

/// Admission token for one call. Hand it back through [`CircuitBreaker::after_call`].
///
/// Dropping a probe permit without reporting re-opens the circuit, so a
/// cancelled probe never leaves the breaker stuck in `HalfOpen`.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Shorthand for `after_call` on the breaker that issued this permit.
    pub fn report(self, outcome: CallOutcome) {
        let breaker = Arc::clone(&self.breaker);
        breaker.after_call(self, outcome);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.abandon_probe();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub op_class: OpClass,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub failure_ratio: f64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub probe_in_flight: bool,
    pub last_probe_succeeded: Option<bool>,
    pub times_opened: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// `true` marks a failure.
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_probe_succeeded: Option<bool>,
    times_opened: u64,
}

impl Inner {
    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|f| **f).count()
    }

    fn ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.outcomes.len() as f64
        }
    }
}

/// Circuit breaker for one operation class.
///
/// - Closed: outcomes feed a sliding window; opens once `min_samples` are seen
///   and the failure ratio reaches `failure_ratio`
/// - Open: every call fails fast until `cooldown` elapses
/// - HalfOpen: exactly one probe; its result closes or re-opens the circuit
#[derive(Debug)]
pub struct CircuitBreaker {
    op_class: OpClass,
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(op_class: OpClass, cfg: CircuitBreakerConfig) -> Self {
        let window = cfg.window_size.max(1);
        Self {
            op_class,
            cfg,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(window),
                opened_at: None,
                probe_in_flight: false,
                last_probe_succeeded: None,
                times_opened: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn op_class(&self) -> &OpClass {
        &self.op_class
    }

    fn open_remaining(&self, st: &Inner, now: Instant) -> Duration {
        let opened = st.opened_at.unwrap_or(now);
        self.cfg
            .cooldown()
            .saturating_sub(now.saturating_duration_since(opened))
    }

    fn transition(&self, st: &mut Inner, to: CircuitState) {
        if st.state == to {
            return;
        }
        info!(
            op_class = %self.op_class,
            from = %st.state,
            to = %to,
            failure_ratio = st.ratio(),
            "circuit transitioned"
        );
        st.state = to;
    }

    fn open(&self, st: &mut Inner, now: Instant) {
        self.transition(st, CircuitState::Open);
        st.opened_at = Some(now);
        st.probe_in_flight = false;
        st.times_opened += 1;
    }

    /// Decide whether a call may reach the upstream.
    pub fn before_call(self: &Arc<Self>) -> CallDecision {
        let now = Instant::now();
        let mut st = self.lock();

        if st.state == CircuitState::Open {
            let remaining = self.open_remaining(&st, now);
            if !remaining.is_zero() {
                return CallDecision::FailFast {
                    reason: FailFastReason::Open,
                    retry_after_ms: (remaining.as_millis() as u64).max(1),
                };
            }
            self.transition(&mut st, CircuitState::HalfOpen);
            st.probe_in_flight = false;
        }

        let probe = st.state == CircuitState::HalfOpen;
        if probe {
            if st.probe_in_flight {
                return CallDecision::FailFast {
                    reason: FailFastReason::ProbeInFlight,
                    retry_after_ms: PROBE_BUSY_RETRY_MS,
                };
            }
            st.probe_in_flight = true;
        }

        CallDecision::Proceed(CallPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    /// Report the final outcome of a call admitted by `before_call`.
    pub fn after_call(&self, mut permit: CallPermit, outcome: CallOutcome) {
        permit.settled = true;
        let now = Instant::now();
        let mut st = self.lock();
        let failed = outcome == CallOutcome::Failure;

        if permit.probe {
            st.probe_in_flight = false;
            st.last_probe_succeeded = Some(!failed);
            if failed {
                self.open(&mut st, now);
            } else {
                self.transition(&mut st, CircuitState::Closed);
                st.outcomes.clear();
                st.opened_at = None;
            }
            return;
        }

        // Calls admitted while closed may finish after another caller opened
        // the circuit; their outcome no longer says anything new.
        if st.state != CircuitState::Closed {
            return;
        }

        if st.outcomes.len() >= self.cfg.window_size.max(1) {
            st.outcomes.pop_front();
        }
        st.outcomes.push_back(failed);

        if st.outcomes.len() >= self.cfg.min_samples.max(1) && st.ratio() >= self.cfg.failure_ratio {
            self.open(&mut st, now);
        }
    }

    fn abandon_probe(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen && st.probe_in_flight {
            info!(op_class = %self.op_class, "probe abandoned before completion");
            self.open(&mut st, Instant::now());
        }
    }

    /// Current state, counting an expired cool-down as `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let st = self.lock();
        if st.state == CircuitState::Open && self.open_remaining(&st, Instant::now()).is_zero() {
            CircuitState::HalfOpen
        } else {
            st.state
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let remaining = (st.state == CircuitState::Open)
            .then(|| self.open_remaining(&st, now))
            .filter(|d| !d.is_zero());
        let failure_count = st.failures();
        CircuitSnapshot {
            op_class: self.op_class.clone(),
            state: if st.state == CircuitState::Open && remaining.is_none() {
                CircuitState::HalfOpen
            } else {
                st.state
            },
            failure_count,
            success_count: st.outcomes.len() - failure_count,
            failure_ratio: st.ratio(),
            open_remaining_ms: remaining.map(|d| d.as_millis() as u64),
            probe_in_flight: st.probe_in_flight,
            last_probe_succeeded: st.last_probe_succeeded,
            times_opened: st.times_opened,
        }
    }
}

/// Process-wide breakers, one per operation class, created on first use.
pub struct CircuitBreakerRegistry {
    cfg: CircuitBreakerConfig,
    breakers: RwLock<HashMap<OpClass, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, op_class: &OpClass) -> Arc<CircuitBreaker> {
        {
            let map = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(b) = map.get(op_class) {
                return Arc::clone(b);
            }
        }
        let mut map = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(op_class.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(op_class.clone(), self.cfg.clone()))
        }))
    }

    pub fn before_call(&self, op_class: &OpClass) -> CallDecision {
        self.get(op_class).before_call()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut out: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.op_class.cmp(&b.op_class));
        out
    }
}
