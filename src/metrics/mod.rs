//! Call-attempt metrics and error statistics.
//!
//! Every upstream attempt produces one [`CallAttemptRecord`]. Records land in
//! a fixed-capacity ring buffer per operation class; summaries are recomputed
//! from the buffers on read. Requests turned away before reaching the
//! upstream (auth, rate limit, payload, circuit fast-fail) are counted
//! separately as rejections.

mod sink;

pub use sink::{AttemptSink, InMemoryAttemptSink, JsonlAttemptSink, NoopAttemptSink};

use crate::error::ErrorKind;
use crate::error_code::StandardErrorCode;
use crate::upstream::OpClass;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ring buffer capacity per operation class.
    pub capacity: usize,
    /// Latency target per operation class, in ms.
    pub latency_targets_ms: HashMap<String, u64>,
    /// Append every attempt as one JSON line to this file.
    pub jsonl_path: Option<std::path::PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let latency_targets_ms = [("stt", 120), ("tts", 120), ("chain", 250)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            capacity: 1_000,
            latency_targets_ms,
            jsonl_path: None,
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_latency_target(mut self, op_class: impl Into<String>, ms: u64) -> Self {
        self.latency_targets_ms.insert(op_class.into(), ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One upstream attempt, as seen by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttemptRecord {
    /// Shared by all attempts of one `execute` call.
    pub request_id: Uuid,
    pub op_class: OpClass,
    /// 1-based.
    pub attempt_number: u32,
    /// Wall-clock start, ms since the Unix epoch.
    pub started_at_ms: u64,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StandardErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl CallAttemptRecord {
    pub fn is_failure(&self) -> bool {
        self.outcome == AttemptOutcome::Failure
    }
}

/// Latency quantiles in ms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyQuantiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OpClassSummary {
    pub count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub avg_latency_ms: f64,
    pub latency: LatencyQuantiles,
    pub latency_target_ms: Option<u64>,
    /// Share of attempts slower than the target, in percent.
    pub over_budget_pct: Option<f64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Attempts currently held across all ring buffers.
    pub count: usize,
    pub avg_latency_ms_by_op_class: BTreeMap<String, f64>,
    /// Upstream error classification across all op classes.
    pub error_counts_by_kind: BTreeMap<String, u64>,
    pub op_classes: BTreeMap<String, OpClassSummary>,
    /// Requests rejected before reaching the upstream, by gateway error kind.
    pub rejections: BTreeMap<String, u64>,
}

/// Linear-interpolated quantile over a sorted slice.
fn quantile(sorted: &[u64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0] as f64,
        n => {
            let pos = (n - 1) as f64 * q.clamp(0.0, 1.0);
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac
        }
    }
}

type Window = Arc<Mutex<VecDeque<CallAttemptRecord>>>;

fn lock_window(w: &Window) -> MutexGuard<'_, VecDeque<CallAttemptRecord>> {
    w.lock().unwrap_or_else(|p| p.into_inner())
}

/// Bounded per-operation-class attempt history.
pub struct MetricsAggregator {
    capacity: usize,
    targets: HashMap<String, u64>,
    windows: RwLock<HashMap<OpClass, Window>>,
    rejections: Mutex<BTreeMap<ErrorKind, u64>>,
}

impl MetricsAggregator {
    pub fn new(cfg: &MetricsConfig) -> Self {
        Self {
            capacity: cfg.capacity.max(1),
            targets: cfg.latency_targets_ms.clone(),
            windows: RwLock::new(HashMap::new()),
            rejections: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn window(&self, op_class: &OpClass) -> Window {
        {
            let map = self.windows.read().unwrap_or_else(|p| p.into_inner());
            if let Some(w) = map.get(op_class) {
                return Arc::clone(w);
            }
        }
        let mut map = self.windows.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            map.entry(op_class.clone())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.capacity)))),
        )
    }

    fn windows(&self) -> Vec<(OpClass, Window)> {
        self.windows
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Append one attempt, evicting the oldest when full. Never fails.
    pub fn record(&self, record: CallAttemptRecord) {
        let window = self.window(&record.op_class);
        let mut buf = lock_window(&window);
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(record);
    }

    /// Count a request turned away before it reached the upstream.
    pub fn record_rejection(&self, kind: ErrorKind) {
        let mut r = self.rejections.lock().unwrap_or_else(|p| p.into_inner());
        *r.entry(kind).or_insert(0) += 1;
    }

    pub fn rejections(&self) -> BTreeMap<ErrorKind, u64> {
        self.rejections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn summarize(&self, op_class: &OpClass, records: &[CallAttemptRecord]) -> OpClassSummary {
        let count = records.len();
        let failure_count = records.iter().filter(|r| r.is_failure()).count();
        let mut latencies: Vec<u64> = records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();
        let avg_latency_ms = if count == 0 {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / count as f64
        };

        let latency_target_ms = self.targets.get(op_class.as_str()).copied();
        let over_budget_pct = latency_target_ms.filter(|_| count > 0).map(|target| {
            let over = latencies.iter().filter(|l| **l > target).count();
            over as f64 * 100.0 / count as f64
        });

        let mut error_counts = BTreeMap::new();
        for code in records.iter().filter_map(|r| r.error_kind) {
            *error_counts.entry(code.name().to_string()).or_insert(0) += 1;
        }

        OpClassSummary {
            count,
            success_count: count - failure_count,
            failure_count,
            avg_latency_ms,
            latency: LatencyQuantiles {
                p50: quantile(&latencies, 0.50),
                p90: quantile(&latencies, 0.90),
                p95: quantile(&latencies, 0.95),
                p99: quantile(&latencies, 0.99),
            },
            latency_target_ms,
            over_budget_pct,
            error_counts,
        }
    }

    pub fn op_class_summary(&self, op_class: &OpClass) -> OpClassSummary {
        let window = self
            .windows
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(op_class)
            .cloned();
        let records: Vec<CallAttemptRecord> = window
            .map(|w| lock_window(&w).iter().cloned().collect())
            .unwrap_or_default();
        self.summarize(op_class, &records)
    }

    /// Recomputed from the ring buffers on every call.
    pub fn summary(&self) -> MetricsSummary {
        let mut out = MetricsSummary::default();
        for (op_class, window) in self.windows() {
            let records: Vec<CallAttemptRecord> = lock_window(&window).iter().cloned().collect();
            let s = self.summarize(&op_class, &records);
            out.count += s.count;
            out.avg_latency_ms_by_op_class
                .insert(op_class.to_string(), s.avg_latency_ms);
            for (code, n) in &s.error_counts {
                *out.error_counts_by_kind.entry(code.clone()).or_insert(0) += n;
            }
            out.op_classes.insert(op_class.to_string(), s);
        }
        out.rejections = self
            .rejections()
            .into_iter()
            .map(|(k, v)| (k.as_str().to_string(), v))
            .collect();
        out
    }

    fn newest(&self, n: usize, only_failures: bool) -> Vec<CallAttemptRecord> {
        let mut all: Vec<CallAttemptRecord> = self
            .windows()
            .into_iter()
            .flat_map(|(_, w)| {
                lock_window(&w)
                    .iter()
                    .filter(|r| !only_failures || r.is_failure())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by(|a, b| {
            b.started_at_ms
                .cmp(&a.started_at_ms)
                .then(b.attempt_number.cmp(&a.attempt_number))
        });
        all.truncate(n);
        all
    }

    /// Newest `n` attempts across all op classes, newest first.
    pub fn last(&self, n: usize) -> Vec<CallAttemptRecord> {
        self.newest(n, false)
    }

    /// Newest `n` failed attempts, newest first.
    pub fn recent_errors(&self, n: usize) -> Vec<CallAttemptRecord> {
        self.newest(n, true)
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}
