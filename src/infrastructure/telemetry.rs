use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// External consumer of pipeline counters and histograms.
pub trait TelemetrySink: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value_ms: f64);
}

/// Sink that drops everything; used when no exporter is wired in.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_counter(&self, _name: &str, _value: u64) {}
    fn record_histogram(&self, _name: &str, _value_ms: f64) {}
}

/// Upper bounds (milliseconds) of the latency histogram buckets; the last
/// bucket is open-ended.
const LATENCY_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1000, 5000];

/// In-process pipeline metrics.
///
/// Counters are plain atomics so the hot path never takes a lock; a
/// snapshot can be pushed to a [`TelemetrySink`] or serialized directly.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub admitted: AtomicU64,
    pub rejected_rate_limit: AtomicU64,
    pub rejected_validation: AtomicU64,
    pub rejected_security: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub alerts_emitted: AtomicU64,
    pub correlation_groups: AtomicU64,
    latency_buckets: [AtomicU64; 9],
    latency_total_ms: AtomicU64,
    latency_count: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let total = self.latency_total_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_rate_limit: self.rejected_rate_limit.load(Ordering::Relaxed),
            rejected_validation: self.rejected_validation.load(Ordering::Relaxed),
            rejected_security: self.rejected_security.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            correlation_groups: self.correlation_groups.load(Ordering::Relaxed),
            latency_buckets: self
                .latency_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            average_latency_ms: if count > 0 {
                total as f64 / count as f64
            } else {
                0.0
            },
        }
    }

    /// Push current counters to an external sink.
    pub fn publish(&self, sink: &dyn TelemetrySink) {
        let snap = self.snapshot();
        sink.record_counter("pipeline.admitted", snap.admitted);
        sink.record_counter("pipeline.rejected.rate_limit", snap.rejected_rate_limit);
        sink.record_counter("pipeline.rejected.validation", snap.rejected_validation);
        sink.record_counter("pipeline.rejected.security", snap.rejected_security);
        sink.record_counter("pipeline.processed", snap.processed);
        sink.record_counter("pipeline.failed", snap.failed);
        sink.record_counter("pipeline.retried", snap.retried);
        sink.record_counter("pipeline.alerts_emitted", snap.alerts_emitted);
        sink.record_histogram("pipeline.latency_ms.avg", snap.average_latency_ms);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rejected_rate_limit: u64,
    pub rejected_validation: u64,
    pub rejected_security: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub alerts_emitted: u64,
    pub correlation_groups: u64,
    pub latency_buckets: Vec<u64>,
    pub average_latency_ms: f64,
}
