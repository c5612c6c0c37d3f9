//! Process-wide pipeline counters.
//!
//! Counters are plain atomics bumped from any stage; a periodic reporter task
//! emits a structured snapshot through `tracing` so operators can scrape the
//! log stream. Nothing here is load-bearing: dropping a metric is never an
//! error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared counter set for one pipeline process.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Results dropped by the gate's rate-limit windows.
    pub rate_limited_results: AtomicU64,
    /// Malformed upstream events dropped at ingest.
    pub malformed_events: AtomicU64,
    /// Buffered entries forwarded as orphans.
    pub orphaned_results: AtomicU64,
    /// Entries flushed by buffer capacity pressure.
    pub capacity_flushes: AtomicU64,
    /// Utterances suppressed by the dedup window.
    pub dedup_suppressed: AtomicU64,
    /// Emergency full clears of the dedup set.
    pub dedup_clears: AtomicU64,
    /// Translation cache hits.
    pub cache_hits: AtomicU64,
    /// Translation cache misses.
    pub cache_misses: AtomicU64,
    /// Translation cache evictions.
    pub cache_evictions: AtomicU64,
    /// Per-language translation failures (timeouts included).
    pub translate_failures: AtomicU64,
    /// Per-language synthesis failures (timeouts included).
    pub synthesize_failures: AtomicU64,
    /// Plain-text fallbacks after SSML rejection.
    pub ssml_fallbacks: AtomicU64,
    /// Dynamics extractions that fell back to defaults.
    pub dynamics_fallbacks: AtomicU64,
    /// Audio chunks dropped by listener buffer overflow.
    pub audio_overflow_drops: AtomicU64,
    /// Listeners removed after a gone connection.
    pub listeners_gone: AtomicU64,
    /// Utterances emitted by all gates.
    pub utterances_emitted: AtomicU64,
}

impl PipelineMetrics {
    /// Create a fresh counter set behind an `Arc`.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Cache hit rate in percent over the lifetime of the process.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }

    /// Emit one structured snapshot of every counter.
    pub fn emit_snapshot(&self) {
        info!(
            rate_limited = self.rate_limited_results.load(Ordering::Relaxed),
            malformed = self.malformed_events.load(Ordering::Relaxed),
            orphaned = self.orphaned_results.load(Ordering::Relaxed),
            capacity_flushes = self.capacity_flushes.load(Ordering::Relaxed),
            dedup_suppressed = self.dedup_suppressed.load(Ordering::Relaxed),
            dedup_clears = self.dedup_clears.load(Ordering::Relaxed),
            cache_hits = self.cache_hits.load(Ordering::Relaxed),
            cache_misses = self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate_pct = self.cache_hit_rate(),
            cache_evictions = self.cache_evictions.load(Ordering::Relaxed),
            translate_failures = self.translate_failures.load(Ordering::Relaxed),
            synthesize_failures = self.synthesize_failures.load(Ordering::Relaxed),
            ssml_fallbacks = self.ssml_fallbacks.load(Ordering::Relaxed),
            dynamics_fallbacks = self.dynamics_fallbacks.load(Ordering::Relaxed),
            audio_overflow_drops = self.audio_overflow_drops.load(Ordering::Relaxed),
            listeners_gone = self.listeners_gone.load(Ordering::Relaxed),
            utterances_emitted = self.utterances_emitted.load(Ordering::Relaxed),
            "pipeline metrics snapshot"
        );
    }
}

/// Periodically emit metric snapshots until cancelled.
pub async fn run_metrics_reporter(
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => metrics.emit_snapshot(),
        }
    }
}
