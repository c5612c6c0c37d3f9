//! Partial-result gate: turns a noisy stream of (possibly retracted)
//! recognition results into a minimal, ordered sequence of stable utterances.
//!
//! The gate is a pure state machine — callers feed it events and timestamps
//! (`handle_event`, `poll`) and receive zero or more utterances back; it
//! never reads the wall clock itself, so tests can drive it deterministically.
//!
//! Processing stages, in order: window rate limiting, stability filtering,
//! buffering with replace-on-id, sentence boundary detection, and
//! fingerprint deduplication. Forwarding is terminal per result id.

pub mod boundary;
pub mod buffer;
pub mod dedup;
pub mod rate_limit;

use crate::config::{DedupConfig, GateConfig};
use crate::metrics::PipelineMetrics;
use crate::pipeline::messages::Utterance;
use crate::transcript::{RecognitionResult, TranscriptEvent};
use boundary::SentenceBoundaryDetector;
use buffer::{BufferedResult, ResultBuffer};
use dedup::DedupCache;
use rate_limit::WindowLimiter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-session gating engine.
pub struct PartialResultGate {
    config: GateConfig,
    limiter: WindowLimiter,
    buffer: ResultBuffer,
    boundary: SentenceBoundaryDetector,
    dedup: DedupCache,
    metrics: Arc<PipelineMetrics>,
    synced_drops: u64,
}

impl PartialResultGate {
    /// Create a gate for one session.
    #[must_use]
    pub fn new(
        config: GateConfig,
        dedup_config: &DedupConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        // The window length and per-second cap express the same bound; honor
        // the stricter of the two.
        let from_cap = if config.rate_limit_max_per_second > 0 {
            Duration::from_millis(1000 / u64::from(config.rate_limit_max_per_second))
        } else {
            Duration::from_millis(config.rate_limit_window_ms)
        };
        let window = from_cap.max(Duration::from_millis(config.rate_limit_window_ms));

        Self {
            limiter: WindowLimiter::new(window),
            buffer: ResultBuffer::new(config.max_buffered_words()),
            boundary: SentenceBoundaryDetector::new(
                Duration::from_secs(config.pause_threshold_secs),
                Duration::from_secs(config.buffer_forward_timeout_secs),
            ),
            dedup: DedupCache::new(
                Duration::from_secs(dedup_config.ttl_secs),
                dedup_config.max_entries,
            ),
            config,
            metrics,
            synced_drops: 0,
        }
    }

    /// Feed one transcript event at `now`.
    ///
    /// Finals bypass the rate limiter (they are terminal and must forward);
    /// partials join the current window and may release the previous
    /// window's representative.
    pub fn handle_event(&mut self, event: TranscriptEvent, now: Instant) -> Vec<Utterance> {
        let mut out = match event {
            TranscriptEvent::Final(result) => self.apply_final(result, now),
            TranscriptEvent::Partial(result) => {
                match self.limiter.offer(result, now) {
                    Some(released) => self.admit(released, now),
                    None => Vec::new(),
                }
            }
        };
        self.sync_drop_metric();
        sort_utterances(&mut out);
        out
    }

    /// Advance time-driven state at `now`: closes a rate window whose
    /// boundary passed, forwards orphans, and applies opportunistic sentence
    /// boundaries (pause and buffer-timeout).
    pub fn poll(&mut self, now: Instant) -> Vec<Utterance> {
        let mut out = Vec::new();

        if let Some(released) = self.limiter.poll(now) {
            out.extend(self.admit(released, now));
        }

        // Orphans: buffered past the timeout without a final — treat as if a
        // final had arrived.
        let orphan_timeout = Duration::from_secs(self.config.orphan_timeout_secs);
        for id in self.buffer.orphans(orphan_timeout, now) {
            PipelineMetrics::incr(&self.metrics.orphaned_results);
            debug!(result_id = %id, "forwarding orphaned result");
            out.extend(self.forward(&id, now));
        }

        out.extend(self.forward_ready(now));

        self.buffer.prune_forwarded(orphan_timeout, now);
        self.sync_drop_metric();
        sort_utterances(&mut out);
        out
    }

    /// Terminate the session's stream: flush the open rate window and take
    /// one last greedy boundary pass.
    pub fn finish(&mut self, now: Instant) -> Vec<Utterance> {
        let mut out = Vec::new();
        if let Some(released) = self.limiter.flush() {
            out.extend(self.admit(released, now));
        }
        out.extend(self.forward_ready(now));
        self.sync_drop_metric();
        sort_utterances(&mut out);
        out
    }

    /// Words currently buffered (capacity gauge).
    #[must_use]
    pub fn buffered_words(&self) -> usize {
        self.buffer.word_total()
    }

    /// A final forwards unconditionally and terminates its id.
    fn apply_final(&mut self, result: RecognitionResult, now: Instant) -> Vec<Utterance> {
        let id = result.result_id.clone();
        if self.buffer.is_forwarded(&id) {
            // Already emitted as a partial; the final only closes the id.
            self.buffer.remove(&id);
            return Vec::new();
        }

        let flushed = self.buffer.upsert(result, now);
        let mut out = self.emit_flushed(flushed, now);
        out.extend(self.forward(&id, now));
        out
    }

    /// A rate-released partial: buffer it, then forward if both the
    /// stability filter and a boundary condition pass.
    fn admit(&mut self, result: RecognitionResult, now: Instant) -> Vec<Utterance> {
        let id = result.result_id.clone();
        if self.buffer.is_forwarded(&id) {
            return Vec::new();
        }

        let flushed = self.buffer.upsert(result, now);
        let mut out = self.emit_flushed(flushed, now);

        let ready = self.buffer.get(&id).is_some_and(|entry| {
            self.is_eligible(entry, now)
                && self
                    .boundary
                    .is_boundary(&entry.result.text, entry.added_at, false, now)
        });
        if ready {
            out.extend(self.forward(&id, now));
        }
        out
    }

    /// Forward every eligible entry that meets a boundary condition.
    ///
    /// Candidates are collected before any forward so the pause condition is
    /// evaluated against a single snapshot of `last_forward`.
    fn forward_ready(&mut self, now: Instant) -> Vec<Utterance> {
        let candidates: Vec<String> = self
            .buffer
            .pending()
            .iter()
            .filter(|entry| {
                self.is_eligible(entry, now)
                    && self
                        .boundary
                        .is_boundary(&entry.result.text, entry.added_at, false, now)
            })
            .map(|entry| entry.result.result_id.clone())
            .collect();

        let mut out = Vec::new();
        for id in candidates {
            out.extend(self.forward(&id, now));
        }
        out
    }

    /// Stability filter: a scored result needs `score ≥ threshold`; a
    /// score-less result becomes eligible after the blind timeout.
    fn is_eligible(&self, entry: &BufferedResult, now: Instant) -> bool {
        match entry.result.stability_score {
            Some(score) => score >= self.config.stability_threshold,
            None => {
                now.duration_since(entry.added_at)
                    >= Duration::from_secs(self.config.blind_timeout_secs)
            }
        }
    }

    /// Mark an id forwarded and emit its utterance unless deduplicated.
    fn forward(&mut self, result_id: &str, now: Instant) -> Option<Utterance> {
        let entry = self.buffer.get(result_id)?;
        if entry.forwarded {
            return None;
        }
        let result = entry.result.clone();

        self.buffer.mark_forwarded(result_id);
        self.boundary.record_forward(now);
        self.emit(result, now)
    }

    /// Capacity-flushed entries were already marked forwarded by the buffer;
    /// they still pass through dedup on their way out.
    fn emit_flushed(&mut self, flushed: Vec<BufferedResult>, now: Instant) -> Vec<Utterance> {
        let mut out = Vec::new();
        for entry in flushed {
            PipelineMetrics::incr(&self.metrics.capacity_flushes);
            self.boundary.record_forward(now);
            out.extend(self.emit(entry.result, now));
        }
        out
    }

    fn emit(&mut self, result: RecognitionResult, now: Instant) -> Option<Utterance> {
        let cleared_before = self.dedup.cleared_count();
        if !self.dedup.check_and_insert(&result.text, now) {
            PipelineMetrics::incr(&self.metrics.dedup_suppressed);
            return None;
        }
        if self.dedup.cleared_count() > cleared_before {
            PipelineMetrics::incr(&self.metrics.dedup_clears);
        }

        PipelineMetrics::incr(&self.metrics.utterances_emitted);
        Some(Utterance::new(
            result.session_id,
            result.source_language,
            result.text,
            result.start_time,
            result.end_time,
            now,
        ))
    }

    fn sync_drop_metric(&mut self) {
        let dropped = self.limiter.dropped_count();
        if dropped > self.synced_drops {
            PipelineMetrics::add(&self.metrics.rate_limited_results, dropped - self.synced_drops);
            self.synced_drops = dropped;
        }
    }
}

fn sort_utterances(utterances: &mut [Utterance]) {
    utterances.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::transcript::RecognitionResult;
    use std::sync::atomic::Ordering;

    fn gate() -> PartialResultGate {
        PartialResultGate::new(
            GateConfig::default(),
            &DedupConfig::default(),
            PipelineMetrics::new(),
        )
    }

    fn gate_with_metrics() -> (PartialResultGate, Arc<PipelineMetrics>) {
        let metrics = PipelineMetrics::new();
        (
            PartialResultGate::new(
                GateConfig::default(),
                &DedupConfig::default(),
                Arc::clone(&metrics),
            ),
            metrics,
        )
    }

    fn result(id: &str, text: &str, score: Option<f64>, start: f64, arrival: Instant) -> RecognitionResult {
        RecognitionResult {
            result_id: id.to_owned(),
            session_id: "s1".to_owned(),
            source_language: "en".to_owned(),
            text: text.to_owned(),
            stability_score: score,
            start_time: start,
            end_time: None,
            arrival,
        }
    }

    fn partial(id: &str, text: &str, score: Option<f64>, start: f64, at: Instant) -> TranscriptEvent {
        TranscriptEvent::Partial(result(id, text, score, start, at))
    }

    fn final_event(id: &str, text: &str, start: f64, at: Instant) -> TranscriptEvent {
        TranscriptEvent::Final(result(id, text, Some(1.0), start, at))
    }

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn happy_path_partials_then_final_emit_once() {
        let mut g = gate();
        let t0 = Instant::now();

        // Three partials with rising stability, spaced past the rate window.
        let mut emitted = Vec::new();
        emitted.extend(g.handle_event(partial("r1", "hello", Some(0.3), 0.0, t0), t0));
        let t1 = t0 + 250 * MS;
        emitted.extend(g.handle_event(partial("r1", "hello every", Some(0.6), 0.0, t1), t1));
        let t2 = t0 + 500 * MS;
        emitted.extend(g.handle_event(partial("r1", "hello everyone", Some(0.9), 0.0, t2), t2));
        let t3 = t0 + 750 * MS;
        emitted.extend(g.handle_event(final_event("r1", "hello everyone", 0.0, t3), t3));

        // The 0.9 partial has no sentence boundary (no punctuation, no pause
        // reference, not aged), so only the final emits.
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].text, "hello everyone");
    }

    #[test]
    fn final_after_forward_does_not_duplicate() {
        let mut g = gate();
        let t0 = Instant::now();
        let out = g.handle_event(final_event("r1", "First sentence.", 0.0, t0), t0);
        assert_eq!(out.len(), 1);

        // A (spurious) second final for the same id is a no-op — but here the
        // id was removed; a final for an already-forwarded partial id.
        let t1 = t0 + 300 * MS;
        let _ = g.handle_event(partial("r2", "Second sentence.", Some(0.9), 1.0, t1), t1);
        let t2 = t1 + 300 * MS;
        let out = g.handle_event(partial("r3", "ignored", Some(0.1), 2.0, t2), t2);
        // r2 released from the window and forwarded on punctuation.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Second sentence.");

        let t3 = t2 + 300 * MS;
        let out = g.handle_event(final_event("r2", "Second sentence.", 1.0, t3), t3);
        assert!(out.is_empty(), "final for forwarded id must not re-emit");
    }

    #[test]
    fn high_stability_with_punctuation_forwards_on_release() {
        let mut g = gate();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "Hello everyone.", Some(0.9), 0.0, t0), t0);
        // Window closes: the buffered partial is released, stability passes,
        // punctuation is a boundary.
        let out = g.poll(t0 + 200 * MS);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Hello everyone.");
    }

    #[test]
    fn low_stability_is_retained() {
        let mut g = gate();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "Maybe this.", Some(0.2), 0.0, t0), t0);
        let out = g.poll(t0 + 200 * MS);
        assert!(out.is_empty(), "low-stability partial must stay buffered");
        // A better variant arrives and passes.
        let t1 = t0 + 400 * MS;
        let _ = g.handle_event(partial("r1", "Definitely this.", Some(0.95), 0.0, t1), t1);
        let out = g.poll(t1 + 200 * MS);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Definitely this.");
    }

    #[test]
    fn blind_timeout_then_pause_forwards_scoreless_partial() {
        // A score-less partial, never superseded, no final.
        let mut g = gate();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "no score here", None, 0.0, t0), t0);

        // Released at the window close but not yet eligible (< 3 s).
        assert!(g.poll(t0 + 200 * MS).is_empty());
        // Blind-eligible after 3 s in the buffer, but no boundary yet: no
        // punctuation, no pause reference, entry not yet 5 s old.
        assert!(g.poll(t0 + Duration::from_secs(4)).is_empty());
        // The buffer-forward timeout (5 s after insertion) is the boundary.
        let out = g.poll(t0 + Duration::from_secs(6));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "no score here");
    }

    #[test]
    fn dedup_suppresses_equal_fingerprints() {
        let (mut g, metrics) = gate_with_metrics();
        let t0 = Instant::now();
        let out = g.handle_event(final_event("r1", "Hello everyone!", 0.0, t0), t0);
        assert_eq!(out.len(), 1);

        // Case, spacing and punctuation differences dedup away.
        let t1 = t0 + Duration::from_secs(1);
        let out = g.handle_event(final_event("r2", "hello everyone", 1.0, t1), t1);
        assert!(out.is_empty());
        assert_eq!(metrics.dedup_suppressed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dedup_window_expires() {
        let mut g = gate();
        let t0 = Instant::now();
        assert_eq!(g.handle_event(final_event("r1", "hello", 0.0, t0), t0).len(), 1);
        let t1 = t0 + Duration::from_secs(11);
        assert_eq!(g.handle_event(final_event("r2", "hello", 1.0, t1), t1).len(), 1);
    }

    #[test]
    fn orphan_forwards_after_timeout() {
        let (mut g, metrics) = gate_with_metrics();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "stranded text", Some(0.4), 0.0, t0), t0);
        // Released into the buffer at the window close; stability too low to
        // forward, and no final ever arrives.
        assert!(g.poll(t0 + 200 * MS).is_empty());

        let out = g.poll(t0 + Duration::from_secs(16));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "stranded text");
        assert_eq!(metrics.orphaned_results.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rate_limiter_drops_are_counted() {
        let (mut g, metrics) = gate_with_metrics();
        let t0 = Instant::now();
        for i in 0..4 {
            let at = t0 + i * 10 * MS;
            let _ = g.handle_event(partial("r1", &format!("take {i}"), Some(0.5), 0.0, at), at);
        }
        let _ = g.poll(t0 + 200 * MS);
        assert_eq!(metrics.rate_limited_results.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn window_release_picks_best_variant() {
        let mut g = gate();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "Hello evr.", Some(0.3), 0.0, t0), t0);
        let _ = g.handle_event(partial("r1", "Hello everyone.", Some(0.9), 0.0, t0 + 10 * MS), t0 + 10 * MS);
        let _ = g.handle_event(partial("r1", "Hello every1.", Some(0.6), 0.0, t0 + 20 * MS), t0 + 20 * MS);

        let out = g.poll(t0 + 200 * MS);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Hello everyone.");
    }

    #[test]
    fn emission_is_ordered_by_start_time() {
        let mut g = gate();
        let t0 = Instant::now();
        // Two low-stability partials buffered via separate windows.
        let _ = g.handle_event(partial("late", "second thing", Some(0.95), 5.0, t0), t0);
        let t1 = t0 + 250 * MS;
        let _ = g.handle_event(partial("early", "first thing", Some(0.95), 1.0, t1), t1);
        let t2 = t1 + 250 * MS;
        let _ = g.poll(t2);

        // Both become forwardable at the buffer-forward timeout.
        let out = g.poll(t0 + Duration::from_secs(6));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "first thing");
        assert_eq!(out[1].text, "second thing");
    }

    #[test]
    fn capacity_flush_emits_stable_entries() {
        let config = GateConfig {
            buffer_max_seconds: 1,
            words_per_second: 10,
            ..GateConfig::default()
        };
        let (metrics_gate, metrics) = {
            let m = PipelineMetrics::new();
            (
                PartialResultGate::new(config, &DedupConfig::default(), Arc::clone(&m)),
                m,
            )
        };
        let mut g = metrics_gate;
        let t0 = Instant::now();

        // Each entry has 4 words; capacity is 10 words, so the third insert
        // overflows and flushes stable entries.
        let mut now = t0;
        let mut emitted = Vec::new();
        for i in 0..3 {
            emitted.extend(g.handle_event(
                partial(&format!("r{i}"), &format!("chunk number {i} words"), Some(0.9), i as f64, now),
                now,
            ));
            now += 250 * MS;
            emitted.extend(g.poll(now));
        }

        assert!(metrics.capacity_flushes.load(Ordering::Relaxed) > 0 || !emitted.is_empty());
    }

    #[test]
    fn finish_flushes_open_window() {
        let mut g = gate();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "Last words.", Some(0.9), 0.0, t0), t0);
        // Session terminates before the window closes.
        let out = g.finish(t0 + 50 * MS);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Last words.");
    }

    #[test]
    fn pause_boundary_forwards_buffered_eligible_entry() {
        let mut g = gate();
        let t0 = Instant::now();
        // First utterance establishes a forward reference.
        let _ = g.handle_event(final_event("r1", "First one.", 0.0, t0), t0);

        // Eligible entry with no punctuation.
        let t1 = t0 + 300 * MS;
        let _ = g.handle_event(partial("r2", "second thought", Some(0.9), 1.0, t1), t1);
        let t2 = t1 + 200 * MS;
        assert!(g.poll(t2).is_empty(), "no boundary yet");

        // 2 s after the last forward, the pause condition fires.
        let out = g.poll(t0 + Duration::from_secs(2) + 600 * MS);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "second thought");
    }

    #[test]
    fn malformed_like_replacement_keeps_added_at_for_blind_timeout() {
        let mut g = gate();
        let t0 = Instant::now();
        let _ = g.handle_event(partial("r1", "one", None, 0.0, t0), t0);
        let _ = g.poll(t0 + 200 * MS);
        // Replacement at 2 s still counts age from t0.
        let t1 = t0 + Duration::from_secs(2);
        let _ = g.handle_event(partial("r1", "one two", None, 0.0, t1), t1);
        let _ = g.poll(t1 + 200 * MS);

        // Once the entry (inserted at t0+200 ms) ages past both the blind
        // timeout and the forward timeout, the newest text is forwarded.
        let out = g.poll(t0 + Duration::from_secs(6));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "one two");
    }
}
