//! Sliding-window rate limiting for partial results.
//!
//! Incoming partials accumulate into a 200 ms window; when the window closes,
//! exactly one representative — the highest-stability result, ties broken by
//! most recent arrival — is released downstream. The outgoing window is
//! always flushed before a new one opens, so a burst straddling a boundary
//! never loses its best result.

use crate::transcript::RecognitionResult;
use std::time::{Duration, Instant};

/// Window-based limiter releasing at most one result per window.
#[derive(Debug)]
pub struct WindowLimiter {
    window: Duration,
    pending: Vec<RecognitionResult>,
    window_start: Option<Instant>,
    released_count: u64,
    dropped_count: u64,
}

impl WindowLimiter {
    /// Create a limiter with the given window length.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            window_start: None,
            released_count: 0,
            dropped_count: 0,
        }
    }

    /// Offer a partial to the limiter.
    ///
    /// Returns the previous window's representative when this offer crosses a
    /// window boundary; the offered result always starts or joins the current
    /// window.
    pub fn offer(&mut self, result: RecognitionResult, now: Instant) -> Option<RecognitionResult> {
        let released = self.roll_if_closed(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.pending.push(result);
        released
    }

    /// Release the representative if the current window has closed.
    pub fn poll(&mut self, now: Instant) -> Option<RecognitionResult> {
        self.roll_if_closed(now)
    }

    /// Flush the current window unconditionally (session termination).
    pub fn flush(&mut self) -> Option<RecognitionResult> {
        self.window_start = None;
        self.take_best()
    }

    /// Results discarded as non-representative so far.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Results released so far.
    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.released_count
    }

    fn roll_if_closed(&mut self, now: Instant) -> Option<RecognitionResult> {
        let start = self.window_start?;
        if now.duration_since(start) < self.window {
            return None;
        }
        self.window_start = None;
        self.take_best()
    }

    /// Select the highest-stability result (missing scores rank lowest),
    /// most recent arrival on ties, and drop the rest.
    fn take_best(&mut self) -> Option<RecognitionResult> {
        if self.pending.is_empty() {
            return None;
        }
        let mut best_idx = 0usize;
        for (idx, candidate) in self.pending.iter().enumerate().skip(1) {
            let best = &self.pending[best_idx];
            let candidate_score = candidate.stability_score.unwrap_or(0.0);
            let best_score = best.stability_score.unwrap_or(0.0);
            if candidate_score > best_score
                || (candidate_score == best_score && candidate.arrival >= best.arrival)
            {
                best_idx = idx;
            }
        }
        let best = self.pending.swap_remove(best_idx);
        self.dropped_count += self.pending.len() as u64;
        self.pending.clear();
        self.released_count += 1;
        Some(best)
    }
}
