//! Sentence boundary detection for buffered results.
//!
//! A buffered result is ready to forward when it is final, when its text ends
//! in sentence punctuation, when the speaker has paused since the last
//! forward, or when the entry has sat in the buffer past the forward timeout.
//! Only finality is mandatory; the other conditions are taken greedily.

use std::time::{Duration, Instant};

/// Detects when a buffered result forms a forwardable sentence.
#[derive(Debug)]
pub struct SentenceBoundaryDetector {
    pause_threshold: Duration,
    buffer_timeout: Duration,
    last_forward: Option<Instant>,
}

impl SentenceBoundaryDetector {
    /// Create a detector with the given pause and buffer-timeout thresholds.
    #[must_use]
    pub fn new(pause_threshold: Duration, buffer_timeout: Duration) -> Self {
        Self {
            pause_threshold,
            buffer_timeout,
            last_forward: None,
        }
    }

    /// Whether the result should be forwarded now.
    #[must_use]
    pub fn is_boundary(&self, text: &str, added_at: Instant, is_final: bool, now: Instant) -> bool {
        if is_final {
            return true;
        }
        if has_terminal_punctuation(text) {
            return true;
        }
        if self.pause_detected(now) {
            return true;
        }
        now.duration_since(added_at) >= self.buffer_timeout
    }

    /// Whether the inter-forward pause threshold has elapsed.
    #[must_use]
    pub fn pause_detected(&self, now: Instant) -> bool {
        self.last_forward
            .is_some_and(|last| now.duration_since(last) >= self.pause_threshold)
    }

    /// Record a forward so pause detection restarts from `now`.
    pub fn record_forward(&mut self, now: Instant) {
        self.last_forward = Some(now);
    }
}

/// Whether trimmed text ends with `.`, `?`, or `!`.
#[must_use]
pub fn has_terminal_punctuation(text: &str) -> bool {
    matches!(text.trim_end().chars().last(), Some('.' | '?' | '!'))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn detector() -> SentenceBoundaryDetector {
        SentenceBoundaryDetector::new(Duration::from_secs(2), Duration::from_secs(5))
    }

    #[test]
    fn final_is_always_a_boundary() {
        let d = detector();
        let now = Instant::now();
        assert!(d.is_boundary("incomplete phrase", now, true, now));
    }

    #[test]
    fn terminal_punctuation_is_a_boundary() {
        let d = detector();
        let now = Instant::now();
        assert!(d.is_boundary("Hello everyone.", now, false, now));
        assert!(d.is_boundary("Ready?", now, false, now));
        assert!(d.is_boundary("Go!  ", now, false, now));
        assert!(!d.is_boundary("Hello everyone", now, false, now));
        assert!(!d.is_boundary("trailing comma,", now, false, now));
    }

    #[test]
    fn pause_since_last_forward_is_a_boundary() {
        let mut d = detector();
        let t0 = Instant::now();
        d.record_forward(t0);
        assert!(!d.is_boundary("still going", t0, false, t0 + Duration::from_secs(1)));
        assert!(d.is_boundary("still going", t0, false, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn no_pause_before_any_forward() {
        let d = detector();
        let t0 = Instant::now();
        // Without a prior forward there is no pause reference point.
        assert!(!d.is_boundary("no punctuation", t0, false, t0 + Duration::from_secs(3)));
    }

    #[test]
    fn buffer_timeout_is_a_boundary() {
        let d = detector();
        let t0 = Instant::now();
        assert!(!d.is_boundary("slow sentence", t0, false, t0 + Duration::from_secs(4)));
        assert!(d.is_boundary("slow sentence", t0, false, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn empty_text_has_no_punctuation() {
        assert!(!has_terminal_punctuation(""));
        assert!(!has_terminal_punctuation("   "));
    }
}
