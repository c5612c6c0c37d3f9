//! Short-window utterance deduplication.
//!
//! Back-to-back utterances with the same normalized text (case, spacing and
//! punctuation ignored) are suppressed for a short TTL. The set is
//! hard-capped; blowing the cap clears it entirely, which trades a brief
//! duplicate window for bounded memory.

use crate::text::dedup_fingerprint;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Interval between opportunistic expired-entry sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// TTL-bounded fingerprint set.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
    last_cleanup: Option<Instant>,
    cleared_count: u64,
}

impl DedupCache {
    /// Create a dedup set with the given TTL and hard cap.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
            last_cleanup: None,
            cleared_count: 0,
        }
    }

    /// Record `text` and report whether it is fresh.
    ///
    /// Returns `false` when an unexpired entry with the same fingerprint
    /// exists (the caller suppresses the emission); otherwise inserts the
    /// fingerprint with TTL and returns `true`.
    pub fn check_and_insert(&mut self, text: &str, now: Instant) -> bool {
        self.cleanup_if_due(now);

        let fp = dedup_fingerprint(text);
        if let Some(expires_at) = self.entries.get(&fp) {
            if *expires_at > now {
                debug!(fingerprint = %fp, "duplicate utterance suppressed");
                return false;
            }
            self.entries.remove(&fp);
        }

        if self.entries.len() >= self.max_entries {
            // Emergency full clear: bounded memory beats dedup fidelity.
            error!(
                size = self.entries.len(),
                cap = self.max_entries,
                "dedup set over capacity, clearing"
            );
            self.entries.clear();
            self.cleared_count += 1;
        }

        self.entries.insert(fp, now + self.ttl);
        true
    }

    /// Remove expired fingerprints.
    pub fn cleanup_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before - self.entries.len()
    }

    /// Number of emergency clears so far.
    #[must_use]
    pub fn cleared_count(&self) -> u64 {
        self.cleared_count
    }

    /// Current set size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cleanup_if_due(&mut self, now: Instant) {
        let due = self
            .last_cleanup
            .is_none_or(|last| now.duration_since(last) >= CLEANUP_INTERVAL);
        if due {
            let removed = self.cleanup_expired(now);
            if removed > 0 {
                debug!(removed, "dedup cleanup");
            }
            self.last_cleanup = Some(now);
        }
    }
}
