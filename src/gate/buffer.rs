//! Buffer for partial results awaiting finalization.
//!
//! Entries are keyed by result id with replace-on-same-id semantics (the
//! original `added_at` survives a replace). Capacity is measured in words of
//! unforwarded text; pressure flushes the oldest stable entries in batches.
//! Entries that age past the orphan timeout without a final are handed back
//! for forwarding as if a final had arrived.

use crate::text::word_count;
use crate::transcript::RecognitionResult;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stability at or above which an entry counts as stable for capacity
/// flushing (absent scores count too).
const FLUSH_STABILITY: f64 = 0.85;
/// Entries flushed per capacity batch.
const FLUSH_BATCH: usize = 5;

/// A buffered result with bookkeeping.
#[derive(Debug, Clone)]
pub struct BufferedResult {
    /// Latest result text/score for this id.
    pub result: RecognitionResult,
    /// When the id first entered the buffer.
    pub added_at: Instant,
    /// Whether this id has been forwarded (terminal).
    pub forwarded: bool,
}

impl BufferedResult {
    fn is_flush_stable(&self) -> bool {
        self.result
            .stability_score
            .is_none_or(|score| score >= FLUSH_STABILITY)
    }
}

/// Result buffer keyed by result id.
#[derive(Debug)]
pub struct ResultBuffer {
    entries: HashMap<String, BufferedResult>,
    max_words: usize,
}

impl ResultBuffer {
    /// Create a buffer bounded to `max_words` of unforwarded text.
    #[must_use]
    pub fn new(max_words: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_words,
        }
    }

    /// Insert or replace a result.
    ///
    /// Returns entries flushed to make room; callers must forward them.
    /// A replace keeps the original `added_at` and never triggers a flush of
    /// its own id.
    pub fn upsert(&mut self, result: RecognitionResult, now: Instant) -> Vec<BufferedResult> {
        let mut flushed = Vec::new();
        if !self.entries.contains_key(&result.result_id) {
            let incoming = word_count(&result.text);
            if self.word_total() + incoming > self.max_words {
                flushed = self.flush_oldest_stable();
            }
            // Stability could not free enough room: drop oldest regardless so
            // the word bound holds.
            while self.word_total() + incoming > self.max_words {
                match self.flush_oldest_any() {
                    Some(entry) => flushed.push(entry),
                    None => break,
                }
            }
        }

        match self.entries.get_mut(&result.result_id) {
            Some(entry) => {
                // Replace-on-same-id: newest text and score win.
                entry.result = result;
            }
            None => {
                let id = result.result_id.clone();
                self.entries.insert(
                    id,
                    BufferedResult {
                        result,
                        added_at: now,
                        forwarded: false,
                    },
                );
            }
        }
        flushed
    }

    /// Look up an entry without removing it.
    #[must_use]
    pub fn get(&self, result_id: &str) -> Option<&BufferedResult> {
        self.entries.get(result_id)
    }

    /// Whether this id has already been forwarded.
    #[must_use]
    pub fn is_forwarded(&self, result_id: &str) -> bool {
        self.entries.get(result_id).is_some_and(|e| e.forwarded)
    }

    /// Mark an id as forwarded (terminal).
    pub fn mark_forwarded(&mut self, result_id: &str) {
        if let Some(entry) = self.entries.get_mut(result_id) {
            entry.forwarded = true;
        }
    }

    /// Remove an entry, returning it.
    pub fn remove(&mut self, result_id: &str) -> Option<BufferedResult> {
        self.entries.remove(result_id)
    }

    /// Unforwarded entries older than `timeout`, in start-time order.
    ///
    /// These are orphans: a final never arrived and is assumed lost.
    #[must_use]
    pub fn orphans(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut orphaned: Vec<&BufferedResult> = self
            .entries
            .values()
            .filter(|e| !e.forwarded && now.duration_since(e.added_at) > timeout)
            .collect();
        sort_by_start_time(&mut orphaned);
        orphaned.iter().map(|e| e.result.result_id.clone()).collect()
    }

    /// Unforwarded entries, in start-time order.
    #[must_use]
    pub fn pending(&self) -> Vec<&BufferedResult> {
        let mut pending: Vec<&BufferedResult> =
            self.entries.values().filter(|e| !e.forwarded).collect();
        sort_by_start_time(&mut pending);
        pending
    }

    /// Drop forwarded entries older than `timeout`; their ids can no longer
    /// receive replacements worth remembering.
    pub fn prune_forwarded(&mut self, timeout: Duration, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.forwarded && now.duration_since(e.added_at) > timeout));
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, "pruned forwarded buffer entries");
        }
    }

    /// Total words across unforwarded entries.
    #[must_use]
    pub fn word_total(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !e.forwarded)
            .map(|e| word_count(&e.result.text))
            .sum()
    }

    /// Number of entries, forwarded included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flush up to [`FLUSH_BATCH`] of the oldest stable unforwarded entries.
    ///
    /// Stable means score ≥ 0.85 or no score. Flushed entries are marked
    /// forwarded and returned for emission.
    fn flush_oldest_stable(&mut self) -> Vec<BufferedResult> {
        let mut stable: Vec<&BufferedResult> = self
            .entries
            .values()
            .filter(|e| !e.forwarded && e.is_flush_stable())
            .collect();
        sort_by_start_time(&mut stable);

        let ids: Vec<String> = stable
            .iter()
            .take(FLUSH_BATCH)
            .map(|e| e.result.result_id.clone())
            .collect();

        let mut flushed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.forwarded = true;
                flushed.push(entry.clone());
            }
        }

        if !flushed.is_empty() {
            warn!(
                flushed = flushed.len(),
                words = self.word_total(),
                "result buffer at capacity, flushed oldest stable entries"
            );
        }
        flushed
    }

    /// Flush the single oldest unforwarded entry, stability ignored.
    fn flush_oldest_any(&mut self) -> Option<BufferedResult> {
        let mut pending: Vec<&BufferedResult> =
            self.entries.values().filter(|e| !e.forwarded).collect();
        sort_by_start_time(&mut pending);
        let id = pending.first()?.result.result_id.clone();
        let entry = self.entries.get_mut(&id)?;
        entry.forwarded = true;
        Some(entry.clone())
    }
}

fn sort_by_start_time(entries: &mut [&BufferedResult]) {
    entries.sort_by(|a, b| {
        a.result
            .start_time
            .partial_cmp(&b.result.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.added_at.cmp(&b.added_at))
    });
}
