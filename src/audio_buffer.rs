//! Bounded per-listener audio buffering.
//!
//! Each listener gets a drop-oldest ring of synthesized chunks capped in
//! bytes of 16 kHz 16-bit mono PCM. Appends never block the producer: when a
//! new chunk does not fit, the oldest chunks are dropped one at a time until
//! it does, and each drop is counted.

use crate::metrics::PipelineMetrics;
use crate::pipeline::messages::AudioChunk;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// One listener's FIFO ring.
#[derive(Debug, Default)]
struct ListenerRing {
    chunks: VecDeque<AudioChunk>,
    bytes: usize,
}

/// Per-session manager of listener audio buffers.
pub struct AudioBufferManager {
    buffers: Mutex<HashMap<String, ListenerRing>>,
    max_bytes: usize,
    metrics: Arc<PipelineMetrics>,
}

impl AudioBufferManager {
    /// Create a manager with the given per-listener byte cap.
    #[must_use]
    pub fn new(max_bytes: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            max_bytes,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ListenerRing>> {
        match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a chunk to a listener's ring, dropping oldest chunks as needed.
    ///
    /// Returns the number of chunks dropped to make room. A chunk larger
    /// than the whole buffer is itself refused (counted as one drop).
    pub fn enqueue(&self, connection_id: &str, chunk: AudioChunk) -> usize {
        if chunk.len() > self.max_bytes {
            warn!(
                connection_id,
                chunk_bytes = chunk.len(),
                "audio chunk exceeds buffer capacity, dropping it"
            );
            PipelineMetrics::incr(&self.metrics.audio_overflow_drops);
            return 1;
        }

        let mut buffers = self.lock();
        let ring = buffers.entry(connection_id.to_owned()).or_default();

        let mut dropped = 0usize;
        while ring.bytes + chunk.len() > self.max_bytes {
            let Some(oldest) = ring.chunks.pop_front() else {
                break;
            };
            ring.bytes -= oldest.len();
            dropped += 1;
        }

        ring.bytes += chunk.len();
        ring.chunks.push_back(chunk);

        if dropped > 0 {
            PipelineMetrics::add(&self.metrics.audio_overflow_drops, dropped as u64);
            warn!(
                connection_id,
                dropped,
                utilization_pct = self.utilization(connection_id),
                "listener buffer overflow, dropped oldest chunks"
            );
        }
        dropped
    }

    /// Pop the oldest buffered chunk for a listener.
    #[must_use]
    pub fn pop(&self, connection_id: &str) -> Option<AudioChunk> {
        let mut buffers = self.lock();
        let ring = buffers.get_mut(connection_id)?;
        let chunk = ring.chunks.pop_front()?;
        ring.bytes -= chunk.len();
        Some(chunk)
    }

    /// Return a chunk to the front of the ring after a failed send, so the
    /// next delivery round retries it first and order is preserved.
    pub fn requeue_front(&self, connection_id: &str, chunk: AudioChunk) {
        let mut buffers = self.lock();
        let ring = buffers.entry(connection_id.to_owned()).or_default();
        ring.bytes += chunk.len();
        ring.chunks.push_front(chunk);
    }

    /// Drain all buffered chunks for a listener in FIFO order.
    #[must_use]
    pub fn drain(&self, connection_id: &str) -> Vec<AudioChunk> {
        let mut buffers = self.lock();
        match buffers.get_mut(connection_id) {
            Some(ring) => {
                ring.bytes = 0;
                ring.chunks.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    /// Remove a listener's ring entirely (disconnect).
    pub fn clear(&self, connection_id: &str) {
        self.lock().remove(connection_id);
    }

    /// Buffered bytes for one listener.
    #[must_use]
    pub fn buffered_bytes(&self, connection_id: &str) -> usize {
        self.lock().get(connection_id).map_or(0, |ring| ring.bytes)
    }

    /// Utilization percentage for one listener.
    #[must_use]
    pub fn utilization(&self, connection_id: &str) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.buffered_bytes(connection_id) as f64 / self.max_bytes as f64 * 100.0
    }

    /// `(average, max)` utilization across all listener rings, if any.
    #[must_use]
    pub fn utilization_summary(&self) -> Option<(f64, f64)> {
        let buffers = self.lock();
        if buffers.is_empty() || self.max_bytes == 0 {
            return None;
        }
        let mut total = 0.0f64;
        let mut peak = 0.0f64;
        for ring in buffers.values() {
            let pct = ring.bytes as f64 / self.max_bytes as f64 * 100.0;
            total += pct;
            peak = peak.max(pct);
        }
        Some((total / buffers.len() as f64, peak))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::pipeline::messages::AudioEncoding;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn chunk(bytes: usize, tag: u8) -> AudioChunk {
        AudioChunk {
            data: Bytes::from(vec![tag; bytes]),
            sample_rate: 16_000,
            encoding: AudioEncoding::Pcm16Le,
            utterance_id: Uuid::new_v4(),
            target_language: "es".to_owned(),
        }
    }

    #[test]
    fn enqueue_and_drain_preserve_fifo_order() {
        let manager = AudioBufferManager::new(1000, PipelineMetrics::new());
        assert_eq!(manager.enqueue("c1", chunk(100, 1)), 0);
        assert_eq!(manager.enqueue("c1", chunk(100, 2)), 0);
        assert_eq!(manager.enqueue("c1", chunk(100, 3)), 0);

        let drained = manager.drain("c1");
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].data[0], 1);
        assert_eq!(drained[2].data[0], 3);
        assert_eq!(manager.buffered_bytes("c1"), 0);
    }

    #[test]
    fn overflow_drops_oldest_first() {
        let metrics = PipelineMetrics::new();
        let manager = AudioBufferManager::new(250, Arc::clone(&metrics));
        assert_eq!(manager.enqueue("c1", chunk(100, 1)), 0);
        assert_eq!(manager.enqueue("c1", chunk(100, 2)), 0);
        // 100 more would make 300 > 250: chunk 1 is dropped.
        assert_eq!(manager.enqueue("c1", chunk(100, 3)), 1);

        let drained = manager.drain("c1");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data[0], 2);
        assert_eq!(drained[1].data[0], 3);
        assert_eq!(metrics.audio_overflow_drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn buffer_never_exceeds_cap() {
        let manager = AudioBufferManager::new(320_000, PipelineMetrics::new());
        // 15 seconds of 1-second chunks into a 10-second buffer.
        for i in 0..15 {
            let _ = manager.enqueue("c1", chunk(32_000, i));
        }
        assert!(manager.buffered_bytes("c1") <= 320_000);

        // The newest chunks survive, in order.
        let drained = manager.drain("c1");
        assert_eq!(drained.len(), 10);
        assert_eq!(drained[0].data[0], 5);
        assert_eq!(drained[9].data[0], 14);
    }

    #[test]
    fn oversized_chunk_is_refused() {
        let metrics = PipelineMetrics::new();
        let manager = AudioBufferManager::new(100, Arc::clone(&metrics));
        assert_eq!(manager.enqueue("c1", chunk(500, 1)), 1);
        assert_eq!(manager.buffered_bytes("c1"), 0);
    }

    #[test]
    fn pop_and_requeue_keep_order_and_accounting() {
        let manager = AudioBufferManager::new(1000, PipelineMetrics::new());
        let _ = manager.enqueue("c1", chunk(100, 1));
        let _ = manager.enqueue("c1", chunk(100, 2));

        let first = manager.pop("c1").unwrap();
        assert_eq!(first.data[0], 1);
        assert_eq!(manager.buffered_bytes("c1"), 100);

        // A failed send puts the chunk back at the front.
        manager.requeue_front("c1", first);
        assert_eq!(manager.buffered_bytes("c1"), 200);
        assert_eq!(manager.pop("c1").unwrap().data[0], 1);
        assert_eq!(manager.pop("c1").unwrap().data[0], 2);
        assert!(manager.pop("c1").is_none());
    }

    #[test]
    fn clear_releases_listener_state() {
        let manager = AudioBufferManager::new(1000, PipelineMetrics::new());
        let _ = manager.enqueue("c1", chunk(100, 1));
        manager.clear("c1");
        assert_eq!(manager.buffered_bytes("c1"), 0);
        assert!(manager.drain("c1").is_empty());
    }

    #[test]
    fn utilization_summary_averages_rings() {
        let manager = AudioBufferManager::new(1000, PipelineMetrics::new());
        assert!(manager.utilization_summary().is_none());
        let _ = manager.enqueue("c1", chunk(500, 1));
        let _ = manager.enqueue("c2", chunk(250, 2));

        assert!((manager.utilization("c1") - 50.0).abs() < 1e-9);
        let (avg, max) = manager.utilization_summary().unwrap();
        assert!((avg - 37.5).abs() < 1e-9);
        assert!((max - 50.0).abs() < 1e-9);
    }
}
