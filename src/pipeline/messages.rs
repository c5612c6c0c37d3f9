//! Message types passed between pipeline stages.

use crate::dynamics::AudioDynamics;
use bytes::Bytes;
use std::time::Instant;
use uuid::Uuid;

/// A stable, ready-to-translate unit of text produced by the gate.
///
/// Immutable once created; dynamics are attached by the fan-out stage.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Unique id for this utterance.
    pub utterance_id: Uuid,
    /// Owning session.
    pub session_id: String,
    /// Source language of the speaker (ISO 639-1).
    pub source_language: String,
    /// Stable transcript text.
    pub text: String,
    /// Prosody parameters, attached downstream of the gate.
    pub dynamics: Option<AudioDynamics>,
    /// Start offset of the originating result, in stream seconds.
    pub start_time: f64,
    /// End offset, when the recognizer reported one.
    pub end_time: Option<f64>,
    /// When the gate emitted this utterance.
    pub produced_at: Instant,
    /// Correlation id propagated to logs and metrics at every step.
    pub correlation_id: Uuid,
}

impl Utterance {
    /// Create an utterance from gate output.
    #[must_use]
    pub fn new(
        session_id: String,
        source_language: String,
        text: String,
        start_time: f64,
        end_time: Option<f64>,
        produced_at: Instant,
    ) -> Self {
        Self {
            utterance_id: Uuid::new_v4(),
            session_id,
            source_language,
            text,
            dynamics: None,
            start_time,
            end_time,
            produced_at,
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// Audio sample encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// 16-bit little-endian PCM.
    Pcm16Le,
}

/// Synthesized audio for one `(utterance, language)` pair.
///
/// Chunks for a single pair arrive in order and must reach each listener in
/// that order.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Opaque audio bytes.
    pub data: Bytes,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Sample encoding.
    pub encoding: AudioEncoding,
    /// Originating utterance.
    pub utterance_id: Uuid,
    /// Target language this audio was synthesized for.
    pub target_language: String,
}

impl AudioChunk {
    /// Chunk length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback duration in milliseconds for 16-bit mono PCM.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        let samples = self.data.len() as u64 / 2;
        samples * 1000 / u64::from(self.sample_rate)
    }
}

/// A window of raw speaker audio tapped for dynamics extraction.
#[derive(Debug, Clone)]
pub struct SpeakerAudio {
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the window was captured.
    pub captured_at: Instant,
}
