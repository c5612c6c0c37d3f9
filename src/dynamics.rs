//! Vocal-dynamics extraction from raw speaker audio.
//!
//! Two features are extracted per short window: a loudness class from framed
//! RMS energy, and a speaking-rate class from spectral-flux onset density.
//! Extraction never fails — invalid input produces neutral fallback dynamics
//! and bumps a metric, so synthesis always has prosody parameters to work
//! with.

use crate::clock::SharedClock;
use crate::metrics::PipelineMetrics;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// RMS frame length in samples.
const RMS_FRAME: usize = 2048;
/// Hop between analysis frames in samples.
const HOP: usize = 512;
/// STFT window for the onset detector.
const ONSET_FRAME: usize = 1024;
/// Silence floor in dB.
const SILENCE_DB: f32 = -100.0;
/// Valid input duration range in seconds.
const MIN_DURATION_SECS: f32 = 0.1;
const MAX_DURATION_SECS: f32 = 30.0;

/// Loudness classification from RMS energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLevel {
    /// Below −30 dB.
    Whisper,
    /// (−30, −20] dB.
    Soft,
    /// (−20, −10] dB.
    Medium,
    /// Above −10 dB.
    Loud,
}

impl VolumeLevel {
    /// SSML `volume` attribute value.
    #[must_use]
    pub fn as_ssml(self) -> &'static str {
        match self {
            Self::Whisper => "x-soft",
            Self::Soft => "soft",
            Self::Medium => "medium",
            Self::Loud => "x-loud",
        }
    }

    fn classify(db: f32) -> Self {
        if db > -10.0 {
            Self::Loud
        } else if db > -20.0 {
            Self::Medium
        } else if db > -30.0 {
            Self::Soft
        } else {
            Self::Whisper
        }
    }
}

/// Speaking-rate classification from onset density.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakingRate {
    /// Below 100 wpm.
    VerySlow,
    /// [100, 130) wpm.
    Slow,
    /// [130, 160) wpm.
    Medium,
    /// [160, 190) wpm.
    Fast,
    /// 190 wpm and above.
    VeryFast,
}

impl SpeakingRate {
    /// SSML `rate` attribute value.
    #[must_use]
    pub fn as_ssml(self) -> &'static str {
        match self {
            Self::VerySlow => "x-slow",
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
            Self::VeryFast => "x-fast",
        }
    }

    fn classify(wpm: f32) -> Self {
        if wpm < 100.0 {
            Self::VerySlow
        } else if wpm < 130.0 {
            Self::Slow
        } else if wpm < 160.0 {
            Self::Medium
        } else if wpm < 190.0 {
            Self::Fast
        } else {
            Self::VeryFast
        }
    }
}

/// Prosody parameters for one utterance. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioDynamics {
    /// Loudness class.
    pub volume: VolumeLevel,
    /// Mean RMS energy in dB relative to full scale.
    pub db_value: f32,
    /// Rate class.
    pub rate: SpeakingRate,
    /// Estimated words per minute.
    pub wpm: f32,
    /// Number of detected onsets.
    pub onset_count: usize,
    /// When the extraction ran.
    pub detected_at: Instant,
}

impl AudioDynamics {
    /// Neutral dynamics used when extraction is impossible.
    #[must_use]
    pub fn fallback(now: Instant) -> Self {
        Self {
            volume: VolumeLevel::Medium,
            db_value: -15.0,
            rate: SpeakingRate::Medium,
            wpm: 145.0,
            onset_count: 0,
            detected_at: now,
        }
    }
}

/// Extracts [`AudioDynamics`] from mono audio buffers.
pub struct DynamicsExtractor {
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
}

impl DynamicsExtractor {
    /// Create an extractor.
    pub fn new(clock: SharedClock, metrics: Arc<PipelineMetrics>) -> Self {
        Self { clock, metrics }
    }

    /// Extract dynamics from a mono buffer at `sample_rate` Hz.
    ///
    /// Invalid input (empty, non-finite samples, zero rate, duration outside
    /// 0.1–30 s) yields [`AudioDynamics::fallback`] and a fallback metric.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> AudioDynamics {
        let now = self.clock.now();

        if let Err(reason) = validate_input(samples, sample_rate) {
            warn!("dynamics extraction fallback: {reason}");
            PipelineMetrics::incr(&self.metrics.dynamics_fallbacks);
            return AudioDynamics::fallback(now);
        }

        let db_value = mean_rms_db(samples);
        let volume = VolumeLevel::classify(db_value);

        let onset_count = detect_onsets(samples);
        let duration_minutes = samples.len() as f32 / sample_rate as f32 / 60.0;
        let wpm = if duration_minutes > 0.0 {
            onset_count as f32 / duration_minutes
        } else {
            0.0
        };
        let rate = SpeakingRate::classify(wpm);

        debug!(
            db = f64::from(db_value),
            ?volume,
            wpm = f64::from(wpm),
            onsets = onset_count,
            "dynamics extracted"
        );

        AudioDynamics {
            volume,
            db_value,
            rate,
            wpm,
            onset_count,
            detected_at: now,
        }
    }

    /// Extract from multi-channel audio by average-downmixing first.
    ///
    /// Channels of unequal length are truncated to the shortest.
    pub fn extract_multi(&self, channels: &[Vec<f32>], sample_rate: u32) -> AudioDynamics {
        let Some(len) = channels.iter().map(Vec::len).min() else {
            PipelineMetrics::incr(&self.metrics.dynamics_fallbacks);
            return AudioDynamics::fallback(self.clock.now());
        };
        let scale = 1.0 / channels.len() as f32;
        let mono: Vec<f32> = (0..len)
            .map(|i| channels.iter().map(|ch| ch[i]).sum::<f32>() * scale)
            .collect();
        self.extract(&mono, sample_rate)
    }
}

fn validate_input(samples: &[f32], sample_rate: u32) -> std::result::Result<(), String> {
    if samples.is_empty() {
        return Err("empty buffer".to_owned());
    }
    if sample_rate == 0 {
        return Err("zero sample rate".to_owned());
    }
    let duration = samples.len() as f32 / sample_rate as f32;
    if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&duration) {
        return Err(format!("duration {duration:.2}s outside valid range"));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err("non-finite samples".to_owned());
    }
    Ok(())
}

/// Mean framed RMS converted to dB, floored for silence.
fn mean_rms_db(samples: &[f32]) -> f32 {
    let mut sum = 0.0f64;
    let mut frames = 0usize;
    let mut start = 0usize;
    while start < samples.len() {
        let end = (start + RMS_FRAME).min(samples.len());
        let frame = &samples[start..end];
        let energy: f32 = frame.iter().map(|s| s * s).sum();
        sum += f64::from((energy / frame.len() as f32).sqrt());
        frames += 1;
        if end == samples.len() {
            break;
        }
        start += HOP;
    }
    let avg = (sum / frames as f64) as f32;
    if avg > 0.0 {
        20.0 * avg.log10()
    } else {
        SILENCE_DB
    }
}

/// Count perceptual transients via positive spectral flux peaks.
///
/// STFT with a Hann window, half-wave-rectified frame-to-frame flux, then
/// local-maximum peak picking against a mean + deviation threshold with a
/// two-frame refractory gap.
fn detect_onsets(samples: &[f32]) -> usize {
    if samples.len() < ONSET_FRAME {
        return 0;
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(ONSET_FRAME);
    let window: Vec<f32> = (0..ONSET_FRAME)
        .map(|i| {
            let phase = std::f32::consts::TAU * i as f32 / ONSET_FRAME as f32;
            0.5 * (1.0 - phase.cos())
        })
        .collect();

    let bins = ONSET_FRAME / 2 + 1;
    let mut prev_mag: Vec<f32> = vec![0.0; bins];
    let mut flux = Vec::new();
    let mut scratch = vec![Complex::new(0.0f32, 0.0f32); ONSET_FRAME];

    let mut start = 0usize;
    while start + ONSET_FRAME <= samples.len() {
        for (i, slot) in scratch.iter_mut().enumerate() {
            *slot = Complex::new(samples[start + i] * window[i], 0.0);
        }
        fft.process(&mut scratch);

        let mut frame_flux = 0.0f32;
        for (bin, prev) in prev_mag.iter_mut().enumerate() {
            let mag = scratch[bin].norm();
            let diff = mag - *prev;
            if diff > 0.0 {
                frame_flux += diff;
            }
            *prev = mag;
        }
        flux.push(frame_flux);
        start += HOP;
    }

    if flux.len() < 3 {
        return 0;
    }

    let mean = flux.iter().sum::<f32>() / flux.len() as f32;
    let variance = flux.iter().map(|f| (f - mean).powi(2)).sum::<f32>() / flux.len() as f32;
    let threshold = mean + variance.sqrt();

    let mut onsets = 0usize;
    let mut last_onset: Option<usize> = None;
    for i in 1..flux.len() - 1 {
        let is_peak = flux[i] > flux[i - 1] && flux[i] >= flux[i + 1] && flux[i] > threshold;
        let clear_of_last = last_onset.is_none_or(|last| i - last > 2);
        if is_peak && clear_of_last {
            onsets += 1;
            last_onset = Some(i);
        }
    }
    onsets
}
