//! Configuration types for the translation fan-out pipeline.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Partial-result gate settings.
    pub gate: GateConfig,
    /// Utterance deduplication settings.
    pub dedup: DedupConfig,
    /// Translation cache settings.
    pub cache: CacheConfig,
    /// Per-listener audio buffer settings.
    pub audio_buffer: AudioBufferConfig,
    /// Per-session fan-out settings.
    pub session: SessionConfig,
    /// External translator settings.
    pub translate: TranslateConfig,
    /// External synthesizer settings.
    pub synthesize: SynthesizeConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any missing section.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            PipelineError::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.gate.rate_limit_window_ms == 0 {
            return Err(PipelineError::Config(
                "gate.rate_limit_window_ms must be positive".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gate.stability_threshold) {
            return Err(PipelineError::Config(format!(
                "gate.stability_threshold must be in [0,1], got {}",
                self.gate.stability_threshold
            )));
        }
        if self.gate.pause_threshold_secs == 0 || self.gate.buffer_forward_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "gate pause/forward thresholds must be positive".to_owned(),
            ));
        }
        if self.session.max_concurrent_broadcasts == 0 {
            return Err(PipelineError::Config(
                "session.max_concurrent_broadcasts must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Partial-result gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Rate-limit window size in milliseconds.
    pub rate_limit_window_ms: u64,
    /// Maximum released results per second.
    pub rate_limit_max_per_second: u32,
    /// Minimum stability score to forward a partial.
    pub stability_threshold: f64,
    /// Seconds after which a score-less partial becomes eligible anyway.
    pub blind_timeout_secs: u64,
    /// Buffer word-capacity basis, in seconds of speech.
    pub buffer_max_seconds: u64,
    /// Estimated words per second for the capacity calculation.
    pub words_per_second: u32,
    /// Per-entry buffer-forward timeout in seconds.
    pub buffer_forward_timeout_secs: u64,
    /// Inter-forward pause that forces a sentence boundary, in seconds.
    pub pause_threshold_secs: u64,
    /// Age at which an unpaired entry is forwarded as an orphan, in seconds.
    pub orphan_timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_ms: 200,
            rate_limit_max_per_second: 5,
            stability_threshold: 0.7,
            blind_timeout_secs: 3,
            buffer_max_seconds: 10,
            words_per_second: 30,
            buffer_forward_timeout_secs: 5,
            pause_threshold_secs: 2,
            orphan_timeout_secs: 15,
        }
    }
}

impl GateConfig {
    /// Maximum total words held in the result buffer.
    #[must_use]
    pub fn max_buffered_words(&self) -> usize {
        (self.words_per_second as u64 * self.buffer_max_seconds) as usize
    }
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Fingerprint lifetime in seconds.
    pub ttl_secs: u64,
    /// Full-clear threshold.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            max_entries: 10_000,
        }
    }
}

/// Translation cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry TTL in seconds.
    pub ttl_secs: u64,
    /// Maximum number of entries before eviction.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 10_000,
        }
    }
}

/// Per-listener audio buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioBufferConfig {
    /// Buffer cap in seconds of 16 kHz, 16-bit mono PCM.
    pub max_seconds: u64,
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self { max_seconds: 10 }
    }
}

impl AudioBufferConfig {
    /// Bytes of 16 kHz 16-bit mono PCM per second.
    pub const BYTES_PER_SECOND: usize = 32_000;

    /// Buffer cap in bytes.
    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_seconds as usize * Self::BYTES_PER_SECOND
    }
}

/// Per-session fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-utterance bound on concurrent translate/synthesize/send work.
    pub max_concurrent_broadcasts: usize,
    /// Minutes after which a single connection is told to refresh.
    pub connection_refresh_minutes: u64,
    /// Maximum session lifetime in hours (drives the TTL attribute).
    pub max_duration_hours: u64,
    /// Freshness window for reusing a prior dynamics extraction, in
    /// milliseconds.
    pub dynamics_reuse_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_broadcasts: 100,
            connection_refresh_minutes: 100,
            max_duration_hours: 2,
            dynamics_reuse_ms: 1000,
        }
    }
}

/// External translator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    /// Per-call deadline in milliseconds.
    pub deadline_ms: u64,
    /// Maximum attempts inside the deadline (first try included).
    pub max_attempts: u32,
    /// Service endpoint for the HTTP client.
    pub endpoint: String,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 2000,
            max_attempts: 3,
            endpoint: String::new(),
        }
    }
}

impl TranslateConfig {
    /// Per-call deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// External synthesizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizeConfig {
    /// Per-call deadline in milliseconds.
    pub deadline_ms: u64,
    /// Maximum attempts inside the deadline (first try included).
    pub max_attempts: u32,
    /// Service endpoint for the HTTP client.
    pub endpoint: String,
    /// Requested output sample rate in Hz.
    pub sample_rate: u32,
    /// Per-language voice overrides; unset languages use the built-in map.
    pub voices: HashMap<String, String>,
}

impl Default for SynthesizeConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 5000,
            max_attempts: 3,
            endpoint: String::new(),
            sample_rate: 16_000,
            voices: HashMap::new(),
        }
    }
}

impl SynthesizeConfig {
    /// Per-call deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}
