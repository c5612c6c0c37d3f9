//! Babelcast: realtime speech translation fan-out.
//!
//! One speaker streams audio and transcripts in; many listeners subscribe,
//! each in their own language; each receives translated, prosody-aware
//! synthesized audio with sub-second added latency.
//!
//! # Architecture
//!
//! Each session is a pipeline of independent stages connected by async
//! channels:
//! - **Gate**: reduces the unstable partial-transcript stream to a minimal,
//!   ordered sequence of stable utterances
//! - **Dynamics**: extracts loudness and speaking-rate classes from the raw
//!   speaker audio
//! - **Fan-out**: translates, builds SSML, synthesizes, and delivers one
//!   audio stream per target language to every listener, with bounded
//!   concurrency and per-listener backpressure
//!
//! Recognition, translation, and synthesis are external collaborators
//! behind traits; the crate orchestrates them but performs none itself.

pub mod audio_buffer;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dynamics;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod ssml;
pub mod synthesize;
pub mod text;
pub mod transcript;
pub mod translate;
pub mod transport;

pub use cache::TranslationCache;
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::PipelineConfig;
pub use dynamics::{AudioDynamics, DynamicsExtractor, SpeakingRate, VolumeLevel};
pub use error::{PipelineError, Result};
pub use gate::PartialResultGate;
pub use metrics::PipelineMetrics;
pub use pipeline::{SessionPipeline, SessionPipelineHandle, Utterance};
pub use registry::{BroadcastState, Listener, SessionHandle, SessionRegistry};
pub use synthesize::{HttpSynthesizer, Synthesizer};
pub use transcript::{TranscriptEvent, WireTranscriptEvent};
pub use translate::{HttpTranslator, Translator};
pub use transport::{BroadcastTransport, ControlMessage, InboundControl};
