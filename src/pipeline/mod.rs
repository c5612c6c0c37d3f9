//! The per-session streaming pipeline: gate → dynamics → fan-out.

pub mod fanout;
pub mod messages;
pub mod session;

pub use fanout::FanoutContext;
pub use messages::{AudioChunk, AudioEncoding, SpeakerAudio, Utterance};
pub use session::{SessionPipeline, SessionPipelineHandle};
