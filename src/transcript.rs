//! Upstream transcript event schema and validation.
//!
//! The recognizer pushes loosely-typed JSON events; this module narrows them
//! into tagged [`TranscriptEvent`] values. The best transcript is always
//! `alternatives[0]` and the overall stability score is `items[0].stability`
//! when present — absent scores stay `None` and are never conflated with 0.
//! Ill-formed events are rejected here and dropped by the caller.

use serde::Deserialize;
use std::time::Instant;

/// Raw wire shape of one recognizer event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTranscriptEvent {
    /// `true` for partials, `false` for finals.
    pub is_partial: bool,
    /// Monotone id within the recognition stream.
    pub result_id: String,
    /// Utterance start offset in seconds.
    pub start_time: f64,
    /// Utterance end offset in seconds, when known.
    #[serde(default)]
    pub end_time: Option<f64>,
    /// Per-item confidence data; only the first item's stability is used.
    #[serde(default)]
    pub items: Vec<WireItem>,
    /// Candidate transcripts, best first.
    #[serde(default)]
    pub alternatives: Vec<WireAlternative>,
}

/// One recognized item with optional stability.
#[derive(Debug, Clone, Deserialize)]
pub struct WireItem {
    /// Stability in [0,1], absent for recognizers that do not score.
    #[serde(default)]
    pub stability: Option<f64>,
    /// Item content (unused beyond presence).
    #[serde(default)]
    pub content: String,
}

/// One candidate transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct WireAlternative {
    /// Full transcript text.
    pub transcript: String,
}

/// A validated recognition result, partial or final.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    /// Monotone id within the recognition stream; replace-on-same-id.
    pub result_id: String,
    /// Owning session.
    pub session_id: String,
    /// Source language of the stream (ISO 639-1).
    pub source_language: String,
    /// Best transcript text.
    pub text: String,
    /// Stability in [0,1]; `None` when the recognizer did not score.
    pub stability_score: Option<f64>,
    /// Utterance start offset in seconds.
    pub start_time: f64,
    /// Utterance end offset in seconds, when known.
    pub end_time: Option<f64>,
    /// When the event arrived at this process.
    pub arrival: Instant,
}

/// A tagged transcript event for the gate.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// An unstable, possibly superseded result.
    Partial(RecognitionResult),
    /// The terminal result for its id.
    Final(RecognitionResult),
}

impl TranscriptEvent {
    /// The carried result, regardless of finality.
    #[must_use]
    pub fn result(&self) -> &RecognitionResult {
        match self {
            Self::Partial(r) | Self::Final(r) => r,
        }
    }

    /// Whether this is a final result.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }
}

/// Reasons an event is rejected at ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Empty or missing result id.
    MissingResultId,
    /// No alternatives or an empty best transcript.
    EmptyTranscript,
    /// Non-finite or negative timing.
    BadTiming,
    /// Stability outside [0,1].
    BadStability,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingResultId => write!(f, "missing result id"),
            Self::EmptyTranscript => write!(f, "empty transcript"),
            Self::BadTiming => write!(f, "bad timing"),
            Self::BadStability => write!(f, "stability outside [0,1]"),
        }
    }
}

/// Validate and narrow a wire event into a [`TranscriptEvent`].
///
/// # Errors
///
/// Returns the reason the event is ill-formed; callers drop it and count a
/// metric.
pub fn narrow_event(
    wire: WireTranscriptEvent,
    session_id: &str,
    source_language: &str,
    arrival: Instant,
) -> std::result::Result<TranscriptEvent, RejectReason> {
    if wire.result_id.trim().is_empty() {
        return Err(RejectReason::MissingResultId);
    }

    let text = wire
        .alternatives
        .first()
        .map(|a| a.transcript.trim().to_owned())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(RejectReason::EmptyTranscript);
    }

    if !wire.start_time.is_finite() || wire.start_time < 0.0 {
        return Err(RejectReason::BadTiming);
    }
    if let Some(end) = wire.end_time {
        if !end.is_finite() || end < wire.start_time {
            return Err(RejectReason::BadTiming);
        }
    }

    let stability_score = wire.items.first().and_then(|item| item.stability);
    if let Some(score) = stability_score {
        if !(0.0..=1.0).contains(&score) || !score.is_finite() {
            return Err(RejectReason::BadStability);
        }
    }

    let result = RecognitionResult {
        result_id: wire.result_id,
        session_id: session_id.to_owned(),
        source_language: source_language.to_owned(),
        text,
        stability_score,
        start_time: wire.start_time,
        end_time: wire.end_time,
        arrival,
    };

    Ok(if wire.is_partial {
        TranscriptEvent::Partial(result)
    } else {
        TranscriptEvent::Final(result)
    })
}
