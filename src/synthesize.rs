//! External synthesizer seam, voice selection, and SSML fallback.
//!
//! Synthesis requests carry SSML plus a per-language voice and always ask
//! for 16 kHz PCM16LE. When the service rejects the SSML document itself,
//! the call is retried once with plain text recovered from the markup, all
//! within the original deadline budget.

use crate::config::SynthesizeConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::retry;
use crate::ssml;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Built-in neural voice per language; config overrides win.
const DEFAULT_VOICES: [(&str, &str); 16] = [
    ("en", "Joanna"),
    ("es", "Lupe"),
    ("fr", "Lea"),
    ("de", "Vicki"),
    ("it", "Bianca"),
    ("pt", "Camila"),
    ("ja", "Takumi"),
    ("ko", "Seoyeon"),
    ("zh", "Zhiyu"),
    ("ar", "Zeina"),
    ("hi", "Aditi"),
    ("nl", "Laura"),
    ("pl", "Ola"),
    ("ru", "Tatyana"),
    ("sv", "Astrid"),
    ("tr", "Filiz"),
];

/// Whether the request body is SSML or plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextType {
    /// SSML markup.
    Ssml,
    /// Plain text, no markup.
    Text,
}

/// One synthesis request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    /// SSML or plain text body.
    pub body: String,
    /// Body interpretation.
    pub text_type: TextType,
    /// Voice id for the target language.
    pub voice: String,
    /// Requested output sample rate in Hz.
    pub sample_rate: u32,
}

/// Speech synthesis service.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize audio bytes (PCM16LE at the requested rate).
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidSsml`] signals a rejected document (callers
    /// fall back to plain text); any other error omits the language.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Bytes>;
}

/// Resolve the voice for a language, config overrides first.
#[must_use]
pub fn voice_for_language(config: &SynthesizeConfig, language: &str) -> Option<String> {
    if let Some(voice) = config.voices.get(language) {
        return Some(voice.clone());
    }
    DEFAULT_VOICES
        .iter()
        .find(|(lang, _)| *lang == language)
        .map(|(_, voice)| (*voice).to_owned())
}

/// HTTP-backed synthesizer client.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSynthesizer {
    /// Create a client against the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns a config error when the endpoint is empty.
    pub fn new(config: &SynthesizeConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(PipelineError::Config(
                "synthesize.endpoint is not configured".to_owned(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Bytes> {
        let url = format!("{}/synthesize", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PipelineError::Synthesize(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(PipelineError::Synthesize("throttled (429)".to_owned()));
        }
        if status.is_server_error() {
            return Err(PipelineError::Synthesize(format!(
                "service unavailable ({status})"
            )));
        }
        if status.as_u16() == 400 {
            let body = response.text().await.unwrap_or_default();
            if body.to_ascii_lowercase().contains("ssml") {
                return Err(PipelineError::InvalidSsml(body));
            }
            return Err(PipelineError::Synthesize(format!("rejected: {body}")));
        }
        if !status.is_success() {
            return Err(PipelineError::Synthesize(format!("rejected ({status})")));
        }

        response
            .bytes()
            .await
            .map_err(|e| PipelineError::Synthesize(format!("bad response body: {e}")))
    }
}

/// Synthesize SSML with the deadline/retry policy and the one-shot plain-text
/// fallback on SSML rejection.
///
/// # Errors
///
/// Returns the synthesizer's error after exhausting the retry budget and the
/// fallback; callers omit the language for this utterance.
pub async fn synthesize_with_policy(
    synthesizer: &Arc<dyn Synthesizer>,
    config: &SynthesizeConfig,
    metrics: &Arc<PipelineMetrics>,
    ssml_body: &str,
    voice: &str,
) -> Result<Bytes> {
    let request = SynthesisRequest {
        body: ssml_body.to_owned(),
        text_type: TextType::Ssml,
        voice: voice.to_owned(),
        sample_rate: config.sample_rate,
    };

    // The whole attempt — SSML tries plus an optional plain-text retry —
    // shares one deadline budget.
    let deadline = config.deadline();
    let max_attempts = config.max_attempts;
    let synthesizer = Arc::clone(synthesizer);
    let metrics = Arc::clone(metrics);

    tokio::time::timeout(deadline, async move {
        let first = retry_transient(&synthesizer, &request, max_attempts).await;
        match first {
            Ok(audio) => Ok(audio),
            Err(PipelineError::InvalidSsml(reason)) => {
                warn!("synthesizer rejected SSML ({reason}), retrying as plain text");
                PipelineMetrics::incr(&metrics.ssml_fallbacks);
                let plain = SynthesisRequest {
                    body: ssml::strip_to_plain_text(&request.body),
                    text_type: TextType::Text,
                    ..request
                };
                retry_transient(&synthesizer, &plain, max_attempts).await
            }
            Err(e) => Err(e),
        }
    })
    .await
    .map_err(|_| PipelineError::Deadline(deadline))?
}

/// Retry only transient failures; SSML rejection surfaces immediately.
async fn retry_transient(
    synthesizer: &Arc<dyn Synthesizer>,
    request: &SynthesisRequest,
    max_attempts: u32,
) -> Result<Bytes> {
    let attempts = max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match synthesizer.synthesize(request).await {
            Ok(audio) => return Ok(audio),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                tokio::time::sleep(retry::backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
