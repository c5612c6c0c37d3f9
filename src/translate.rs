//! External translator seam and HTTP client.
//!
//! The core orchestrates translation; it never translates itself. Production
//! points [`HttpTranslator`] at the translation service; tests substitute the
//! trait with fakes. Per-call deadlines and retry policy live in
//! [`translate_with_policy`], shared by every implementation.

use crate::cache::TranslationCache;
use crate::config::TranslateConfig;
use crate::error::{PipelineError, Result};
use crate::retry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Synchronous request/response translation service.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` from `src` to `tgt`.
    ///
    /// # Errors
    ///
    /// Any non-success is treated by callers as an absent translation for
    /// the target.
    async fn translate(&self, src: &str, tgt: &str, text: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslateRequest<'a> {
    source_language: &'a str,
    target_language: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

/// HTTP-backed translator client.
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranslator {
    /// Create a client against the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns a config error when the endpoint is empty.
    pub fn new(config: &TranslateConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(PipelineError::Config(
                "translate.endpoint is not configured".to_owned(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, src: &str, tgt: &str, text: &str) -> Result<String> {
        let url = format!("{}/translate", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&TranslateRequest {
                source_language: src,
                target_language: tgt,
                text,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Translate(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(PipelineError::Translate("throttled (429)".to_owned()));
        }
        if status.is_server_error() {
            return Err(PipelineError::Translate(format!(
                "service unavailable ({status})"
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::Translate(format!("rejected ({status})")));
        }

        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Translate(format!("bad response body: {e}")))?;
        Ok(body.translated_text)
    }
}

/// Translate one language with the cache-first, deadline-bounded policy.
///
/// Same-language requests pass the text through untouched, without cache or
/// translator involvement. Cache misses call the translator under the
/// configured deadline and retry budget; successes are stored back.
///
/// # Errors
///
/// Returns the translator's error after exhausting retries or the deadline;
/// callers omit the language for this utterance.
pub async fn translate_with_policy(
    translator: &Arc<dyn Translator>,
    cache: &TranslationCache,
    config: &TranslateConfig,
    src: &str,
    tgt: &str,
    text: &str,
) -> Result<String> {
    if src == tgt {
        return Ok(text.to_owned());
    }

    if let Some(hit) = cache.lookup(src, tgt, text).await {
        debug!(src, tgt, "translation cache hit");
        return Ok(hit);
    }

    let translated = retry::with_deadline(config.deadline(), config.max_attempts, || {
        let translator = Arc::clone(translator);
        let (src, tgt, text) = (src.to_owned(), tgt.to_owned(), text.to_owned());
        async move { translator.translate(&src, &tgt, &text).await }
    })
    .await?;

    cache.store(src, tgt, text, &translated).await;
    Ok(translated)
}
