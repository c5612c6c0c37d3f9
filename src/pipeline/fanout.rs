//! Per-utterance fan-out: translate → SSML → synthesize → deliver.
//!
//! Each target language runs as its own chained task — a language proceeds
//! to synthesis as soon as its translation returns, with no cross-language
//! barrier — and failures stay confined to their language. Delivery pushes
//! through each listener's bounded buffer so a stalled connection never
//! blocks the rest of the fan-out.

use crate::audio_buffer::AudioBufferManager;
use crate::cache::TranslationCache;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::pipeline::messages::{AudioChunk, AudioEncoding, Utterance};
use crate::registry::SessionHandle;
use crate::ssml;
use crate::synthesize::{self, Synthesizer};
use crate::translate::{self, Translator};
use crate::transport::BroadcastTransport;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared dependencies for one session's fan-out stage.
pub struct FanoutContext {
    /// The owning session.
    pub session: Arc<SessionHandle>,
    /// Process-wide translation cache.
    pub cache: Arc<TranslationCache>,
    /// External translator.
    pub translator: Arc<dyn Translator>,
    /// External synthesizer.
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Byte transport to listeners.
    pub transport: Arc<dyn BroadcastTransport>,
    /// Per-listener audio buffers.
    pub buffers: Arc<AudioBufferManager>,
    /// Pipeline configuration.
    pub config: Arc<PipelineConfig>,
    /// Shared counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Per-session bound on concurrent fan-out work.
    pub semaphore: Arc<Semaphore>,
}

/// Fan one utterance out to every live target language and its listeners.
///
/// Cancelling `cancel` (session end) promptly stops all in-flight
/// per-language work; dropping the returned future aborts it too.
pub async fn fan_out(ctx: &Arc<FanoutContext>, utterance: Utterance, cancel: &CancellationToken) {
    let correlation_id = utterance.correlation_id;

    if !ctx.session.delivery_enabled() {
        debug!(
            session_id = %utterance.session_id,
            %correlation_id,
            "broadcast paused or muted, dropping utterance"
        );
        return;
    }

    let languages = ctx.session.target_languages();
    if languages.is_empty() {
        debug!(
            session_id = %utterance.session_id,
            %correlation_id,
            "no listeners, dropping utterance"
        );
        return;
    }

    // One parent scope per utterance: every per-language chain is a child,
    // and cancelling the parent cancels them all.
    let scope = cancel.child_token();
    let mut children = JoinSet::new();
    for language in languages {
        let ctx = Arc::clone(ctx);
        let utterance = utterance.clone();
        let token = scope.clone();
        children.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = run_language(ctx, utterance, language) => {}
            }
        });
    }
    while children.join_next().await.is_some() {}

    if let Some((avg, max)) = ctx.buffers.utilization_summary() {
        info!(
            session_id = %utterance.session_id,
            %correlation_id,
            avg_utilization_pct = avg,
            max_utilization_pct = max,
            "listener buffer utilization"
        );
    }
}

/// The per-language chain: translate, build SSML, synthesize, deliver.
///
/// Every exit path before delivery simply omits the language for this
/// utterance; nothing is surfaced to its listeners.
async fn run_language(ctx: Arc<FanoutContext>, utterance: Utterance, language: String) {
    let correlation_id = utterance.correlation_id;
    let _permit = match Arc::clone(&ctx.semaphore).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let translated = match translate::translate_with_policy(
        &ctx.translator,
        &ctx.cache,
        &ctx.config.translate,
        &utterance.source_language,
        &language,
        &utterance.text,
    )
    .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!(%language, %correlation_id, "translation failed: {e}");
            PipelineMetrics::incr(&ctx.metrics.translate_failures);
            return;
        }
    };

    let document = ssml::build(&translated, utterance.dynamics.as_ref());
    if document.is_empty() {
        return;
    }

    let Some(voice) = synthesize::voice_for_language(&ctx.config.synthesize, &language) else {
        warn!(%language, %correlation_id, "no voice configured for language");
        PipelineMetrics::incr(&ctx.metrics.synthesize_failures);
        return;
    };

    let audio = match synthesize::synthesize_with_policy(
        &ctx.synthesizer,
        &ctx.config.synthesize,
        &ctx.metrics,
        &document,
        &voice,
    )
    .await
    {
        Ok(audio) => audio,
        Err(e) => {
            warn!(%language, %correlation_id, "synthesis failed: {e}");
            PipelineMetrics::incr(&ctx.metrics.synthesize_failures);
            return;
        }
    };

    let chunk = AudioChunk {
        data: audio,
        sample_rate: ctx.config.synthesize.sample_rate,
        encoding: AudioEncoding::Pcm16Le,
        utterance_id: utterance.utterance_id,
        target_language: language.clone(),
    };

    // Release the language permit before delivery: each listener send takes
    // its own permit, and nesting the two would deadlock a tight cap.
    drop(_permit);
    deliver_to_language(&ctx, chunk, &language, correlation_id).await;
}

/// Deliver one chunk to every listener of `language`, concurrently.
async fn deliver_to_language(
    ctx: &Arc<FanoutContext>,
    chunk: AudioChunk,
    language: &str,
    correlation_id: uuid::Uuid,
) {
    let listeners = ctx.session.listeners_for_language(language);
    if listeners.is_empty() {
        return;
    }

    let sends = listeners.into_iter().map(|listener| {
        let ctx = Arc::clone(ctx);
        let chunk = chunk.clone();
        async move {
            let _permit = match Arc::clone(&ctx.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            deliver_to_listener(&ctx, &listener.connection_id, chunk, correlation_id).await;
        }
    });
    futures_util::future::join_all(sends).await;
}

/// Push a chunk through one listener's buffer and drain it to the transport.
///
/// A "connection gone" send removes the listener from the session and
/// releases its buffer. Other transport errors re-queue the chunk so the
/// next round retries in order.
async fn deliver_to_listener(
    ctx: &Arc<FanoutContext>,
    connection_id: &str,
    chunk: AudioChunk,
    correlation_id: uuid::Uuid,
) {
    let _ = ctx.buffers.enqueue(connection_id, chunk);

    while let Some(chunk) = ctx.buffers.pop(connection_id) {
        match ctx.transport.send(connection_id, chunk.data.clone()).await {
            Ok(()) => {}
            Err(PipelineError::ConnectionGone(_)) => {
                warn!(connection_id, %correlation_id, "connection gone, removing listener");
                ctx.session.remove_listener(connection_id);
                ctx.buffers.clear(connection_id);
                PipelineMetrics::incr(&ctx.metrics.listeners_gone);
                return;
            }
            Err(e) => {
                debug!(connection_id, %correlation_id, "send failed, will retry next round: {e}");
                ctx.buffers.requeue_front(connection_id, chunk);
                return;
            }
        }
    }
}
