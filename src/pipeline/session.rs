//! Per-session coordinator wiring the gate to the fan-out engine.
//!
//! Each session runs three stage workers connected by channels: the gate
//! worker (single logical owner of all gate state), the dynamics worker
//! (taps raw speaker audio), and the fan-out worker (serial per utterance,
//! parallel within one). A refresh worker nudges long-held connections. All
//! stages shut down together through one `CancellationToken`.

use crate::audio_buffer::AudioBufferManager;
use crate::cache::TranslationCache;
use crate::clock::SharedClock;
use crate::config::PipelineConfig;
use crate::dynamics::{AudioDynamics, DynamicsExtractor};
use crate::gate::PartialResultGate;
use crate::metrics::PipelineMetrics;
use crate::pipeline::fanout::{fan_out, FanoutContext};
use crate::pipeline::messages::{SpeakerAudio, Utterance};
use crate::registry::{BroadcastState, SessionHandle};
use crate::synthesize::Synthesizer;
use crate::transcript::{narrow_event, WireTranscriptEvent};
use crate::translate::Translator;
use crate::transport::{send_control, BroadcastTransport, ControlMessage, InboundControl};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel buffer sizes.
const EVENT_CHANNEL_SIZE: usize = 64;
const AUDIO_CHANNEL_SIZE: usize = 32;
const UTTERANCE_CHANNEL_SIZE: usize = 16;

/// Gate poll cadence; well under the 200 ms rate window.
const GATE_TICK: Duration = Duration::from_millis(50);
/// Refresh sweep cadence.
const REFRESH_TICK: Duration = Duration::from_secs(60);
/// Rolling speaker-audio retention for on-demand dynamics extraction.
const AUDIO_WINDOW_SECS: f64 = 30.0;
/// Extraction span when the utterance carries no end time.
const DEFAULT_EXTRACT_SECS: f64 = 2.0;

/// Shared between the dynamics worker (writer) and fan-out worker (reader).
struct DynamicsState {
    latest: Mutex<Option<AudioDynamics>>,
    window: Mutex<VecDeque<SpeakerAudio>>,
}

impl DynamicsState {
    fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            window: Mutex::new(VecDeque::new()),
        }
    }
}

/// Builder for one session's pipeline.
pub struct SessionPipeline {
    session: Arc<SessionHandle>,
    cache: Arc<TranslationCache>,
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn Synthesizer>,
    transport: Arc<dyn BroadcastTransport>,
    config: Arc<PipelineConfig>,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
}

impl SessionPipeline {
    /// Assemble a pipeline for `session` over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionHandle>,
        cache: Arc<TranslationCache>,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn Synthesizer>,
        transport: Arc<dyn BroadcastTransport>,
        config: Arc<PipelineConfig>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            session,
            cache,
            translator,
            synthesizer,
            transport,
            config,
            clock,
            metrics,
        }
    }

    /// Spawn the stage workers and hand back the session's channel ends.
    #[must_use]
    pub fn spawn(self) -> SessionPipelineHandle {
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel::<WireTranscriptEvent>(EVENT_CHANNEL_SIZE);
        let (audio_tx, audio_rx) = mpsc::channel::<SpeakerAudio>(AUDIO_CHANNEL_SIZE);
        let (utterance_tx, utterance_rx) = mpsc::channel::<Utterance>(UTTERANCE_CHANNEL_SIZE);

        let dynamics_state = Arc::new(DynamicsState::new());
        let buffers = Arc::new(AudioBufferManager::new(
            self.config.audio_buffer.max_bytes(),
            Arc::clone(&self.metrics),
        ));

        let fanout_ctx = Arc::new(FanoutContext {
            session: Arc::clone(&self.session),
            cache: Arc::clone(&self.cache),
            translator: Arc::clone(&self.translator),
            synthesizer: Arc::clone(&self.synthesizer),
            transport: Arc::clone(&self.transport),
            buffers: Arc::clone(&buffers),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            semaphore: Arc::new(Semaphore::new(self.config.session.max_concurrent_broadcasts)),
        });

        let mut tasks = Vec::new();

        // Stage 1: gate worker — sole owner of gate state.
        tasks.push({
            let gate = PartialResultGate::new(
                self.config.gate.clone(),
                &self.config.dedup,
                Arc::clone(&self.metrics),
            );
            let session = Arc::clone(&self.session);
            let clock = Arc::clone(&self.clock);
            let metrics = Arc::clone(&self.metrics);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_gate_stage(gate, session, event_rx, utterance_tx, clock, metrics, cancel).await;
            })
        });

        // Stage 2: dynamics tap on raw speaker audio.
        tasks.push({
            let extractor =
                DynamicsExtractor::new(Arc::clone(&self.clock), Arc::clone(&self.metrics));
            let state = Arc::clone(&dynamics_state);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_dynamics_stage(extractor, audio_rx, state, cancel).await;
            })
        });

        // Stage 3: fan-out — serial across utterances, parallel inside one.
        tasks.push({
            let ctx = Arc::clone(&fanout_ctx);
            let state = Arc::clone(&dynamics_state);
            let clock = Arc::clone(&self.clock);
            let config = Arc::clone(&self.config);
            let metrics = Arc::clone(&self.metrics);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_fanout_stage(ctx, state, utterance_rx, clock, config, metrics, cancel).await;
            })
        });

        // Stage 4: connection-refresh sweeps.
        tasks.push({
            let session = Arc::clone(&self.session);
            let transport = Arc::clone(&self.transport);
            let clock = Arc::clone(&self.clock);
            let threshold = Duration::from_secs(self.config.session.connection_refresh_minutes * 60);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_refresh_stage(session, transport, clock, threshold, cancel).await;
            })
        });

        info!(session_id = %self.session.info.session_id, "session pipeline started");

        SessionPipelineHandle {
            events: event_tx,
            speaker_audio: audio_tx,
            session: self.session,
            transport: self.transport,
            buffers,
            cancel,
            tasks,
        }
    }
}

/// Running pipeline for one session.
pub struct SessionPipelineHandle {
    /// Upstream transcript events feed in here.
    pub events: mpsc::Sender<WireTranscriptEvent>,
    /// Raw speaker audio windows feed in here.
    pub speaker_audio: mpsc::Sender<SpeakerAudio>,
    session: Arc<SessionHandle>,
    transport: Arc<dyn BroadcastTransport>,
    buffers: Arc<AudioBufferManager>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionPipelineHandle {
    /// The session this pipeline serves.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.session
    }

    /// Token observing this pipeline's shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply an inbound control-plane message.
    pub async fn handle_control(&self, control: InboundControl) {
        let message = match control {
            InboundControl::Pause => {
                self.session.set_broadcast_state(BroadcastState::Paused);
                Some(ControlMessage::BroadcastPaused)
            }
            InboundControl::Resume => {
                self.session.set_broadcast_state(BroadcastState::Active);
                Some(ControlMessage::BroadcastResumed)
            }
            InboundControl::Mute => {
                self.session.set_broadcast_state(BroadcastState::Muted);
                Some(ControlMessage::BroadcastMuted)
            }
            InboundControl::Unmute => {
                self.session.set_broadcast_state(BroadcastState::Active);
                Some(ControlMessage::BroadcastUnmuted)
            }
            InboundControl::SetVolume(volume) => {
                self.session.set_volume(volume);
                Some(ControlMessage::VolumeChanged {
                    volume: self.session.volume(),
                })
            }
            InboundControl::SessionEnded => {
                self.shutdown().await;
                None
            }
        };

        if let Some(message) = message {
            self.broadcast_control(&message).await;
        }
    }

    /// End the session: mark inactive, cancel all in-flight work, release
    /// listener buffers, and tell every listener the session ended.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(session_id = %self.session.info.session_id, "session pipeline shutting down");
        self.session.mark_inactive();
        self.cancel.cancel();

        self.broadcast_control(&ControlMessage::SessionEnded).await;
        for listener in self.session.listeners() {
            self.buffers.clear(&listener.connection_id);
        }
    }

    /// Wait for all stage workers to finish.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    async fn broadcast_control(&self, message: &ControlMessage) {
        for listener in self.session.listeners() {
            if let Err(e) =
                send_control(self.transport.as_ref(), &listener.connection_id, message).await
            {
                debug!(
                    connection_id = %listener.connection_id,
                    "control send failed: {e}"
                );
            }
        }
    }
}

/// Gate worker: narrows wire events, drives the gate state machine, and
/// forwards emitted utterances downstream.
async fn run_gate_stage(
    mut gate: PartialResultGate,
    session: Arc<SessionHandle>,
    mut event_rx: mpsc::Receiver<WireTranscriptEvent>,
    utterance_tx: mpsc::Sender<Utterance>,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let session_id = session.info.session_id.clone();
    let source_language = session.info.source_language.clone();
    let mut tick = tokio::time::interval(GATE_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                for utterance in gate.finish(clock.now()) {
                    let _ = utterance_tx.try_send(utterance);
                }
                break;
            }
            event = event_rx.recv() => {
                let Some(wire) = event else {
                    // Upstream closed: flush and stop.
                    for utterance in gate.finish(clock.now()) {
                        let _ = utterance_tx.try_send(utterance);
                    }
                    break;
                };
                match narrow_event(wire, &session_id, &source_language, clock.now()) {
                    Ok(event) => {
                        for utterance in gate.handle_event(event, clock.now()) {
                            if utterance_tx.send(utterance).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(reason) => {
                        warn!(session_id = %session_id, "dropping malformed event: {reason}");
                        PipelineMetrics::incr(&metrics.malformed_events);
                    }
                }
            }
            _ = tick.tick() => {
                for utterance in gate.poll(clock.now()) {
                    if utterance_tx.send(utterance).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!(session_id = %session_id, "gate stage stopped");
}

/// Dynamics worker: extracts prosody from each tapped audio window and keeps
/// a rolling window for on-demand extraction.
async fn run_dynamics_stage(
    extractor: DynamicsExtractor,
    mut audio_rx: mpsc::Receiver<SpeakerAudio>,
    state: Arc<DynamicsState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            audio = audio_rx.recv() => {
                let Some(audio) = audio else { break };
                let dynamics = extractor.extract(&audio.samples, audio.sample_rate);
                if let Ok(mut latest) = state.latest.lock() {
                    *latest = Some(dynamics);
                }
                if let Ok(mut window) = state.window.lock() {
                    window.push_back(audio);
                    trim_window(&mut window);
                }
            }
        }
    }
}

/// Drop windows older than the retention span, measured in audio seconds.
fn trim_window(window: &mut VecDeque<SpeakerAudio>) {
    let mut total_secs: f64 = window
        .iter()
        .map(|a| f64::from(a.samples.len() as u32) / f64::from(a.sample_rate.max(1)))
        .sum();
    while total_secs > AUDIO_WINDOW_SECS {
        let Some(dropped) = window.pop_front() else {
            break;
        };
        total_secs -= f64::from(dropped.samples.len() as u32) / f64::from(dropped.sample_rate.max(1));
    }
}

/// Fan-out worker: attaches dynamics, then fans each utterance out.
///
/// Utterances are handled one at a time so every listener sees them in gate
/// order; all parallelism lives inside [`fan_out`].
async fn run_fanout_stage(
    ctx: Arc<FanoutContext>,
    state: Arc<DynamicsState>,
    mut utterance_rx: mpsc::Receiver<Utterance>,
    clock: SharedClock,
    config: Arc<PipelineConfig>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let extractor = DynamicsExtractor::new(Arc::clone(&clock), Arc::clone(&metrics));
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            utterance = utterance_rx.recv() => {
                let Some(mut utterance) = utterance else { break };
                utterance.dynamics = Some(attach_dynamics(
                    &state,
                    &extractor,
                    &clock,
                    &config,
                    &utterance,
                ));
                fan_out(&ctx, utterance, &cancel).await;
            }
        }
    }
    debug!("fan-out stage stopped");
}

/// Pick dynamics for an utterance: a fresh tap extraction when available,
/// else an on-demand extraction over the rolling audio window, else the
/// neutral fallback.
fn attach_dynamics(
    state: &DynamicsState,
    extractor: &DynamicsExtractor,
    clock: &SharedClock,
    config: &PipelineConfig,
    utterance: &Utterance,
) -> AudioDynamics {
    let now = clock.now();
    let reuse_window = Duration::from_millis(config.session.dynamics_reuse_ms);

    if let Ok(latest) = state.latest.lock() {
        if let Some(dynamics) = *latest {
            if now.duration_since(dynamics.detected_at) < reuse_window {
                return dynamics;
            }
        }
    }

    // Extract over the trailing span the utterance covers. The rolling
    // window holds raw capture; an empty window falls through to the
    // extractor's own fallback.
    let span_secs = utterance
        .end_time
        .map(|end| (end - utterance.start_time).clamp(0.1, 30.0))
        .unwrap_or(DEFAULT_EXTRACT_SECS);

    let (samples, sample_rate) = match state.window.lock() {
        Ok(window) => {
            let sample_rate = window.back().map_or(16_000, |a| a.sample_rate);
            let want = (span_secs * f64::from(sample_rate)) as usize;
            let mut samples: Vec<f32> = Vec::with_capacity(want);
            for audio in window.iter().rev() {
                if samples.len() >= want {
                    break;
                }
                // Prepend windows until the span is covered.
                let take = (want - samples.len()).min(audio.samples.len());
                let start = audio.samples.len() - take;
                samples.splice(0..0, audio.samples[start..].iter().copied());
            }
            (samples, sample_rate)
        }
        Err(_) => (Vec::new(), 16_000),
    };

    extractor.extract(&samples, sample_rate)
}

/// Refresh worker: tells long-held connections to reconnect.
async fn run_refresh_stage(
    session: Arc<SessionHandle>,
    transport: Arc<dyn BroadcastTransport>,
    clock: SharedClock,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(REFRESH_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {
                for connection_id in session.connections_needing_refresh(threshold, clock.now()) {
                    debug!(%connection_id, "connection refresh required");
                    let _ = send_control(
                        transport.as_ref(),
                        &connection_id,
                        &ControlMessage::ConnectionRefreshRequired,
                    )
                    .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Instant;

    fn audio(secs: f64, sample_rate: u32, captured_at: Instant) -> SpeakerAudio {
        SpeakerAudio {
            samples: vec![0.1; (secs * f64::from(sample_rate)) as usize],
            sample_rate,
            captured_at,
        }
    }

    #[test]
    fn trim_window_bounds_retention() {
        let mut window = VecDeque::new();
        for _ in 0..40 {
            window.push_back(audio(1.0, 16_000, Instant::now()));
        }
        trim_window(&mut window);
        let total: usize = window.iter().map(|a| a.samples.len()).sum();
        assert!(total <= (AUDIO_WINDOW_SECS * 16_000.0) as usize);
    }

    #[test]
    fn attach_dynamics_reuses_fresh_extraction() {
        let clock = ManualClock::new();
        let shared: SharedClock = Arc::new(clock.clone());
        let metrics = PipelineMetrics::new();
        let extractor = DynamicsExtractor::new(Arc::clone(&shared), Arc::clone(&metrics));
        let config = PipelineConfig::default();
        let state = DynamicsState::new();

        let fresh = extractor.extract(&vec![0.5f32; 16_000], 16_000);
        *state.latest.lock().unwrap() = Some(fresh);

        let utterance = Utterance::new(
            "s1".into(),
            "en".into(),
            "hi".into(),
            0.0,
            None,
            clock.now(),
        );
        let picked = attach_dynamics(&state, &extractor, &shared, &config, &utterance);
        assert_eq!(picked, fresh);

        // Once stale, the (empty) rolling window forces a fallback result.
        clock.advance(Duration::from_secs(2));
        let picked = attach_dynamics(&state, &extractor, &shared, &config, &utterance);
        assert_ne!(picked.detected_at, fresh.detected_at);
        assert_eq!(picked.onset_count, 0);
    }

    #[test]
    fn attach_dynamics_extracts_from_rolling_window() {
        let clock = ManualClock::new();
        let shared: SharedClock = Arc::new(clock.clone());
        let metrics = PipelineMetrics::new();
        let extractor = DynamicsExtractor::new(Arc::clone(&shared), Arc::clone(&metrics));
        let config = PipelineConfig::default();
        let state = DynamicsState::new();

        state
            .window
            .lock()
            .unwrap()
            .push_back(audio(3.0, 16_000, clock.now()));

        let utterance = Utterance::new(
            "s1".into(),
            "en".into(),
            "hi".into(),
            1.0,
            Some(3.0),
            clock.now(),
        );
        let picked = attach_dynamics(&state, &extractor, &shared, &config, &utterance);
        // Constant 0.1 samples: quiet but not silent, no fallback values.
        assert!(picked.db_value > -100.0);
        assert!((picked.db_value - (-15.0)).abs() > f32::EPSILON);
    }
}
