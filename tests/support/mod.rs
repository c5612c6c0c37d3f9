//! Shared fakes for integration tests.

use async_trait::async_trait;
use babelcast::error::{PipelineError, Result};
use babelcast::synthesize::{SynthesisRequest, Synthesizer};
use babelcast::translate::Translator;
use babelcast::transport::BroadcastTransport;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Translator that prefixes text with the target language; configurable
/// failing targets.
#[derive(Default)]
pub struct FakeTranslator {
    pub fail_languages: Vec<String>,
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, _src: &str, tgt: &str, text: &str) -> Result<String> {
        if self.fail_languages.iter().any(|l| l == tgt) {
            // Terminal (non-transient) failure so tests fail fast.
            return Err(PipelineError::Translate(format!("{tgt} rejected")));
        }
        Ok(format!("[{tgt}] {text}"))
    }
}

/// Synthesizer that returns the request body as audio bytes, optionally
/// padded to a fixed size so buffer-overflow paths can be exercised.
#[derive(Default)]
pub struct FakeSynthesizer {
    pub pad_to: usize,
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Bytes> {
        let mut body = request.body.clone().into_bytes();
        if body.len() < self.pad_to {
            body.resize(self.pad_to, 0);
        }
        Ok(Bytes::from(body))
    }
}

/// Transport that records deliveries and can simulate dead or stalled
/// connections.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<HashMap<String, Vec<Bytes>>>,
    gone: Mutex<Vec<String>>,
    stalled: AtomicBool,
}

impl FakeTransport {
    pub fn mark_gone(&self, connection_id: &str) {
        self.gone
            .lock()
            .expect("gone lock")
            .push(connection_id.to_owned());
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn sent_to(&self, connection_id: &str) -> Vec<Bytes> {
        self.sent
            .lock()
            .expect("sent lock")
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliveries to a connection, decoded as UTF-8 where possible.
    pub fn texts_to(&self, connection_id: &str) -> Vec<String> {
        self.sent_to(connection_id)
            .into_iter()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .collect()
    }
}

#[async_trait]
impl BroadcastTransport for FakeTransport {
    async fn send(&self, connection_id: &str, data: Bytes) -> Result<()> {
        if self.gone.lock().expect("gone lock").iter().any(|c| c == connection_id) {
            return Err(PipelineError::ConnectionGone(connection_id.to_owned()));
        }
        if self.stalled.load(Ordering::SeqCst) {
            return Err(PipelineError::Transport("socket busy".to_owned()));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .entry(connection_id.to_owned())
            .or_default()
            .push(data);
        Ok(())
    }

    async fn disconnect(&self, _connection_id: &str) -> Result<()> {
        Ok(())
    }
}
