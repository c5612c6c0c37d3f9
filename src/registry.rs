//! Process-wide directory of live sessions and their listeners.
//!
//! The registry exclusively owns all sessions; each session exclusively owns
//! its listener set. Listener counts are atomic with a floor of zero — the
//! count may transiently exceed the listener-set size while a connection
//! refresh overlaps (new connection joins before the old one disconnects),
//! and that is permitted by design of the refresh handshake.

use crate::clock::SharedClock;
use crate::error::{PipelineError, Result};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Printable session slug.
pub type SessionId = String;
/// Opaque transport connection handle.
pub type ConnectionId = String;

/// Broadcast delivery state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    /// Delivering audio.
    Active,
    /// Delivery suspended by the speaker.
    Paused,
    /// Audio muted; control traffic continues.
    Muted,
}

/// A listener connection within a session.
#[derive(Debug, Clone)]
pub struct Listener {
    /// Transport connection handle.
    pub connection_id: ConnectionId,
    /// Language this listener hears (ISO 639-1).
    pub target_language: String,
    /// When the connection joined.
    pub joined_at: Instant,
    /// TTL attribute, epoch seconds.
    pub expires_at: i64,
}

/// Immutable session attributes.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Printable slug.
    pub session_id: SessionId,
    /// Speaker's language (ISO 639-1).
    pub source_language: String,
    /// Speaker identity handle.
    pub speaker_id: String,
    /// Creation time, wall clock.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// TTL attribute, epoch seconds.
    pub expires_at: i64,
}

#[derive(Debug)]
struct BroadcastControl {
    state: BroadcastState,
    volume: f64,
    active: bool,
}

/// One live session: metadata, broadcast state, and the listener set.
pub struct SessionHandle {
    /// Immutable attributes.
    pub info: SessionInfo,
    control: Mutex<BroadcastControl>,
    listeners: Mutex<HashMap<ConnectionId, Listener>>,
    listener_count: AtomicI64,
}

impl SessionHandle {
    fn new(info: SessionInfo) -> Self {
        Self {
            info,
            control: Mutex::new(BroadcastControl {
                state: BroadcastState::Active,
                volume: 1.0,
                active: true,
            }),
            listeners: Mutex::new(HashMap::new()),
            listener_count: AtomicI64::new(0),
        }
    }

    /// Register a listener connection.
    ///
    /// Re-joining with an existing connection id replaces the record without
    /// double-counting.
    pub fn add_listener(&self, listener: Listener) {
        let mut listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let replaced = listeners
            .insert(listener.connection_id.clone(), listener)
            .is_some();
        if !replaced {
            self.listener_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Remove a listener connection, decrementing the count with a floor of
    /// zero.
    pub fn remove_listener(&self, connection_id: &str) -> Option<Listener> {
        let removed = {
            let mut listeners = match self.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.remove(connection_id)
        };
        if removed.is_some() {
            let _ = self
                .listener_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                    (count > 0).then(|| count - 1)
                });
        }
        removed
    }

    /// Snapshot of all listeners.
    #[must_use]
    pub fn listeners(&self) -> Vec<Listener> {
        match self.listeners.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    /// Snapshot of listeners whose target language matches.
    #[must_use]
    pub fn listeners_for_language(&self, language: &str) -> Vec<Listener> {
        self.listeners()
            .into_iter()
            .filter(|l| l.target_language == language)
            .collect()
    }

    /// Distinct target languages across live listeners.
    #[must_use]
    pub fn target_languages(&self) -> BTreeSet<String> {
        self.listeners()
            .into_iter()
            .map(|l| l.target_language)
            .collect()
    }

    /// Atomic listener count (never below zero).
    #[must_use]
    pub fn listener_count(&self) -> i64 {
        self.listener_count.load(Ordering::SeqCst).max(0)
    }

    /// Current broadcast state.
    #[must_use]
    pub fn broadcast_state(&self) -> BroadcastState {
        match self.control.lock() {
            Ok(guard) => guard.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    /// Update the broadcast state.
    pub fn set_broadcast_state(&self, state: BroadcastState) {
        let mut control = match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        control.state = state;
    }

    /// Current volume in [0,1].
    #[must_use]
    pub fn volume(&self) -> f64 {
        match self.control.lock() {
            Ok(guard) => guard.volume,
            Err(poisoned) => poisoned.into_inner().volume,
        }
    }

    /// Set the volume, clamped to [0,1].
    pub fn set_volume(&self, volume: f64) {
        let mut control = match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        control.volume = volume.clamp(0.0, 1.0);
    }

    /// Whether audio should currently be delivered.
    #[must_use]
    pub fn delivery_enabled(&self) -> bool {
        let control = match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        control.active && control.state == BroadcastState::Active
    }

    /// Mark the session inactive (speaker disconnect or explicit delete).
    pub fn mark_inactive(&self) {
        let mut control = match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        control.active = false;
    }

    /// Whether the session is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match self.control.lock() {
            Ok(guard) => guard.active,
            Err(poisoned) => poisoned.into_inner().active,
        }
    }

    /// Connections that have held a single connection past `threshold` and
    /// should be told to refresh.
    #[must_use]
    pub fn connections_needing_refresh(&self, threshold: Duration, now: Instant) -> Vec<ConnectionId> {
        self.listeners()
            .into_iter()
            .filter(|l| now.duration_since(l.joined_at) >= threshold)
            .map(|l| l.connection_id)
            .collect()
    }
}

/// Process-wide map from session id to live session.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    clock: SharedClock,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
        }
    }

    /// Create a session.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if the id is already registered.
    pub fn create_session(
        &self,
        session_id: &str,
        source_language: &str,
        speaker_id: &str,
        max_duration: Duration,
    ) -> Result<Arc<SessionHandle>> {
        let created_at = chrono::Utc::now();
        let expires_at = created_at.timestamp() + max_duration.as_secs() as i64;
        let info = SessionInfo {
            session_id: session_id.to_owned(),
            source_language: source_language.to_owned(),
            speaker_id: speaker_id.to_owned(),
            created_at,
            expires_at,
        };

        let handle = Arc::new(SessionHandle::new(info));
        match self.sessions.entry(session_id.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PipelineError::Pipeline(format!(
                "session {session_id} already exists"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                info!(session_id, source_language, "session created");
                Ok(handle)
            }
        }
    }

    /// Look up a session.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SessionNotFound`] for unknown ids.
    pub fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_owned()))
    }

    /// Register a listener in a session.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SessionNotFound`] for unknown ids.
    pub fn add_listener(
        &self,
        session_id: &str,
        connection_id: &str,
        target_language: &str,
        ttl: Duration,
    ) -> Result<()> {
        let session = self.get(session_id)?;
        let now = self.clock.now();
        session.add_listener(Listener {
            connection_id: connection_id.to_owned(),
            target_language: target_language.to_owned(),
            joined_at: now,
            expires_at: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
        });
        info!(session_id, connection_id, target_language, "listener joined");
        Ok(())
    }

    /// Remove a listener from a session, if both exist.
    pub fn remove_listener(&self, session_id: &str, connection_id: &str) -> Option<Listener> {
        let session = self.get(session_id).ok()?;
        let removed = session.remove_listener(connection_id);
        if removed.is_some() {
            info!(session_id, connection_id, "listener removed");
        }
        removed
    }

    /// Remove a session entirely, returning its handle for teardown.
    pub fn delete(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(session_id).map(|(_, handle)| handle);
        match &removed {
            Some(handle) => {
                handle.mark_inactive();
                info!(session_id, "session deleted");
            }
            None => warn!(session_id, "delete for unknown session"),
        }
        removed
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
