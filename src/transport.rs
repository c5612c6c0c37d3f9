//! Broadcast transport seam and control messages.
//!
//! The core does not speak any wire protocol itself; it assumes a
//! byte-delivery contract plus a "connection gone" signal, both behind the
//! [`BroadcastTransport`] trait. Control messages are JSON documents sent
//! over the same byte channel.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// Byte-delivery transport to listener connections.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Deliver bytes to a connection.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ConnectionGone`] when the connection is dead
    /// (the caller removes the listener), or a transport error otherwise.
    async fn send(&self, connection_id: &str, data: Bytes) -> Result<()>;

    /// Tear down a connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the disconnect could not be issued.
    async fn disconnect(&self, connection_id: &str) -> Result<()>;
}

/// Outbound control messages to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// The session has ended; no more audio will arrive.
    SessionEnded,
    /// The connection has been held long enough that the client must
    /// reconnect.
    ConnectionRefreshRequired,
    /// Delivery paused by the speaker.
    BroadcastPaused,
    /// Delivery resumed.
    BroadcastResumed,
    /// Audio muted.
    BroadcastMuted,
    /// Audio unmuted.
    BroadcastUnmuted,
    /// Speaker changed the broadcast volume.
    VolumeChanged {
        /// New volume in [0,1].
        volume: f64,
    },
}

/// Inbound control messages understood by the core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InboundControl {
    /// Suspend delivery.
    Pause,
    /// Resume delivery.
    Resume,
    /// Mute audio.
    Mute,
    /// Unmute audio.
    Unmute,
    /// Set broadcast volume.
    SetVolume(f64),
    /// The control plane ended the session.
    SessionEnded,
}

/// Serialize and send a control message to one connection.
///
/// # Errors
///
/// Propagates transport errors, including `ConnectionGone`.
pub async fn send_control(
    transport: &dyn BroadcastTransport,
    connection_id: &str,
    message: &ControlMessage,
) -> Result<()> {
    let body = serde_json::to_vec(message)
        .map_err(|e| PipelineError::Transport(format!("control message encode: {e}")))?;
    transport.send(connection_id, Bytes::from(body)).await
}
