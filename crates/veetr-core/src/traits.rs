//! Core traits for transports and command channels.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::wire::{self, CodecError, Command, MAX_ENVELOPE_BYTES, Notice};

/// Session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No link is held.
    #[default]
    Disconnected,
    /// Discovery/attach in progress.
    Connecting,
    /// Link attached and subscribed.
    Connected,
}

/// Link quality bucket derived from the reported RSSI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

impl SignalQuality {
    /// Classify a raw RSSI reading (dBm).
    #[must_use]
    pub const fn from_rssi(rssi: i16) -> Self {
        match rssi {
            -50.. => Self::Excellent,
            -60.. => Self::Good,
            -70.. => Self::Fair,
            _ => Self::Poor,
        }
    }
}

/// Why the last connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The platform offers no compatible transport.
    TransportUnavailable,
    /// Discovery found no matching unit.
    DeviceNotFound,
    /// The operator aborted discovery, or a disconnect superseded the attempt.
    UserCancelled,
    /// A unit was found but attaching to it failed.
    AttachFailed,
}

/// Link error.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Attach cancelled")]
    Cancelled,
    #[error("Attach failed: {0}")]
    AttachFailed(String),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Link closed")]
    Closed,
}

impl LinkError {
    /// Map an attach failure onto the session's error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::TransportUnavailable,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::Cancelled => ErrorKind::UserCancelled,
            Self::AttachFailed(_) | Self::Write(_) | Self::Closed => ErrorKind::AttachFailed,
        }
    }
}

/// Outbound half of an attached link.
#[async_trait]
pub trait LinkWriter: Send + Sync {
    /// Write one payload as a single transport message.
    async fn write(&self, payload: &[u8]) -> Result<(), LinkError>;

    /// Tear the link down.
    async fn close(&self) -> Result<(), LinkError>;
}

/// Inbound notification payloads. The stream ends when the link is lost.
pub type Inbound = BoxStream<'static, Vec<u8>>;

/// An attached, subscribed link to one remote unit.
pub struct Link {
    /// Human-readable name the unit advertises.
    pub label: Option<String>,
    /// Outbound write primitive.
    pub writer: Arc<dyn LinkWriter>,
    /// Inbound notifications, already subscribed.
    pub inbound: Inbound,
}

/// Trait for transports that can discover and attach to a remote unit.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover a unit and attach to it.
    ///
    /// Implementations must subscribe to notifications before returning.
    async fn attach(&self) -> Result<Link, LinkError>;
}

/// Channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<LinkError> for ChannelError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Closed => Self::Closed,
            other => Self::Send(other.to_string()),
        }
    }
}

/// Bidirectional message channel to the remote unit.
///
/// Has no retry logic of its own: one `send` is one transport write.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Write one encoded envelope.
    async fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Subscribe to inbound notices delivered from now on.
    fn subscribe(&self) -> broadcast::Receiver<Notice>;

    /// Watch that flips to `true` once the channel is closed.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Transport's single-message limit.
    fn max_envelope_bytes(&self) -> usize {
        MAX_ENVELOPE_BYTES
    }

    /// Whether the channel has been closed.
    fn is_closed(&self) -> bool {
        *self.closed().borrow()
    }

    /// Encode and send a firmware command.
    async fn send_command(&self, command: &Command) -> Result<(), ChannelError> {
        let payload = wire::encode(command, self.max_envelope_bytes())?;
        tracing::debug!(cmd = command.name(), bytes = payload.len(), "Sending command");
        self.send(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_quality_thresholds() {
        assert_eq!(SignalQuality::from_rssi(-40), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-50), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-51), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-60), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-70), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rssi(-71), SignalQuality::Poor);
        assert_eq!(SignalQuality::from_rssi(-80), SignalQuality::Poor);
        assert_eq!(SignalQuality::from_rssi(-95), SignalQuality::Poor);
    }

    #[test]
    fn test_link_error_kind() {
        assert_eq!(
            LinkError::Unavailable("no adapter".into()).kind(),
            ErrorKind::TransportUnavailable
        );
        assert_eq!(
            LinkError::DeviceNotFound("Veetr".into()).kind(),
            ErrorKind::DeviceNotFound
        );
        assert_eq!(LinkError::Cancelled.kind(), ErrorKind::UserCancelled);
        assert_eq!(
            LinkError::AttachFailed("gatt".into()).kind(),
            ErrorKind::AttachFailed
        );
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Connecting).unwrap();
        assert_eq!(json, r#""connecting""#);
    }
}
