//! Transfer error taxonomy.

use serde::Serialize;
use thiserror::Error;
use veetr_core::ChannelError;

/// Discriminant of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    InvalidImage,
    InvalidConfig,
    JobAlreadyInProgress,
    InitializationFailed,
    ChunkTransferFailed,
    AckTimeout,
    ChunkRejected,
    Send,
    VerificationFailed,
    VerificationTimeout,
    ApplyFailed,
    SessionClosed,
    Aborted,
}

/// Why a firmware transfer stopped.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Invalid transfer settings: {0}")]
    InvalidConfig(String),
    #[error("A firmware transfer is already in progress")]
    JobAlreadyInProgress,
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Chunk {index} transfer failed: {cause}")]
    ChunkTransferFailed {
        index: u32,
        #[source]
        cause: Box<TransferError>,
    },
    #[error("No ack for chunk {0}")]
    AckTimeout(u32),
    #[error("Chunk {index} rejected: {}", .reason.as_deref().unwrap_or("no reason given"))]
    ChunkRejected { index: u32, reason: Option<String> },
    #[error(transparent)]
    Send(#[from] ChannelError),
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
    #[error("No verification result")]
    VerificationTimeout,
    #[error("Apply failed: {0}")]
    ApplyFailed(String),
    #[error("Session closed")]
    SessionClosed,
    #[error("Transfer aborted")]
    Aborted,
}

impl TransferError {
    #[must_use]
    pub const fn kind(&self) -> TransferErrorKind {
        match self {
            Self::InvalidImage(_) => TransferErrorKind::InvalidImage,
            Self::InvalidConfig(_) => TransferErrorKind::InvalidConfig,
            Self::JobAlreadyInProgress => TransferErrorKind::JobAlreadyInProgress,
            Self::InitializationFailed(_) => TransferErrorKind::InitializationFailed,
            Self::ChunkTransferFailed { .. } => TransferErrorKind::ChunkTransferFailed,
            Self::AckTimeout(_) => TransferErrorKind::AckTimeout,
            Self::ChunkRejected { .. } => TransferErrorKind::ChunkRejected,
            Self::Send(_) => TransferErrorKind::Send,
            Self::VerificationFailed(_) => TransferErrorKind::VerificationFailed,
            Self::VerificationTimeout => TransferErrorKind::VerificationTimeout,
            Self::ApplyFailed(_) => TransferErrorKind::ApplyFailed,
            Self::SessionClosed => TransferErrorKind::SessionClosed,
            Self::Aborted => TransferErrorKind::Aborted,
        }
    }

    /// Human-readable detail, where one exists.
    #[must_use]
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::InvalidImage(s)
            | Self::InvalidConfig(s)
            | Self::InitializationFailed(s)
            | Self::VerificationFailed(s)
            | Self::ApplyFailed(s) => Some(s.clone()),
            Self::ChunkTransferFailed { cause, .. } => Some(cause.to_string()),
            Self::ChunkRejected { reason, .. } => reason.clone(),
            Self::Send(e) => Some(e.to_string()),
            _ => None,
        }
    }

    /// Chunk index this error is about.
    #[must_use]
    pub const fn chunk_index(&self) -> Option<u32> {
        match self {
            Self::ChunkTransferFailed { index, .. } | Self::ChunkRejected { index, .. } => {
                Some(*index)
            }
            Self::AckTimeout(index) => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_chunk_failure_keeps_cause() {
        let err = TransferError::ChunkTransferFailed {
            index: 2,
            cause: Box::new(TransferError::AckTimeout(2)),
        };
        assert_eq!(err.kind(), TransferErrorKind::ChunkTransferFailed);
        assert_eq!(err.chunk_index(), Some(2));
        assert_eq!(err.to_string(), "Chunk 2 transfer failed: No ack for chunk 2");
        assert_eq!(err.source().unwrap().to_string(), "No ack for chunk 2");
    }

    #[test]
    fn test_detail() {
        let err = TransferError::VerificationFailed("checksum mismatch".into());
        assert_eq!(err.detail().as_deref(), Some("checksum mismatch"));
        assert_eq!(TransferError::VerificationTimeout.detail(), None);
        assert_eq!(
            TransferError::ChunkRejected {
                index: 1,
                reason: None
            }
            .to_string(),
            "Chunk 1 rejected: no reason given"
        );
    }

    #[test]
    fn test_send_error_not_double_prefixed() {
        let link = veetr_core::LinkError::Write("radio busy".into());
        let err = TransferError::from(ChannelError::from(link));
        assert_eq!(err.kind(), TransferErrorKind::Send);
        assert_eq!(err.to_string(), "Send failed: Write failed: radio busy");
    }
}
