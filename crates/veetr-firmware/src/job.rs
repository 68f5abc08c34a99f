//! One firmware update attempt.

use std::{ops::Range, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::error::TransferError;

/// Stage of a transfer job. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparing,
    Transferring,
    Verifying,
    Applying,
    Complete,
    Failed,
}

impl Stage {
    const fn rank(self) -> u8 {
        match self {
            Self::Preparing => 0,
            Self::Transferring => 1,
            Self::Verifying => 2,
            Self::Applying => 3,
            Self::Complete | Self::Failed => 4,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Bookkeeping for one image upload.
#[derive(Debug, Clone)]
pub struct TransferJob {
    total_bytes: usize,
    chunk_size: usize,
    chunk_count: u32,
    next_chunk_index: u32,
    stage: Stage,
    started_at: Instant,
    bytes_acked: usize,
}

impl TransferJob {
    /// Plan a job for `total_bytes` split into `chunk_size` slices.
    ///
    /// # Errors
    /// Returns `InvalidImage` if the image is empty or would need more
    /// chunks than an index can address.
    pub fn new(total_bytes: usize, chunk_size: usize) -> Result<Self, TransferError> {
        if total_bytes == 0 {
            return Err(TransferError::InvalidImage("image is empty".into()));
        }
        if chunk_size == 0 {
            return Err(TransferError::InvalidImage("chunk size is zero".into()));
        }
        let chunk_count = u32::try_from(total_bytes.div_ceil(chunk_size))
            .map_err(|_| TransferError::InvalidImage("image needs too many chunks".into()))?;

        Ok(Self {
            total_bytes,
            chunk_size,
            chunk_count,
            next_chunk_index: 0,
            stage: Stage::Preparing,
            started_at: Instant::now(),
            bytes_acked: 0,
        })
    }

    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub const fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[must_use]
    pub const fn next_chunk_index(&self) -> u32 {
        self.next_chunk_index
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub const fn bytes_acked(&self) -> usize {
        self.bytes_acked
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Byte range of chunk `index`. The last chunk may be short.
    #[must_use]
    pub fn chunk_range(&self, index: u32) -> Option<Range<usize>> {
        if index >= self.chunk_count {
            return None;
        }
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_bytes);
        Some(start..end)
    }

    /// Move to a later stage. Returns `false` (and changes nothing) if
    /// `stage` is not ahead of the current one or the job already ended.
    pub fn advance(&mut self, stage: Stage) -> bool {
        if self.stage.is_terminal() || stage.rank() <= self.stage.rank() {
            return false;
        }
        self.stage = stage;
        true
    }

    /// Mark the job failed. No-op once terminal.
    pub fn fail(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = Stage::Failed;
        }
    }

    /// Record an ack. Only the ack for the expected chunk advances the job.
    pub fn record_ack(&mut self, index: u32) -> bool {
        if self.stage != Stage::Transferring || index != self.next_chunk_index {
            return false;
        }
        let Some(range) = self.chunk_range(index) else {
            return false;
        };
        self.bytes_acked += range.len();
        self.next_chunk_index += 1;
        true
    }

    /// Whether every chunk has been acked.
    #[must_use]
    pub const fn all_acked(&self) -> bool {
        self.next_chunk_index == self.chunk_count
    }

    /// Transfer progress scaled to `0..=ceiling` percent.
    #[must_use]
    pub fn transfer_percent(&self, ceiling: u8) -> u8 {
        let scaled = (self.bytes_acked as u128 * u128::from(ceiling) * 2 + self.total_bytes as u128)
            / (self.total_bytes as u128 * 2);
        u8::try_from(scaled).unwrap_or(ceiling)
    }

    /// Remaining time extrapolated from the rate so far.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let elapsed = self.elapsed();
        if self.bytes_acked == 0 || elapsed.is_zero() {
            return None;
        }
        let remaining = (self.total_bytes - self.bytes_acked) as f64;
        let rate = self.bytes_acked as f64 / elapsed.as_secs_f64();
        Some(Duration::from_secs_f64(remaining / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_image_rejected() {
        let err = TransferJob::new(0, 200).unwrap_err();
        assert!(matches!(err, TransferError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_chunk_layout() {
        let job = TransferJob::new(1000, 200).unwrap();
        assert_eq!(job.chunk_count(), 5);
        assert_eq!(job.chunk_range(4), Some(800..1000));
        assert_eq!(job.chunk_range(5), None);

        let job = TransferJob::new(1001, 200).unwrap();
        assert_eq!(job.chunk_count(), 6);
        assert_eq!(job.chunk_range(5), Some(1000..1001));
    }

    #[tokio::test]
    async fn test_ack_only_advances_on_match() {
        let mut job = TransferJob::new(450, 200).unwrap();
        assert!(!job.record_ack(0)); // still preparing

        assert!(job.advance(Stage::Transferring));
        assert!(!job.record_ack(1));
        assert!(job.record_ack(0));
        assert!(!job.record_ack(0)); // duplicate
        assert_eq!(job.next_chunk_index(), 1);
        assert!(job.record_ack(1));
        assert!(job.record_ack(2));
        assert!(job.all_acked());
        assert_eq!(job.bytes_acked(), 450);
        assert_eq!(job.transfer_percent(90), 90);
    }

    #[tokio::test]
    async fn test_stages_move_forward_only() {
        let mut job = TransferJob::new(10, 200).unwrap();
        assert!(job.advance(Stage::Transferring));
        assert!(!job.advance(Stage::Preparing));
        assert!(!job.advance(Stage::Transferring));
        assert!(job.advance(Stage::Verifying));

        job.fail();
        assert_eq!(job.stage(), Stage::Failed);
        assert!(!job.advance(Stage::Applying));
        assert!(!job.advance(Stage::Complete));
    }

    #[tokio::test]
    async fn test_transfer_percent_rounds() {
        let mut job = TransferJob::new(1000, 200).unwrap();
        job.advance(Stage::Transferring);
        assert_eq!(job.transfer_percent(90), 0);
        job.record_ack(0);
        assert_eq!(job.transfer_percent(90), 18);
        job.record_ack(1);
        assert_eq!(job.transfer_percent(90), 36);

        let mut job = TransferJob::new(3, 1).unwrap();
        job.advance(Stage::Transferring);
        job.record_ack(0);
        // 1/3 of 90 is 30
        assert_eq!(job.transfer_percent(90), 30);
        job.record_ack(1);
        assert_eq!(job.transfer_percent(100), 67);
    }
}
