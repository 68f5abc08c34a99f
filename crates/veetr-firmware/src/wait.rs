//! Waiting for one specific notice from the unit.

use std::time::Duration;

use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    time::Instant,
};
use veetr_core::Notice;

/// Which inbound notice a wait is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// `chunk_ack` or `chunk_error` for this index.
    Chunk(u32),
    MemoryInfo,
    VerifyResult,
    FirmwareVersion,
}

impl Matcher {
    #[must_use]
    pub const fn matches(self, notice: &Notice) -> bool {
        match (self, notice) {
            (Self::Chunk(expected), Notice::ChunkAck { index } | Notice::ChunkError { index, .. }) => {
                *index == expected
            }
            (Self::MemoryInfo, Notice::MemoryInfo { .. })
            | (Self::VerifyResult, Notice::VerifyComplete { .. })
            | (Self::FirmwareVersion, Notice::FirmwareVersion { .. }) => true,
            _ => false,
        }
    }
}

/// How a wait ended without its notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Closed,
    Aborted,
}

/// Resolves once `rx` reads `true`. A dropped sender counts as `dropped`.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>, dropped: bool) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if dropped {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// The single outstanding expectation of a transfer.
///
/// Consumed by [`resolve`](Self::resolve), so it ends exactly once: matched,
/// timed out, closed or aborted.
#[derive(Debug)]
pub struct PendingWait {
    matcher: Matcher,
    deadline: Instant,
}

impl PendingWait {
    #[must_use]
    pub fn new(matcher: Matcher, timeout: Duration) -> Self {
        Self {
            matcher,
            deadline: Instant::now() + timeout,
        }
    }

    #[must_use]
    pub const fn matcher(&self) -> Matcher {
        self.matcher
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Read notices until one matches, skipping everything else.
    ///
    /// # Errors
    /// Returns the reason the wait ended without a match.
    pub async fn resolve(
        self,
        notices: &mut broadcast::Receiver<Notice>,
        closed: &mut watch::Receiver<bool>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<Notice, WaitError> {
        let sleep = tokio::time::sleep_until(self.deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = raised(abort, false) => return Err(WaitError::Aborted),
                () = raised(closed, true) => return Err(WaitError::Closed),
                received = notices.recv() => match received {
                    Ok(notice) if self.matcher.matches(&notice) => return Ok(notice),
                    Ok(notice) => tracing::debug!(
                        kind = ?notice.kind(),
                        index = ?notice.index(),
                        expected = ?self.matcher,
                        "Ignoring notice"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notice receiver lagged");
                    }
                    Err(RecvError::Closed) => return Err(WaitError::Closed),
                },
                () = &mut sleep => return Err(WaitError::Timeout),
            }
        }
    }
}
