//! Firmware transfer engine.
//!
//! Drives one image through start, chunked upload, verify and apply over a
//! [`CommandChannel`]. One chunk is outstanding at a time; the next is sent
//! only after the unit acks the current index.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch},
    time::Instant,
};
use veetr_core::{ChannelError, Command, CommandChannel, ConfigError, Notice, TransferConfig};

use crate::{
    error::TransferError,
    job::{Stage, TransferJob},
    wait::{Matcher, PendingWait, WaitError, raised},
};

const VERIFY_PERCENT: u8 = 95;
const APPLY_PERCENT: u8 = 98;
const COMPLETE_PERCENT: u8 = 100;

/// Snapshot of a running transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub stage: Stage,
    pub percent: u8,
    pub bytes_acked: usize,
    pub total_bytes: usize,
    pub chunks_acked: u32,
    pub chunk_count: u32,
    pub elapsed: Duration,
    /// Estimated time left, from the observed transfer rate.
    pub eta: Option<Duration>,
    pub message: String,
}

struct BusyGuard<'a>(&'a TransferEngine);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let engine = self.0;
        engine.abort.send_if_modified(|_| {
            engine.busy.store(false, Ordering::Release);
            false
        });
    }
}

/// Runs firmware transfers, one at a time.
pub struct TransferEngine {
    config: TransferConfig,
    busy: AtomicBool,
    abort: watch::Sender<bool>,
    progress: watch::Sender<Option<TransferProgress>>,
}

impl TransferEngine {
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        let (abort, _) = watch::channel(false);
        let (progress, _) = watch::channel(None);
        Self {
            config,
            busy: AtomicBool::new(false),
            abort,
            progress,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Progress of the current or last transfer. `None` before the first.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Option<TransferProgress>> {
        self.progress.subscribe()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Stop the running transfer. No further commands are sent and the
    /// pending wait ends with [`TransferError::Aborted`]. The unit is not
    /// told; it drops its partial update on its own timeout.
    pub fn abort(&self) {
        // busy and the flag only change under the watch lock
        let raised = self.abort.send_if_modified(|aborted| {
            if !self.is_busy() || *aborted {
                return false;
            }
            *aborted = true;
            true
        });
        if raised {
            tracing::info!("Aborting firmware transfer");
        }
    }

    /// Mark the engine busy and clear a previous job's abort.
    fn claim(&self) -> bool {
        let mut claimed = false;
        self.abort.send_if_modified(|aborted| {
            claimed = self
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if claimed {
                *aborted = false;
            }
            false
        });
        claimed
    }

    /// Upload, verify and apply `image`.
    ///
    /// Returns the finished job. The unit reboots after apply, so the
    /// channel should be considered dead once this returns `Ok`.
    ///
    /// # Errors
    /// Returns [`TransferError::InvalidConfig`] before any traffic if the
    /// settings do not fit the channel. Otherwise returns the first fatal
    /// error; the job is then `Failed` and nothing more is sent. A new
    /// attempt always restarts from chunk 0.
    pub async fn run(
        &self,
        channel: &dyn CommandChannel,
        image: Bytes,
    ) -> Result<TransferJob, TransferError> {
        self.config
            .validate(channel.max_envelope_bytes())
            .map_err(|e| match e {
                ConfigError::Invalid(reason) => TransferError::InvalidConfig(reason),
                other => TransferError::InvalidConfig(other.to_string()),
            })?;
        let mut job = TransferJob::new(image.len(), self.config.chunk_size)?;
        if image.len() > self.config.max_image_bytes {
            return Err(TransferError::InvalidImage(format!(
                "image is {} bytes, the unit holds at most {}",
                image.len(),
                self.config.max_image_bytes
            )));
        }
        let size = u32::try_from(image.len())
            .map_err(|_| TransferError::InvalidImage("image is too large".into()))?;

        if !self.claim() {
            return Err(TransferError::JobAlreadyInProgress);
        }
        let _busy = BusyGuard(self);

        let mut run = Run {
            engine: self,
            channel,
            // subscribe before the first send so no reply can be missed
            notices: channel.subscribe(),
            closed: channel.closed(),
            abort: self.abort.subscribe(),
        };

        tracing::info!(
            bytes = job.total_bytes(),
            chunks = job.chunk_count(),
            "Starting firmware transfer"
        );
        match run.execute(&mut job, &image, size).await {
            Ok(()) => {
                tracing::info!(elapsed = ?job.elapsed(), "Firmware transfer complete");
                Ok(job)
            }
            Err(e) => {
                job.fail();
                self.publish(&job, format!("Update failed: {e}"));
                tracing::error!(kind = ?e.kind(), "Firmware transfer failed: {e}");
                Err(e)
            }
        }
    }

    fn publish(&self, job: &TransferJob, message: String) {
        let ceiling = self.config.transfer_progress_ceiling.min(VERIFY_PERCENT);
        let percent = match job.stage() {
            Stage::Preparing => 0,
            Stage::Transferring => job.transfer_percent(ceiling),
            Stage::Verifying => VERIFY_PERCENT,
            Stage::Applying => APPLY_PERCENT,
            Stage::Complete => COMPLETE_PERCENT,
            Stage::Failed => self.progress.borrow().as_ref().map_or(0, |p| p.percent),
        };
        let eta = (job.stage() == Stage::Transferring)
            .then(|| job.eta())
            .flatten();

        tracing::debug!(stage = ?job.stage(), percent, "{message}");
        self.progress.send_replace(Some(TransferProgress {
            stage: job.stage(),
            percent,
            bytes_acked: job.bytes_acked(),
            total_bytes: job.total_bytes(),
            chunks_acked: job.next_chunk_index(),
            chunk_count: job.chunk_count(),
            elapsed: job.elapsed(),
            eta,
            message,
        }));
    }
}

/// State of one `run` call.
struct Run<'a> {
    engine: &'a TransferEngine,
    channel: &'a dyn CommandChannel,
    notices: broadcast::Receiver<Notice>,
    closed: watch::Receiver<bool>,
    abort: watch::Receiver<bool>,
}

impl Run<'_> {
    fn config(&self) -> &TransferConfig {
        &self.engine.config
    }

    async fn execute(
        &mut self,
        job: &mut TransferJob,
        image: &Bytes,
        size: u32,
    ) -> Result<(), TransferError> {
        self.engine
            .publish(job, "Preparing device for update...".into());
        self.prepare(size).await?;

        job.advance(Stage::Transferring);
        self.engine.publish(job, "Uploading firmware...".into());
        self.transfer(job, image).await?;

        job.advance(Stage::Verifying);
        self.engine.publish(job, "Verifying firmware...".into());
        self.verify().await?;

        job.advance(Stage::Applying);
        self.engine
            .publish(job, "Applying firmware update...".into());
        self.apply().await?;

        job.advance(Stage::Complete);
        self.engine.publish(
            job,
            "Firmware update complete. The unit is restarting.".into(),
        );
        Ok(())
    }

    /// Fail fast if the job was aborted or the link went away.
    fn check(&self) -> Result<(), TransferError> {
        if *self.abort.borrow() {
            return Err(TransferError::Aborted);
        }
        if *self.closed.borrow() {
            return Err(TransferError::SessionClosed);
        }
        Ok(())
    }

    async fn send(&self, command: &Command) -> Result<(), TransferError> {
        self.check()?;
        match self.channel.send_command(command).await {
            Ok(()) => Ok(()),
            Err(ChannelError::Closed) => Err(TransferError::SessionClosed),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&mut self, matcher: Matcher, timeout: Duration) -> Result<Notice, WaitError> {
        PendingWait::new(matcher, timeout)
            .resolve(&mut self.notices, &mut self.closed, &mut self.abort)
            .await
    }

    /// Sleep until `deadline` unless aborted or closed first.
    async fn idle(&mut self, deadline: Instant) -> Result<(), TransferError> {
        tokio::select! {
            biased;
            () = raised(&mut self.abort, false) => Err(TransferError::Aborted),
            () = raised(&mut self.closed, true) => Err(TransferError::SessionClosed),
            () = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }

    async fn prepare(&mut self, size: u32) -> Result<(), TransferError> {
        let attempts = self.config().init_attempts;
        let mut attempt = 1;
        loop {
            match self.send(&Command::StartFirmwareUpdate { size }).await {
                Ok(()) => break,
                Err(e @ (TransferError::SessionClosed | TransferError::Aborted)) => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(TransferError::InitializationFailed(format!(
                        "start request failed after {attempts} attempts: {e}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(attempt, "Start request failed: {e}");
                    let delay = self.config().init_retry_delay();
                    self.idle(Instant::now() + delay).await?;
                    attempt += 1;
                }
            }
        }

        // the unit needs time to erase its update slot; it may report
        // its storage in the meantime
        let settle = PendingWait::new(Matcher::MemoryInfo, self.config().init_settle());
        let settled_at = settle.deadline();
        match settle
            .resolve(&mut self.notices, &mut self.closed, &mut self.abort)
            .await
        {
            Ok(Notice::MemoryInfo {
                sufficient: false,
                required,
                available,
                ..
            }) => {
                return Err(TransferError::InitializationFailed(format!(
                    "insufficient storage: {required} bytes needed, {available} available"
                )));
            }
            Ok(_) | Err(WaitError::Timeout) => {}
            Err(WaitError::Closed) => return Err(TransferError::SessionClosed),
            Err(WaitError::Aborted) => return Err(TransferError::Aborted),
        }
        self.idle(settled_at).await
    }

    async fn transfer(&mut self, job: &mut TransferJob, image: &Bytes) -> Result<(), TransferError> {
        while !job.all_acked() {
            let index = job.next_chunk_index();
            let Some(range) = job.chunk_range(index) else {
                break;
            };
            let command = Command::chunk(index, &image.slice(range));
            self.send_chunk(index, &command).await?;

            job.record_ack(index);
            self.engine.publish(
                job,
                format!(
                    "Uploading firmware... (chunk {}/{})",
                    job.next_chunk_index(),
                    job.chunk_count()
                ),
            );
        }
        Ok(())
    }

    /// Send one chunk until it is acked or attempts run out.
    async fn send_chunk(&mut self, index: u32, command: &Command) -> Result<(), TransferError> {
        let attempts = self.config().chunk_attempts;
        let mut attempt = 1;
        loop {
            let cause = match self.send(command).await {
                Err(e @ (TransferError::SessionClosed | TransferError::Aborted)) => return Err(e),
                Err(e) => e,
                Ok(()) => match self.wait(Matcher::Chunk(index), self.config().ack_timeout()).await
                {
                    Ok(Notice::ChunkError { error, .. }) => TransferError::ChunkRejected {
                        index,
                        reason: error,
                    },
                    Ok(_) => return Ok(()),
                    Err(WaitError::Timeout) => TransferError::AckTimeout(index),
                    Err(WaitError::Closed) => return Err(TransferError::SessionClosed),
                    Err(WaitError::Aborted) => return Err(TransferError::Aborted),
                },
            };

            if attempt >= attempts {
                return Err(TransferError::ChunkTransferFailed {
                    index,
                    cause: Box::new(cause),
                });
            }
            tracing::warn!(index, attempt, "Chunk attempt failed: {cause}");
            let delay = self.config().chunk_retry_delay();
            self.idle(Instant::now() + delay).await?;
            attempt += 1;
        }
    }

    async fn verify(&mut self) -> Result<(), TransferError> {
        match self.send(&Command::VerifyFirmware).await {
            Ok(()) => {}
            Err(e @ (TransferError::SessionClosed | TransferError::Aborted)) => return Err(e),
            Err(e) => {
                return Err(TransferError::VerificationFailed(format!(
                    "verify request failed: {e}"
                )));
            }
        }

        match self
            .wait(Matcher::VerifyResult, self.config().verify_timeout())
            .await
        {
            Ok(Notice::VerifyComplete { success: true, .. }) => Ok(()),
            Ok(Notice::VerifyComplete { error, .. }) => Err(TransferError::VerificationFailed(
                error.unwrap_or_else(|| "verification failed".into()),
            )),
            Ok(_) | Err(WaitError::Timeout) => Err(TransferError::VerificationTimeout),
            Err(WaitError::Closed) => Err(TransferError::SessionClosed),
            Err(WaitError::Aborted) => Err(TransferError::Aborted),
        }
    }

    async fn apply(&self) -> Result<(), TransferError> {
        // the unit reboots without replying
        match self.send(&Command::ApplyFirmware).await {
            Ok(()) => Ok(()),
            Err(e @ (TransferError::SessionClosed | TransferError::Aborted)) => Err(e),
            Err(e) => Err(TransferError::ApplyFailed(e.to_string())),
        }
    }
}
