//! Session-bound firmware updates.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use veetr_core::{TransferConfig, Transport};
use veetr_session::{Session, SessionError};

use crate::{
    engine::{TransferEngine, TransferProgress},
    error::TransferError,
    job::TransferJob,
    release::{ReleaseError, ReleaseSource},
    version::{DEFAULT_VERSION_TIMEOUT, VersionError, compare_versions, query_version},
};

/// Updater error.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("Release error: {0}")]
    Release(#[from] ReleaseError),
    #[error("Version error: {0}")]
    Version(#[from] VersionError),
}

/// Result of comparing the unit against the newest release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub current: String,
    pub latest: String,
    pub update_available: bool,
}

/// Runs firmware updates against one session.
pub struct FirmwareUpdater<T: Transport> {
    session: Arc<Session<T>>,
    engine: TransferEngine,
    version_timeout: Duration,
}

impl<T: Transport> FirmwareUpdater<T> {
    #[must_use]
    pub fn new(session: Arc<Session<T>>, config: TransferConfig) -> Self {
        Self {
            session,
            engine: TransferEngine::new(config),
            version_timeout: DEFAULT_VERSION_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session<T>> {
        &self.session
    }

    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Option<TransferProgress>> {
        self.engine.progress()
    }

    /// Abort the running update.
    pub fn abort(&self) {
        self.engine.abort();
    }

    /// Firmware version the unit reports, asking it if not yet known.
    ///
    /// # Errors
    /// Returns error if not connected, a transfer is running, or the unit
    /// does not answer.
    pub async fn current_version(&self) -> Result<String, UpdateError> {
        if let Some(version) = self.session.snapshot().await.firmware_version {
            return Ok(version);
        }
        let channel = self.session.channel().await?;
        Ok(query_version(channel.as_ref(), self.version_timeout).await?)
    }

    /// Compare the unit's firmware with the newest release.
    ///
    /// # Errors
    /// Returns error if either version cannot be determined.
    pub async fn check_for_update(
        &self,
        source: &dyn ReleaseSource,
    ) -> Result<UpdateCheck, UpdateError> {
        let current = self.current_version().await?;
        let latest = source.latest_version().await?;
        let update_available = compare_versions(&current, &latest);
        tracing::info!(%current, %latest, update_available, "Checked for update");
        Ok(UpdateCheck {
            current,
            latest,
            update_available,
        })
    }

    /// Upload `image` to the connected unit.
    ///
    /// # Errors
    /// Returns error if not connected, another update holds the session, or
    /// the transfer fails.
    pub async fn update(&self, image: Bytes) -> Result<TransferJob, UpdateError> {
        let lease = match self.session.begin_transfer().await {
            Ok(lease) => lease,
            Err(SessionError::TransferInProgress) => {
                return Err(TransferError::JobAlreadyInProgress.into());
            }
            Err(e) => return Err(e.into()),
        };
        let channel = lease.channel();
        Ok(self.engine.run(channel.as_ref(), image).await?)
    }

    /// Download a release and upload it. Uses the newest release when
    /// `tag` is `None`.
    ///
    /// # Errors
    /// Returns error if the release cannot be fetched, is larger than the
    /// unit can hold, or the transfer fails.
    pub async fn update_from_release(
        &self,
        source: &dyn ReleaseSource,
        tag: Option<&str>,
    ) -> Result<TransferJob, UpdateError> {
        let tag = match tag {
            Some(tag) => tag.to_owned(),
            None => source.latest_version().await?,
        };
        let asset = source.firmware_asset(&tag).await?;

        let max = self.engine.config().max_image_bytes as u64;
        if asset.size > max {
            return Err(TransferError::InvalidImage(format!(
                "{} is {} bytes, the unit holds at most {max}",
                asset.filename, asset.size
            ))
            .into());
        }

        tracing::info!(%tag, file = %asset.filename, bytes = asset.size, "Downloading firmware");
        let image = source.download(&asset).await?;
        self.update(image).await
    }
}
