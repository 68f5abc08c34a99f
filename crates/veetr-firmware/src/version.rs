//! Firmware version query and comparison.

use std::{cmp::Ordering, time::Duration};

use thiserror::Error;
use tokio::sync::watch;
use veetr_core::{ChannelError, Command, CommandChannel, Notice};

use crate::wait::{Matcher, PendingWait, WaitError};

/// How long the unit gets to answer `GET_FW_VERSION`.
pub const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Send failed: {0}")]
    Send(#[from] ChannelError),
    #[error("No version reply")]
    Timeout,
    #[error("Session closed")]
    SessionClosed,
}

/// Ask the unit which firmware it runs.
///
/// # Errors
/// Returns error if the request cannot be sent, the channel closes, or no
/// reply arrives within `timeout`.
pub async fn query_version(
    channel: &dyn CommandChannel,
    timeout: Duration,
) -> Result<String, VersionError> {
    let mut notices = channel.subscribe();
    let mut closed = channel.closed();
    let (_abort_tx, mut abort) = watch::channel(false);

    channel.send_command(&Command::GetFirmwareVersion).await?;
    match PendingWait::new(Matcher::FirmwareVersion, timeout)
        .resolve(&mut notices, &mut closed, &mut abort)
        .await
    {
        Ok(Notice::FirmwareVersion { version }) => Ok(version),
        Ok(_) | Err(WaitError::Timeout | WaitError::Aborted) => Err(VersionError::Timeout),
        Err(WaitError::Closed) => Err(VersionError::SessionClosed),
    }
}

fn parse(version: &str) -> Option<Vec<u64>> {
    let version = version.trim();
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);
    version
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Whether `latest` is newer than `current`.
///
/// Dotted numeric versions with an optional leading `v`; missing
/// components count as 0. Anything unparseable is never newer.
#[must_use]
pub fn compare_versions(current: &str, latest: &str) -> bool {
    let (Some(current), Some(latest)) = (parse(current), parse(latest)) else {
        return false;
    };
    let len = current.len().max(latest.len());
    for i in 0..len {
        let a = current.get(i).copied().unwrap_or(0);
        let b = latest.get(i).copied().unwrap_or(0);
        match b.cmp(&a) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert!(compare_versions("v0.0.14", "v0.0.15"));
        assert!(compare_versions("0.9.9", "v1.0.0"));
        assert!(compare_versions("1.2", "1.2.1"));
        assert!(!compare_versions("1.2.0", "1.2"));
        assert!(!compare_versions("v1.0.0", "v1.0.0"));
        assert!(!compare_versions("v2.0.0", "v1.9.9"));
        assert!(!compare_versions("v1.0.10", "v1.0.9"));
    }

    #[test]
    fn test_unparseable_is_not_newer() {
        assert!(!compare_versions("v1.0.0", "latest"));
        assert!(!compare_versions("unknown", "v1.0.0"));
        assert!(!compare_versions("v1.0.0", "v1..1"));
    }
}
