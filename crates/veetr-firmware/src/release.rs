//! Where firmware images come from.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A downloadable firmware binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareAsset {
    pub url: String,
    pub size: u64,
    pub filename: String,
}

/// Release lookup error.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Release not found: {0}")]
    NotFound(String),
    #[error("Downloaded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Source of published firmware releases.
///
/// Implement this over whatever hosts the releases; the updater only needs
/// the latest tag, the asset's size and its bytes.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Tag of the newest release.
    async fn latest_version(&self) -> Result<String, ReleaseError>;

    /// Firmware binary published under `tag`.
    async fn firmware_asset(&self, tag: &str) -> Result<FirmwareAsset, ReleaseError>;

    /// Fetch the asset's bytes.
    async fn download(&self, asset: &FirmwareAsset) -> Result<Bytes, ReleaseError>;
}

/// A single release backed by a file on disk.
#[derive(Debug, Clone)]
pub struct LocalRelease {
    version: String,
    path: PathBuf,
}

impl LocalRelease {
    #[must_use]
    pub fn new(version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl ReleaseSource for LocalRelease {
    async fn latest_version(&self) -> Result<String, ReleaseError> {
        Ok(self.version.clone())
    }

    async fn firmware_asset(&self, tag: &str) -> Result<FirmwareAsset, ReleaseError> {
        if tag != self.version {
            return Err(ReleaseError::NotFound(tag.to_owned()));
        }
        let meta = tokio::fs::metadata(&self.path).await?;
        Ok(FirmwareAsset {
            url: format!("file://{}", self.path.display()),
            size: meta.len(),
            filename: self
                .path
                .file_name()
                .map_or_else(|| "firmware.bin".into(), |n| n.to_string_lossy().into_owned()),
        })
    }

    async fn download(&self, asset: &FirmwareAsset) -> Result<Bytes, ReleaseError> {
        let data = Bytes::from(tokio::fs::read(&self.path).await?);
        check_size(asset, &data)?;
        Ok(data)
    }
}

/// A single release held in memory.
#[derive(Debug, Clone)]
pub struct StaticRelease {
    version: String,
    image: Bytes,
}

impl StaticRelease {
    #[must_use]
    pub fn new(version: impl Into<String>, image: impl Into<Bytes>) -> Self {
        Self {
            version: version.into(),
            image: image.into(),
        }
    }
}

#[async_trait]
impl ReleaseSource for StaticRelease {
    async fn latest_version(&self) -> Result<String, ReleaseError> {
        Ok(self.version.clone())
    }

    async fn firmware_asset(&self, tag: &str) -> Result<FirmwareAsset, ReleaseError> {
        if tag != self.version {
            return Err(ReleaseError::NotFound(tag.to_owned()));
        }
        Ok(FirmwareAsset {
            url: format!("memory://{tag}"),
            size: self.image.len() as u64,
            filename: format!("veetr-{tag}.bin"),
        })
    }

    async fn download(&self, asset: &FirmwareAsset) -> Result<Bytes, ReleaseError> {
        check_size(asset, &self.image)?;
        Ok(self.image.clone())
    }
}

fn check_size(asset: &FirmwareAsset, data: &Bytes) -> Result<(), ReleaseError> {
    let actual = data.len() as u64;
    if actual == asset.size {
        Ok(())
    } else {
        Err(ReleaseError::SizeMismatch {
            expected: asset.size,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_release() {
        let path = std::env::temp_dir().join(format!("veetr-release-{}.bin", std::process::id()));
        tokio::fs::write(&path, b"firmware").await.unwrap();

        let source = LocalRelease::new("v0.1.0", &path);
        assert_eq!(source.latest_version().await.unwrap(), "v0.1.0");
        assert!(matches!(
            source.firmware_asset("v0.0.9").await,
            Err(ReleaseError::NotFound(_))
        ));

        let asset = source.firmware_asset("v0.1.0").await.unwrap();
        assert_eq!(asset.size, 8);
        assert!(asset.filename.starts_with("veetr-release-"));
        assert_eq!(source.download(&asset).await.unwrap(), &b"firmware"[..]);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let source = StaticRelease::new("v1.0.0", vec![0u8; 4]);
        let mut asset = source.firmware_asset("v1.0.0").await.unwrap();
        asset.size = 5;
        assert!(matches!(
            source.download(&asset).await,
            Err(ReleaseError::SizeMismatch {
                expected: 5,
                actual: 4
            })
        ));
    }
}
