use super::UpdateApplier;
use crate::error::{Result, SwarmError};
use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Marker naming the version to launch on the next start.
const PENDING_MARKER: &str = "pending-version";

/// Stages packages as files in a directory.
///
/// Applying writes a marker for the supervisor that launches the new
/// binary; launching itself happens outside this process.
pub struct StagingDirectoryUpdater {
    directory: PathBuf,
}

impl StagingDirectoryUpdater {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn package_path(&self, version: &str) -> Result<PathBuf> {
        let valid = !version.is_empty()
            && version != "."
            && version != ".."
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
        if !valid {
            return Err(SwarmError::Updater(format!(
                "refusing to stage invalid version {:?}",
                version
            )));
        }
        Ok(self.directory.join(format!("{}.pkg", version)))
    }
}

#[async_trait]
impl UpdateApplier for StagingDirectoryUpdater {
    async fn begin_update(&self, version: &str, package: Bytes) -> Result<()> {
        let path = self.package_path(version)?;
        fs::create_dir_all(&self.directory).await?;
        fs::write(&path, &package).await?;
        info!(
            "Staged version {} ({} bytes) at {}",
            version,
            package.len(),
            path.display()
        );
        Ok(())
    }

    async fn apply_update(&self, version: &str) -> Result<()> {
        let path = self.package_path(version)?;
        if !fs::try_exists(&path).await? {
            return Err(SwarmError::Updater(format!(
                "version {} was never staged",
                version
            )));
        }
        fs::write(self.directory.join(PENDING_MARKER), version).await?;
        info!("Version {} marked for launch", version);
        Ok(())
    }

    async fn discard_update(&self, version: &str) -> Result<()> {
        let path = self.package_path(version)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Discarded staged version {}", version);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Nothing staged for version {}", version);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
