//! Existence-only marker files
//!
//! Used for the init-complete flag and the one-shot setup page marker.
//! Only presence carries meaning; the content is a unix timestamp.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct Marker {
    path: PathBuf,
}

impl Marker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Write the marker, retrying transient failures
    pub async fn create(&self) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.write_once().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Failed to write marker, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_once(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        tokio::fs::write(&self.path, stamp.to_string())
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let marker = Marker::new(dir.path().join("nested/init_complete"));
        assert!(!marker.exists().await);

        marker.create().await.unwrap();
        assert!(marker.exists().await);

        let content = std::fs::read_to_string(marker.path()).unwrap();
        assert!(content.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_create_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let marker = Marker::new(blocker.join("flag"));
        assert!(marker.create().await.is_err());
        assert!(!marker.exists().await);
    }
}
