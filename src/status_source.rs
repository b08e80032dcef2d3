//! Externally published status document
//!
//! A separate watcher process may write a JSON progress document. It is
//! trusted only while fresh; anything missing, stale or malformed reads
//! as absent.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Structured progress document
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StatusDocument {
    #[serde(default)]
    pub progress: f64,
    pub message: Option<String>,
    #[serde(default)]
    pub migrations_done: u32,
    #[serde(default)]
    pub migrations_total: u32,
    #[serde(default, alias = "current_migration")]
    pub current_task: Option<String>,
    #[serde(default, alias = "completed_migrations")]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub panel_ready: bool,
    /// Unix seconds at which the document was written
    pub timestamp: Option<f64>,
}

impl StatusDocument {
    /// Progress as a whole percentage
    pub fn progress_percent(&self) -> u8 {
        self.progress.clamp(0.0, 100.0) as u8
    }

    /// A document without a timestamp counts as fresh
    pub fn is_fresh(&self, now: SystemTime, window: Duration) -> bool {
        let Some(written) = self.timestamp else {
            return true;
        };
        let now = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        now - written < window.as_secs_f64()
    }
}

/// Reader for the status document file
#[derive(Debug, Clone)]
pub struct StatusSource {
    path: PathBuf,
    freshness: Duration,
}

impl StatusSource {
    pub fn new(path: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            path: path.into(),
            freshness,
        }
    }

    /// Read the document if it exists, parses and is fresh
    pub async fn read(&self) -> Option<StatusDocument> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Status document unavailable");
                return None;
            }
        };

        let doc: StatusDocument = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Ignoring malformed status document");
                return None;
            }
        };

        if !doc.is_fresh(SystemTime::now(), self.freshness) {
            debug!(path = %self.path.display(), "Ignoring stale status document");
            return None;
        }

        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix_now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
    }

    #[test]
    fn test_legacy_field_names() {
        let doc: StatusDocument = serde_json::from_str(
            r#"{"progress": 42, "message": "Migrating", "migrations_done": 3,
                "migrations_total": 222, "current_migration": "create_users_table",
                "completed_migrations": ["a", "b", "c"]}"#,
        )
        .unwrap();

        assert_eq!(doc.progress_percent(), 42);
        assert_eq!(doc.current_task.as_deref(), Some("create_users_table"));
        assert_eq!(doc.completed_tasks.len(), 3);
        assert!(!doc.panel_ready);
    }

    #[test]
    fn test_freshness_window() {
        let window = Duration::from_secs(60);
        let mut doc: StatusDocument = serde_json::from_str(r#"{"progress": 10}"#).unwrap();
        assert!(doc.is_fresh(SystemTime::now(), window));

        doc.timestamp = Some(unix_now() - 5.0);
        assert!(doc.is_fresh(SystemTime::now(), window));

        doc.timestamp = Some(unix_now() - 120.0);
        assert!(!doc.is_fresh(SystemTime::now(), window));
    }

    #[tokio::test]
    async fn test_read_fresh_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init_status.json");
        let body = format!(
            r#"{{"progress": 55.5, "current_task": "add_index", "timestamp": {}}}"#,
            unix_now()
        );
        std::fs::write(&path, body).unwrap();

        let source = StatusSource::new(&path, Duration::from_secs(60));
        let doc = source.read().await.unwrap();
        assert_eq!(doc.progress_percent(), 55);
        assert_eq!(doc.current_task.as_deref(), Some("add_index"));
    }

    #[tokio::test]
    async fn test_read_ignores_stale_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init_status.json");
        let source = StatusSource::new(&path, Duration::from_secs(60));

        assert!(source.read().await.is_none());

        std::fs::write(&path, "{not json").unwrap();
        assert!(source.read().await.is_none());

        std::fs::write(&path, r#"{"progress": 50, "timestamp": 1000}"#).unwrap();
        assert!(source.read().await.is_none());
    }
}
