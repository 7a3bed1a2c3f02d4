// ABOUTME: Checkpoint store recording the last successful run of each job
// ABOUTME: Persisted as JSON so `since = "last"` survives restarts

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::metrics::WriterMetrics;

/// Last successful run of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub job: String,
    /// Fingerprint of the job definition that produced this run
    pub fingerprint: String,
    /// When the run started; the next incremental run reads changes since here
    pub last_started: DateTime<Utc>,
    pub last_finished: DateTime<Utc>,
    /// Rows processed by the run
    pub last_processed: u64,
}

/// Checkpoints for every job, keyed by job name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointStore {
    pub jobs: HashMap<String, JobCheckpoint>,
    /// Version of the state format for future migrations
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            version: 1,
            updated_at: Utc::now(),
        }
    }
}

impl CheckpointStore {
    pub fn get(&self, job: &str) -> Option<&JobCheckpoint> {
        self.jobs.get(job)
    }

    /// Record a successful run from its finished job metrics.
    pub fn record(&mut self, job: &str, fingerprint: &str, metrics: &WriterMetrics) {
        let now = Utc::now();
        let checkpoint = JobCheckpoint {
            job: job.to_string(),
            fingerprint: fingerprint.to_string(),
            last_started: metrics.started().unwrap_or(now),
            last_finished: metrics.finished().unwrap_or(now),
            last_processed: metrics.processed(),
        };
        self.jobs.insert(job.to_string(), checkpoint);
        self.updated_at = now;
    }

    pub fn remove(&mut self, job: &str) -> Option<JobCheckpoint> {
        let removed = self.jobs.remove(job);
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Load from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoints from {:?}", path))?;
        let store: CheckpointStore = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoints from {:?}", path))?;
        Ok(store)
    }

    /// Load from a JSON file, or start empty if it does not exist yet.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Save to a JSON file, creating parent directories
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize checkpoints")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write checkpoints to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn finished_metrics(processed: u64) -> std::sync::Arc<WriterMetrics> {
        let metrics = WriterMetrics::new();
        metrics.start();
        metrics.add_inserted(processed);
        metrics.finish();
        metrics
    }

    #[test]
    fn test_record_and_get() {
        let mut store = CheckpointStore::default();
        let metrics = finished_metrics(42);
        store.record("incident", "abc", &metrics);

        let cp = store.get("incident").unwrap();
        assert_eq!(cp.fingerprint, "abc");
        assert_eq!(cp.last_processed, 42);
        assert_eq!(Some(cp.last_started), metrics.started());
        assert!(store.get("problem").is_none());
    }

    #[test]
    fn test_remove() {
        let mut store = CheckpointStore::default();
        store.record("incident", "abc", &finished_metrics(1));
        assert!(store.remove("incident").is_some());
        assert!(store.remove("incident").is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut store = CheckpointStore::default();
        store.record("incident", "abc", &finished_metrics(7));
        store.save(&path).await.unwrap();

        let loaded = CheckpointStore::load(&path).await.unwrap();
        assert_eq!(loaded.get("incident"), store.get("incident"));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::load_or_default(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(store.jobs.is_empty());
    }
}
