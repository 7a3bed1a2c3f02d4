// ABOUTME: Delete writer driven by audit-delete records or explicit key sets
// ABOUTME: Keys that are already absent from the target count as skipped

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::RecordWriter;
use crate::error::JobError;
use crate::metrics::WriterMetrics;
use crate::record::{Key, KeySet, Record};
use crate::source::AUDIT_KEY_FIELD;
use crate::target::TargetDatabase;

/// Deletes target rows named by the `documentkey` field of audit records.
pub struct DeleteWriter {
    db: Arc<dyn TargetDatabase>,
    table: String,
    metrics: Arc<WriterMetrics>,
}

impl DeleteWriter {
    pub fn new(db: Arc<dyn TargetDatabase>, table: &str, metrics: Arc<WriterMetrics>) -> Self {
        Self {
            db,
            table: table.to_string(),
            metrics,
        }
    }

    pub async fn delete_key(&mut self, key: &Key) -> Result<()> {
        let deleted = self
            .db
            .delete_record(&self.table, key)
            .await
            .with_context(|| format!("Delete of {} from {} failed", key, self.table))?;
        if deleted {
            self.metrics.increment_deleted();
        } else {
            tracing::debug!("{} already absent from {}", key, self.table);
            self.metrics.increment_skipped();
        }
        Ok(())
    }

    pub async fn delete_keys(&mut self, keys: &KeySet) -> Result<()> {
        for key in keys.iter() {
            self.delete_key(key).await?;
        }
        self.commit().await
    }
}

#[async_trait]
impl RecordWriter for DeleteWriter {
    fn metrics(&self) -> &Arc<WriterMetrics> {
        &self.metrics
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let key = record
            .sql_value(AUDIT_KEY_FIELD)
            .map(Key::new)
            .ok_or_else(|| JobError::MissingField {
                table: record.table().to_string(),
                key: record.key().to_string(),
                field: AUDIT_KEY_FIELD.to_string(),
            })?;
        self.delete_key(&key).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.db.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_absent_keys_are_skipped() {
        let db = MemoryDatabase::new();
        db.seed("incident", &Record::new("incident", Key::from("a"), Map::new()));
        let mut writer = DeleteWriter::new(db.clone(), "incident", WriterMetrics::new());
        writer.open().await.unwrap();

        let keys: KeySet = ["a", "b"].into_iter().map(Key::from).collect();
        writer.delete_keys(&keys).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(writer.metrics().deleted(), 1);
        assert_eq!(writer.metrics().skipped(), 1);
        assert_eq!(db.row_count("incident"), 0);
    }

    #[tokio::test]
    async fn test_audit_record_without_document_key_fails() {
        let db = MemoryDatabase::new();
        db.create_table("incident");
        let mut writer = DeleteWriter::new(db, "incident", WriterMetrics::new());
        let audit = Record::from_json(
            "sys_audit_delete",
            json!({"sys_id": "x1", "tablename": "incident"}),
        )
        .unwrap();

        let err = writer.write(&audit).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::MissingField { .. })
        ));
    }
}
