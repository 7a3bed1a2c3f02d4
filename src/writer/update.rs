// ABOUTME: Update writer for UPDATE, LOAD and SYNC jobs
// ABOUTME: Missing rows are inserted when upserting, otherwise skipped

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::RecordWriter;
use crate::metrics::WriterMetrics;
use crate::record::Record;
use crate::source::TableSchema;
use crate::target::TargetDatabase;

pub struct UpdateWriter {
    db: Arc<dyn TargetDatabase>,
    table: String,
    schema: Arc<TableSchema>,
    metrics: Arc<WriterMetrics>,
    upsert: bool,
}

impl UpdateWriter {
    pub fn new(
        db: Arc<dyn TargetDatabase>,
        table: &str,
        schema: Arc<TableSchema>,
        metrics: Arc<WriterMetrics>,
        upsert: bool,
    ) -> Self {
        Self {
            db,
            table: table.to_string(),
            schema,
            metrics,
            upsert,
        }
    }
}

#[async_trait]
impl RecordWriter for UpdateWriter {
    fn metrics(&self) -> &Arc<WriterMetrics> {
        &self.metrics
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let updated = self
            .db
            .update_record(&self.table, &self.schema, record)
            .await
            .with_context(|| format!("Update of {} in {} failed", record.key(), self.table))?;

        if updated {
            self.metrics.increment_updated();
        } else if self.upsert {
            self.db
                .insert_record(&self.table, &self.schema, record)
                .await
                .with_context(|| {
                    format!("Insert of {} into {} failed", record.key(), self.table)
                })?;
            self.metrics.increment_inserted();
        } else {
            tracing::debug!("{} not found in {}, skipped", record.key(), self.table);
            self.metrics.increment_skipped();
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.db.commit().await
    }
}
