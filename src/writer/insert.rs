// ABOUTME: Insert-only writer for INSERT jobs
// ABOUTME: A key that already exists in the target fails the write

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::RecordWriter;
use crate::metrics::WriterMetrics;
use crate::record::Record;
use crate::source::TableSchema;
use crate::target::TargetDatabase;

pub struct InsertWriter {
    db: Arc<dyn TargetDatabase>,
    table: String,
    schema: Arc<TableSchema>,
    metrics: Arc<WriterMetrics>,
}

impl InsertWriter {
    pub fn new(
        db: Arc<dyn TargetDatabase>,
        table: &str,
        schema: Arc<TableSchema>,
        metrics: Arc<WriterMetrics>,
    ) -> Self {
        Self {
            db,
            table: table.to_string(),
            schema,
            metrics,
        }
    }
}

#[async_trait]
impl RecordWriter for InsertWriter {
    fn metrics(&self) -> &Arc<WriterMetrics> {
        &self.metrics
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        self.db
            .insert_record(&self.table, &self.schema, record)
            .await
            .with_context(|| format!("Insert of {} into {} failed", record.key(), self.table))?;
        self.metrics.increment_inserted();
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.db.commit().await
    }
}
