// ABOUTME: Full source/target reconciliation: audit-feed deletes, then upserts
// ABOUTME: Also provides the delete-only routine used by PRUNE jobs

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::JobConfig;
use crate::metrics::{ReaderMetrics, WriterMetrics};
use crate::pipeline::Pipeline;
use crate::progress::ProgressLogger;
use crate::reader::{copy, FilteredReader, ReaderFactory};
use crate::record::{DateTimeRange, KEY_FIELD};
use crate::source::{
    RecordSource, TableQuery, TableSchema, AUDIT_DELETE_TABLE, AUDIT_KEY_FIELD, AUDIT_TABLE_FIELD,
};
use crate::target::DatabaseConnector;
use crate::writer::{DeleteWriter, RecordWriter, WritePolicy};

pub struct Synchronizer {
    source: Arc<dyn RecordSource>,
    connector: Arc<dyn DatabaseConnector>,
    progress: Arc<dyn ProgressLogger>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn RecordSource>,
        connector: Arc<dyn DatabaseConnector>,
        progress: Arc<dyn ProgressLogger>,
    ) -> Self {
        Self {
            source,
            connector,
            progress,
        }
    }

    /// Delete phase then upsert phase. Each phase finishes before the next
    /// starts; only the upsert phase is partitioned.
    pub async fn run(
        &self,
        job: &JobConfig,
        schema: Arc<TableSchema>,
        metrics: &Arc<WriterMetrics>,
    ) -> Result<()> {
        self.prune(job, metrics).await?;
        tracing::info!(
            "Delete phase of {} done: deleted={} skipped={}",
            job.name,
            metrics.deleted(),
            metrics.skipped()
        );
        self.apply_changes(job, schema, metrics).await
    }

    /// Delete every target row named in the audit-delete feed for the job's
    /// source table, created at or after `since`. Rows already absent count
    /// as skipped.
    pub async fn prune(&self, job: &JobConfig, metrics: &Arc<WriterMetrics>) -> Result<()> {
        let query = TableQuery::new()
            .with_equals(AUDIT_TABLE_FIELD, &job.source)
            .with_created(DateTimeRange::since(job.since))
            .ordered_by_key(true);
        let page_size = job
            .page_size
            .unwrap_or_else(|| self.source.default_page_size());
        let mut reader = FilteredReader::new(
            self.source.clone(),
            AUDIT_DELETE_TABLE,
            query,
            vec![KEY_FIELD.to_string(), AUDIT_KEY_FIELD.to_string()],
            page_size,
            ReaderMetrics::new(),
        )
        .with_max_rows(job.max_rows);

        let db = self.connector.connect().await?;
        let mut writer =
            DeleteWriter::new(db, &job.target, WriterMetrics::with_parent(metrics.clone()));

        writer.open().await?;
        copy(&mut reader, &mut writer, self.progress.as_ref(), &job.name)
            .await
            .with_context(|| format!("Failed to apply deletes for {}", job.source))?;
        writer.close().await
    }

    /// Upsert every changed (or, without `since`, every matching) source row.
    pub async fn apply_changes(
        &self,
        job: &JobConfig,
        schema: Arc<TableSchema>,
        metrics: &Arc<WriterMetrics>,
    ) -> Result<()> {
        let spec = job.load_spec(schema.field_names(), self.source.default_page_size());
        let pipeline = Arc::new(Pipeline {
            operation: job.name.clone(),
            factory: ReaderFactory::new(self.source.clone(), spec),
            connector: self.connector.clone(),
            progress: self.progress.clone(),
            target_table: job.target.clone(),
            schema,
            policy: WritePolicy::Upsert,
        });
        match job.partition {
            Some(interval) => {
                pipeline
                    .run_partitioned(interval, job.threads.unwrap_or(1), metrics)
                    .await
            }
            None => pipeline.run(metrics).await,
        }
    }
}
