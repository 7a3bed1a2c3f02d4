// ABOUTME: Source-to-target copy pipeline shared by load actions and sync
// ABOUTME: Runs one reader/writer pair, or one pair per date partition

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::metrics::{ReaderMetrics, WriterMetrics};
use crate::progress::ProgressLogger;
use crate::reader::{
    copy, copy_reporting, DatePartitionedReader, Interval, Partition, PartitionWorker,
    ReaderFactory,
};
use crate::source::TableSchema;
use crate::target::DatabaseConnector;
use crate::writer::{create_writer, WritePolicy};

/// Everything needed to copy one source table into one target table.
pub struct Pipeline {
    pub operation: String,
    pub factory: ReaderFactory,
    pub connector: Arc<dyn DatabaseConnector>,
    pub progress: Arc<dyn ProgressLogger>,
    pub target_table: String,
    pub schema: Arc<TableSchema>,
    pub policy: WritePolicy,
}

impl Pipeline {
    /// Copy everything the factory's reader yields, live-linking the writer
    /// metrics to `job_metrics`.
    pub async fn run(&self, job_metrics: &Arc<WriterMetrics>) -> Result<()> {
        let db = self.connector.connect().await?;
        let mut writer = create_writer(
            self.policy,
            db,
            &self.target_table,
            self.schema.clone(),
            WriterMetrics::with_parent(job_metrics.clone()),
        );
        let mut reader = self.factory.create(None, None);

        writer.open().await?;
        copy(reader.as_mut(), writer.as_mut(), self.progress.as_ref(), &self.operation)
            .await
            .with_context(|| {
                format!(
                    "Copy of {} into {} failed",
                    self.factory.spec().table,
                    self.target_table
                )
            })?;
        writer.close().await
    }

    /// Copy partition by partition, at most `threads` at a time. Partition
    /// writers are unlinked and merged into `job_metrics` on completion.
    pub async fn run_partitioned(
        self: Arc<Self>,
        interval: Interval,
        threads: usize,
        job_metrics: &Arc<WriterMetrics>,
    ) -> Result<()> {
        let driver = DatePartitionedReader::new(
            self.factory.source().as_ref(),
            self.factory.spec(),
            interval,
            threads,
        )
        .await?;
        driver.run(self, job_metrics).await
    }
}

#[async_trait]
impl PartitionWorker for Pipeline {
    async fn process(
        &self,
        partition: Partition,
        reader_parent: Arc<ReaderMetrics>,
        job_metrics: Arc<WriterMetrics>,
    ) -> Result<Arc<WriterMetrics>> {
        let db = self
            .connector
            .connect()
            .await
            .with_context(|| format!("Partition {} could not connect to the target", partition))?;
        let metrics = WriterMetrics::new();
        let mut writer = create_writer(
            self.policy,
            db,
            &self.target_table,
            self.schema.clone(),
            metrics.clone(),
        );
        let mut reader = self.factory.create(Some(&partition), Some(reader_parent));

        writer.open().await?;
        copy_reporting(
            reader.as_mut(),
            writer.as_mut(),
            self.progress.as_ref(),
            &self.operation,
            &job_metrics,
        )
        .await?;
        writer.close().await?;
        Ok(metrics)
    }

    fn merged(&self, reader: &Arc<ReaderMetrics>, job_metrics: &Arc<WriterMetrics>) {
        self.progress.progress(&self.operation, reader, job_metrics);
    }
}
