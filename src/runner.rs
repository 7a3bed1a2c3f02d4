// ABOUTME: Action dispatcher - validates a job, runs its action, enforces row bounds
// ABOUTME: Returns the job-level WriterMetrics on success

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::Instrument;

use crate::config::{Action, JobConfig};
use crate::error::JobError;
use crate::metrics::WriterMetrics;
use crate::pipeline::Pipeline;
use crate::progress::ProgressLogger;
use crate::reader::ReaderFactory;
use crate::source::{RecordSource, TableSchema};
use crate::sync::Synchronizer;
use crate::target::{DatabaseConnector, TargetDatabase};
use crate::writer::WritePolicy;

/// Runs one job at a time against a source and a target.
#[derive(Clone)]
pub struct JobRunner {
    source: Arc<dyn RecordSource>,
    connector: Arc<dyn DatabaseConnector>,
    progress: Arc<dyn ProgressLogger>,
}

impl JobRunner {
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

    /// Same source and target, different progress sink.
    pub fn with_progress(&self, progress: Arc<dyn ProgressLogger>) -> Self {
        Self {
            source: self.source.clone(),
            connector: self.connector.clone(),
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<dyn ProgressLogger> {
        &self.progress
    }

    /// Run `job` to completion.
    ///
    /// Fails with [`JobError::Config`] before doing anything if the job is
    /// malformed, and with [`JobError::TooFewRows`] after the main pass if
    /// fewer than `min_rows` rows were processed. `sql_after` only runs on
    /// success.
    pub async fn run(&self, job: &JobConfig) -> Result<Arc<WriterMetrics>> {
        let span = tracing::info_span!("job", name = %job.name, action = %job.action);
        self.dispatch(job).instrument(span).await
    }

    async fn dispatch(&self, job: &JobConfig) -> Result<Arc<WriterMetrics>> {
        job.validate()?;

        let metrics = WriterMetrics::named(&job.name);
        metrics.start();

        let db = self
            .connector
            .connect()
            .await
            .context("Failed to connect to the target database")?;

        if let Some(sql) = &job.sql_before {
            db.execute_statement(sql)
                .await
                .with_context(|| format!("sql_before of job {} failed", job.name))?;
        }

        match job.action {
            Action::Create => {
                if job.drop_table {
                    db.drop_table(&job.target, true).await?;
                }
                let schema = self.schema(job).await?;
                if db.create_missing_table(&schema, &job.target).await? {
                    tracing::info!("Created table {}", job.target);
                } else {
                    tracing::info!("Table {} already exists", job.target);
                }
            }
            Action::DropTable => {
                db.drop_table(&job.target, true).await?;
            }
            Action::Execute => {
                let sql = job.sql.as_deref().unwrap_or_default();
                let affected = db.execute_statement(sql).await?;
                tracing::info!("{} rows affected", affected);
            }
            Action::Prune => {
                self.synchronizer().prune(job, &metrics).await?;
            }
            Action::Sync => {
                let schema = self.schema(job).await?;
                if job.auto_create {
                    db.create_missing_table(&schema, &job.target).await?;
                }
                tracing::info!("begin sync {}", job.name);
                self.synchronizer().run(job, schema, &metrics).await?;
            }
            Action::Insert | Action::Update | Action::Load => {
                let policy = match job.action {
                    Action::Insert => WritePolicy::Insert,
                    Action::Update => WritePolicy::Update,
                    _ => WritePolicy::Upsert,
                };
                self.load(job, db.as_ref(), policy, &metrics).await?;
            }
        }

        metrics.finish();
        let processed = metrics.processed();
        tracing::info!("end {} {} ({} rows)", job.action, job.name, processed);

        if let Some(min_rows) = job.min_rows {
            if processed < min_rows {
                return Err(JobError::TooFewRows {
                    table: job.source.clone(),
                    min_rows,
                    processed,
                }
                .into());
            }
        }

        if let Some(sql) = &job.sql_after {
            db.execute_statement(sql)
                .await
                .with_context(|| format!("sql_after of job {} failed", job.name))?;
        }

        self.progress.complete(&job.name, &metrics);
        Ok(metrics)
    }

    async fn load(
        &self,
        job: &JobConfig,
        db: &dyn TargetDatabase,
        policy: WritePolicy,
        metrics: &Arc<WriterMetrics>,
    ) -> Result<()> {
        let schema = self.schema(job).await?;
        if job.auto_create {
            db.create_missing_table(&schema, &job.target).await?;
        }
        if job.truncate {
            db.truncate_table(&job.target).await?;
        }

        let spec = job.load_spec(schema.field_names(), self.source.default_page_size());
        let pipeline = Arc::new(Pipeline {
            operation: job.name.clone(),
            factory: ReaderFactory::new(self.source.clone(), spec),
            connector: self.connector.clone(),
            progress: self.progress.clone(),
            target_table: job.target.clone(),
            schema,
            policy,
        });

        tracing::info!("begin {} {} using {} writer", job.action, job.name, policy);
        match job.partition {
            Some(interval) => {
                pipeline
                    .run_partitioned(interval, job.threads.unwrap_or(1), metrics)
                    .await
            }
            None => pipeline.run(metrics).await,
        }
    }

    /// Source schema narrowed to the job's column selection.
    async fn schema(&self, job: &JobConfig) -> Result<Arc<TableSchema>> {
        let schema = self
            .source
            .table_schema(&job.source)
            .await
            .with_context(|| format!("Failed to read schema of {}", job.source))?;
        let selected = schema
            .select(job.include_columns.as_deref(), job.exclude_columns.as_deref())
            .map_err(|e| JobError::config(format!("job {}: {}", job.name, e)))?;
        Ok(Arc::new(selected))
    }

    fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(
            self.source.clone(),
            self.connector.clone(),
            self.progress.clone(),
        )
    }
}
