// ABOUTME: RecordWriter trait and the factory for insert, update and upsert writers
// ABOUTME: Writers apply record pages to one target table and count the outcomes

pub mod delete;
pub mod insert;
pub mod update;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::metrics::WriterMetrics;
use crate::record::{Record, RecordPage};
use crate::source::TableSchema;
use crate::target::TargetDatabase;

pub use delete::DeleteWriter;
pub use insert::InsertWriter;
pub use update::UpdateWriter;

/// Applies records to a target table.
///
/// `open()` starts the metrics clock and `close()` stops it. Both propagate
/// to a live-linked parent.
#[async_trait]
pub trait RecordWriter: Send {
    fn metrics(&self) -> &Arc<WriterMetrics>;

    async fn open(&mut self) -> Result<()> {
        self.metrics().start();
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Write each record in order, then commit.
    async fn write_page(&mut self, page: &RecordPage) -> Result<()> {
        for record in page.records() {
            self.write(record).await?;
        }
        self.commit().await
    }

    async fn commit(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        self.commit().await?;
        self.metrics().finish();
        Ok(())
    }
}

/// How records are applied to the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Insert every record; an existing key is an error.
    Insert,
    /// Update existing rows; records with no matching row are skipped.
    Update,
    /// Update existing rows, insert the rest.
    Upsert,
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WritePolicy::Insert => "insert",
            WritePolicy::Update => "update",
            WritePolicy::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

pub fn create_writer(
    policy: WritePolicy,
    db: Arc<dyn TargetDatabase>,
    table: &str,
    schema: Arc<TableSchema>,
    metrics: Arc<WriterMetrics>,
) -> Box<dyn RecordWriter> {
    match policy {
        WritePolicy::Insert => Box::new(InsertWriter::new(db, table, schema, metrics)),
        WritePolicy::Update => Box::new(UpdateWriter::new(db, table, schema, metrics, false)),
        WritePolicy::Upsert => Box::new(UpdateWriter::new(db, table, schema, metrics, true)),
    }
}
