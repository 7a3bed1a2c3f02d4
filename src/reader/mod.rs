// ABOUTME: TableReader trait, the reader factory and the reader-to-writer pump
// ABOUTME: Readers yield record pages lazily; the pump hands each page to a writer

pub mod filtered;
pub mod keyset;
pub mod partitioned;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::metrics::{ReaderMetrics, WriterMetrics};
use crate::progress::ProgressLogger;
use crate::record::{DateTimeRange, RecordPage};
use crate::source::{RecordSource, TableQuery};
use crate::writer::RecordWriter;

pub use filtered::FilteredReader;
pub use keyset::KeySetReader;
pub use partitioned::{partitions, DatePartitionedReader, Interval, Partition, PartitionWorker};

/// A lazy, paginated sequence of record pages.
#[async_trait]
pub trait TableReader: Send {
    /// Prepare the read; sets the expected row count when it is known.
    async fn initialize(&mut self) -> Result<()>;

    /// Next page, or `None` at end of stream.
    async fn next_page(&mut self) -> Result<Option<RecordPage>>;

    fn metrics(&self) -> &Arc<ReaderMetrics>;
}

/// The reader-side projection of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSpec {
    pub table: String,
    pub filter: Option<String>,
    pub created: DateTimeRange,
    /// Read only rows updated at or after this instant (key-diff read).
    pub since: Option<DateTime<Utc>>,
    /// Columns to fetch; empty means all.
    pub fields: Vec<String>,
    pub page_size: u64,
    pub order_by_keys: bool,
    pub max_rows: Option<u64>,
}

impl LoadSpec {
    /// Filter and created-range query shared by every reader of this spec.
    pub fn base_query(&self) -> TableQuery {
        TableQuery::new()
            .with_filter(self.filter.clone())
            .with_created(self.created)
    }
}

/// Builds the reader a job needs: key-diff when `since` is set, else a
/// filtered scan.
#[derive(Clone)]
pub struct ReaderFactory {
    source: Arc<dyn RecordSource>,
    spec: LoadSpec,
}

impl ReaderFactory {
    pub fn new(source: Arc<dyn RecordSource>, spec: LoadSpec) -> Self {
        Self { source, spec }
    }

    pub fn spec(&self) -> &LoadSpec {
        &self.spec
    }

    pub fn source(&self) -> &Arc<dyn RecordSource> {
        &self.source
    }

    /// Reader for the whole job, or for one partition of it.
    ///
    /// Partition readers are live-linked to `parent` and do not enforce
    /// `max_rows`; the partitioned driver checks it for the whole range.
    pub fn create(
        &self,
        partition: Option<&Partition>,
        parent: Option<Arc<ReaderMetrics>>,
    ) -> Box<dyn TableReader> {
        let mut spec = self.spec.clone();
        if let Some(partition) = partition {
            spec.created = spec.created.intersect(&partition.range());
            spec.max_rows = None;
        }
        let metrics = match parent {
            Some(parent) => ReaderMetrics::with_parent(parent),
            None => ReaderMetrics::new(),
        };
        if spec.since.is_some() {
            Box::new(KeySetReader::new(self.source.clone(), spec, metrics))
        } else {
            Box::new(FilteredReader::from_spec(self.source.clone(), spec, metrics))
        }
    }
}

/// Read every page from `reader` and write it to `writer`, reporting
/// progress after each page. The writer must already be open.
pub async fn copy(
    reader: &mut dyn TableReader,
    writer: &mut dyn RecordWriter,
    progress: &dyn ProgressLogger,
    operation: &str,
) -> Result<()> {
    let reported = writer.metrics().clone();
    copy_reporting(reader, writer, progress, operation, &reported).await
}

/// Like [`copy`], but reports `reported` to the progress logger instead of
/// the writer's own metrics. Partition writers use this to report the job
/// totals they are merged into.
pub async fn copy_reporting(
    reader: &mut dyn TableReader,
    writer: &mut dyn RecordWriter,
    progress: &dyn ProgressLogger,
    operation: &str,
    reported: &Arc<WriterMetrics>,
) -> Result<()> {
    reader.initialize().await?;
    while let Some(page) = reader.next_page().await? {
        writer.write_page(&page).await?;
        progress.progress(operation, reader.metrics(), reported);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;
    use crate::record::{parse_source_datetime, Record};
    use serde_json::json;

    fn spec(since: Option<&str>) -> LoadSpec {
        LoadSpec {
            table: "incident".to_string(),
            filter: None,
            created: DateTimeRange::default(),
            since: since.map(|s| parse_source_datetime(s).unwrap()),
            fields: vec![],
            page_size: 2,
            order_by_keys: false,
            max_rows: None,
        }
    }

    fn source() -> Arc<MemorySource> {
        let source = MemorySource::new();
        for (key, updated) in [("a", "2024-01-01 00:00:00"), ("b", "2024-03-01 00:00:00")] {
            source.insert(
                Record::from_json(
                    "incident",
                    json!({"sys_id": key, "sys_created_on": "2024-01-01 00:00:00", "sys_updated_on": updated}),
                )
                .unwrap(),
            );
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_factory_picks_key_diff_reader_when_since_is_set() {
        let factory = ReaderFactory::new(source(), spec(Some("2024-02-01")));
        let mut reader = factory.create(None, None);
        reader.initialize().await.unwrap();
        assert_eq!(reader.metrics().expected(), Some(1));
        let page = reader.next_page().await.unwrap().unwrap();
        assert_eq!(page.records()[0].key().as_str(), "b");
        assert!(reader.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partition_reader_links_to_parent() {
        let factory = ReaderFactory::new(source(), spec(None));
        let parent = ReaderMetrics::new();
        let partition = Partition::new(
            0,
            parse_source_datetime("2024-01-01").unwrap(),
            parse_source_datetime("2024-01-02").unwrap(),
        );
        let mut reader = factory.create(Some(&partition), Some(parent.clone()));
        reader.initialize().await.unwrap();
        while reader.next_page().await.unwrap().is_some() {}
        assert_eq!(reader.metrics().count(), 2);
        assert_eq!(parent.count(), 2);
    }
}
