// ABOUTME: Full filtered scan over a source table, one page per request
// ABOUTME: Pages by offset, or by key when key ordering is enabled

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::{LoadSpec, TableReader};
use crate::error::JobError;
use crate::metrics::ReaderMetrics;
use crate::record::RecordPage;
use crate::source::{PageWindow, RecordSource, TableQuery};

pub struct FilteredReader {
    source: Arc<dyn RecordSource>,
    table: String,
    query: TableQuery,
    fields: Vec<String>,
    page_size: u64,
    keyset_paging: bool,
    max_rows: Option<u64>,
    offset: u64,
    exhausted: bool,
    metrics: Arc<ReaderMetrics>,
}

impl FilteredReader {
    pub fn new(
        source: Arc<dyn RecordSource>,
        table: &str,
        query: TableQuery,
        fields: Vec<String>,
        page_size: u64,
        metrics: Arc<ReaderMetrics>,
    ) -> Self {
        let keyset_paging = query.order_by_key;
        Self {
            source,
            table: table.to_string(),
            query,
            fields,
            page_size: page_size.max(1),
            keyset_paging,
            max_rows: None,
            offset: 0,
            exhausted: false,
            metrics,
        }
    }

    pub fn from_spec(
        source: Arc<dyn RecordSource>,
        spec: LoadSpec,
        metrics: Arc<ReaderMetrics>,
    ) -> Self {
        let query = spec.base_query().ordered_by_key(spec.order_by_keys);
        Self::new(source, &spec.table, query, spec.fields, spec.page_size, metrics)
            .with_max_rows(spec.max_rows)
    }

    /// Fail at initialization if the source reports more than `max_rows` rows.
    pub fn with_max_rows(mut self, max_rows: Option<u64>) -> Self {
        self.max_rows = max_rows;
        self
    }
}

#[async_trait]
impl TableReader for FilteredReader {
    async fn initialize(&mut self) -> Result<()> {
        let expected = self
            .source
            .count(&self.table, &self.query)
            .await
            .with_context(|| format!("Failed to count rows in {}", self.table))?;
        tracing::debug!("{} rows expected from {}", expected, self.table);
        self.metrics.set_expected(Some(expected));

        if let Some(max_rows) = self.max_rows {
            if expected > max_rows {
                return Err(JobError::TooManyRows {
                    table: self.table.clone(),
                    max_rows,
                    expected,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Option<RecordPage>> {
        if self.exhausted {
            return Ok(None);
        }

        let window = PageWindow {
            offset: if self.keyset_paging { 0 } else { self.offset },
            limit: self.page_size,
        };
        let records = self
            .source
            .fetch_page(&self.table, &self.query, &self.fields, window)
            .await?;

        let fetched = records.len() as u64;
        if fetched < self.page_size {
            self.exhausted = true;
        }
        if records.is_empty() {
            return Ok(None);
        }

        let page = RecordPage::new(records);
        if self.keyset_paging {
            self.query.after_key = page.last_key().cloned();
        }
        self.offset += fetched;
        self.metrics.increment(fetched);
        Ok(Some(page))
    }

    fn metrics(&self) -> &Arc<ReaderMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;
    use crate::record::{Key, Record};
    use serde_json::Map;

    fn source(rows: usize) -> Arc<MemorySource> {
        let source = MemorySource::new();
        for i in 0..rows {
            source.insert(Record::new("incident", Key::new(format!("k{:04}", i)), Map::new()));
        }
        Arc::new(source)
    }

    async fn page_sizes(reader: &mut FilteredReader) -> Vec<usize> {
        reader.initialize().await.unwrap();
        let mut sizes = Vec::new();
        while let Some(page) = reader.next_page().await.unwrap() {
            sizes.push(page.len());
        }
        sizes
    }

    #[tokio::test]
    async fn test_offset_paging_ends_on_short_page() {
        let source = source(250);
        let mut reader = FilteredReader::new(
            source.clone(),
            "incident",
            TableQuery::new(),
            vec![],
            100,
            ReaderMetrics::new(),
        );
        assert_eq!(page_sizes(&mut reader).await, vec![100, 100, 50]);
        assert_eq!(reader.metrics().count(), 250);
        assert_eq!(reader.metrics().expected(), Some(250));
        assert_eq!(source.page_requests(), 3);
    }

    #[tokio::test]
    async fn test_keyset_paging_visits_every_key_once() {
        let source = source(5);
        let mut reader = FilteredReader::new(
            source.clone(),
            "incident",
            TableQuery::new().ordered_by_key(true),
            vec![],
            2,
            ReaderMetrics::new(),
        );
        assert_eq!(page_sizes(&mut reader).await, vec![2, 2, 1]);
        assert_eq!(reader.metrics().count(), 5);
    }

    #[tokio::test]
    async fn test_max_rows_rejected_at_initialize() {
        let mut reader = FilteredReader::new(
            source(11),
            "incident",
            TableQuery::new(),
            vec![],
            100,
            ReaderMetrics::new(),
        )
        .with_max_rows(Some(10));
        let err = reader.initialize().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<JobError>(),
            Some(&JobError::TooManyRows {
                table: "incident".to_string(),
                max_rows: 10,
                expected: 11,
            })
        );
    }
}
