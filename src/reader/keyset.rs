// ABOUTME: Incremental two-phase reader: changed keys first, then full records
// ABOUTME: Full records are fetched in page-sized batches of keys

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{LoadSpec, TableReader};
use crate::error::JobError;
use crate::metrics::ReaderMetrics;
use crate::record::{KeySet, RecordPage};
use crate::source::{PageWindow, RecordSource};

pub struct KeySetReader {
    source: Arc<dyn RecordSource>,
    spec: LoadSpec,
    batches: VecDeque<KeySet>,
    metrics: Arc<ReaderMetrics>,
}

impl KeySetReader {
    pub fn new(source: Arc<dyn RecordSource>, spec: LoadSpec, metrics: Arc<ReaderMetrics>) -> Self {
        Self {
            source,
            spec,
            batches: VecDeque::new(),
            metrics,
        }
    }
}

#[async_trait]
impl TableReader for KeySetReader {
    async fn initialize(&mut self) -> Result<()> {
        let query = self.spec.base_query().with_updated_since(self.spec.since);
        let keys = self
            .source
            .fetch_keys(&self.spec.table, &query)
            .await
            .with_context(|| format!("Failed to fetch changed keys of {}", self.spec.table))?;

        let expected = keys.len() as u64;
        tracing::debug!(
            "{} keys of {} changed since {:?}",
            expected,
            self.spec.table,
            self.spec.since
        );
        self.metrics.set_expected(Some(expected));

        if let Some(max_rows) = self.spec.max_rows {
            if expected > max_rows {
                return Err(JobError::TooManyRows {
                    table: self.spec.table.clone(),
                    max_rows,
                    expected,
                }
                .into());
            }
        }

        self.batches = keys.chunks(self.spec.page_size.max(1) as usize).into();
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Option<RecordPage>> {
        let Some(batch) = self.batches.pop_front() else {
            return Ok(None);
        };
        let limit = batch.len() as u64;
        let query = self
            .spec
            .base_query()
            .with_keys(batch)
            .ordered_by_key(self.spec.order_by_keys);
        let records = self
            .source
            .fetch_page(
                &self.spec.table,
                &query,
                &self.spec.fields,
                PageWindow { offset: 0, limit },
            )
            .await?;

        self.metrics.increment(records.len() as u64);
        Ok(Some(RecordPage::new(records)))
    }

    fn metrics(&self) -> &Arc<ReaderMetrics> {
        &self.metrics
    }
}
