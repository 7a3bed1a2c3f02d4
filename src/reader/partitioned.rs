// ABOUTME: Date-partitioned driver: splits the created range and runs partitions concurrently
// ABOUTME: Partition writer metrics are merged into the job metrics once, on completion

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::LoadSpec;
use crate::error::JobError;
use crate::metrics::{ReaderMetrics, WriterMetrics};
use crate::record::{format_source_datetime, DateTimeRange};
use crate::source::RecordSource;

/// Calendar unit used to split the created range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Interval {
    /// Start of the calendar period containing `t`. Weeks start on Monday.
    fn floor(self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = t.date_naive();
        let start = match self {
            Interval::Hour => {
                return date
                    .and_hms_opt(t.hour(), 0, 0)
                    .map(|n| Utc.from_utc_datetime(&n))
            }
            Interval::Day => date,
            Interval::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Interval::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?,
            Interval::Quarter => {
                NaiveDate::from_ymd_opt(date.year(), (date.month() - 1) / 3 * 3 + 1, 1)?
            }
            Interval::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
        };
        start.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n))
    }

    /// Start of the period after the one beginning at `floor`.
    fn advance(self, floor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Interval::Hour => floor.checked_add_signed(Duration::hours(1)),
            Interval::Day => floor.checked_add_signed(Duration::days(1)),
            Interval::Week => floor.checked_add_signed(Duration::weeks(1)),
            Interval::Month => floor.checked_add_months(Months::new(1)),
            Interval::Quarter => floor.checked_add_months(Months::new(3)),
            Interval::Year => floor.checked_add_months(Months::new(12)),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Quarter => "quarter",
            Interval::Year => "year",
        };
        f.write_str(name)
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            "quarter" => Ok(Interval::Quarter),
            "year" => Ok(Interval::Year),
            other => bail!(
                "Unknown partition interval '{}' (expected hour, day, week, month, quarter or year)",
                other
            ),
        }
    }
}

/// Half-open `[start, end)` slice of the created range.
///
/// When the job's range has no end, the newest partition is planned up to
/// the planning instant but reads with no upper bound (`open_end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open_end: bool,
}

impl Partition {
    pub fn new(index: usize, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            index,
            start,
            end,
            open_end: false,
        }
    }

    pub fn with_open_end(mut self) -> Self {
        self.open_end = true;
        self
    }

    pub fn range(&self) -> DateTimeRange {
        if self.open_end {
            DateTimeRange::since(Some(self.start))
        } else {
            DateTimeRange::between(self.start, self.end)
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.open_end {
            write!(f, "#{} [{}, ...)", self.index, format_source_datetime(self.start))
        } else {
            write!(
                f,
                "#{} [{}, {})",
                self.index,
                format_source_datetime(self.start),
                format_source_datetime(self.end)
            )
        }
    }
}

/// Split `[start, end)` at calendar boundaries of `interval`.
///
/// The first and last partitions are clipped to the range, so together the
/// partitions cover it exactly with no overlap. Indexes run oldest first.
pub fn partitions(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: Interval,
) -> Result<Vec<Partition>> {
    let mut result = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = interval
            .floor(cursor)
            .and_then(|floor| interval.advance(floor))
            .with_context(|| format!("Date out of range while partitioning at {}", cursor))?;
        let next = next.min(end);
        result.push(Partition::new(result.len(), cursor, next));
        cursor = next;
    }
    Ok(result)
}

/// Reads and writes one partition.
///
/// Implementations link their reader metrics to `reader_parent` and return
/// writer metrics that have no parent; the driver merges them into the job.
/// `job_metrics` is for progress reporting only and must not be written.
#[async_trait]
pub trait PartitionWorker: Send + Sync {
    async fn process(
        &self,
        partition: Partition,
        reader_parent: Arc<ReaderMetrics>,
        job_metrics: Arc<WriterMetrics>,
    ) -> Result<Arc<WriterMetrics>>;

    /// Called after a finished partition has been merged into `job_metrics`.
    fn merged(&self, _reader: &Arc<ReaderMetrics>, _job_metrics: &Arc<WriterMetrics>) {}
}

pub struct DatePartitionedReader {
    table: String,
    interval: Interval,
    threads: usize,
    partitions: Vec<Partition>,
    metrics: Arc<ReaderMetrics>,
}

impl DatePartitionedReader {
    /// Resolve the range bounds and plan the partitions.
    ///
    /// A missing start is the earliest created timestamp the source reports
    /// for the job's rows; a missing end plans up to now and leaves the newest
    /// partition open-ended. Counts the rows of the
    /// whole range and enforces `max_rows` against that count.
    pub async fn new(
        source: &dyn RecordSource,
        spec: &LoadSpec,
        interval: Interval,
        threads: usize,
    ) -> Result<Self> {
        let query = spec.base_query().with_updated_since(spec.since);

        let start = match spec.created.start {
            Some(start) => Some(start),
            None => source
                .earliest_created(&spec.table, &query)
                .await
                .with_context(|| format!("Failed to find earliest row of {}", spec.table))?,
        };
        let end = spec.created.end.unwrap_or_else(Utc::now);

        let mut planned = match start {
            Some(start) => partitions(start, end, interval)?,
            None => Vec::new(),
        };
        // rows created after planning still belong to the newest partition
        if spec.created.end.is_none() {
            if let Some(last) = planned.last_mut() {
                *last = last.with_open_end();
            }
        }

        let metrics = ReaderMetrics::new();
        let expected = source
            .count(&spec.table, &query)
            .await
            .with_context(|| format!("Failed to count rows in {}", spec.table))?;
        metrics.set_expected(Some(expected));
        if let Some(max_rows) = spec.max_rows {
            if expected > max_rows {
                return Err(JobError::TooManyRows {
                    table: spec.table.clone(),
                    max_rows,
                    expected,
                }
                .into());
            }
        }

        tracing::info!(
            "Planned {} {} partitions of {} ({} rows expected)",
            planned.len(),
            interval,
            spec.table,
            expected
        );

        Ok(Self {
            table: spec.table.clone(),
            interval,
            threads: threads.max(1),
            partitions: planned,
            metrics,
        })
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn metrics(&self) -> &Arc<ReaderMetrics> {
        &self.metrics
    }

    /// Run every partition through `worker`, newest first, at most `threads`
    /// at a time, merging each partition's writer metrics into `job_metrics`.
    ///
    /// After a partition fails no further partitions are started; those
    /// already running finish, then the first error is returned. A panic in
    /// a worker is resumed on the calling task.
    pub async fn run(
        &self,
        worker: Arc<dyn PartitionWorker>,
        job_metrics: &Arc<WriterMetrics>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.threads));
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for partition in self.partitions.iter().rev().copied() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Partition semaphore closed")?;
            if failed.load(Ordering::SeqCst) {
                tracing::warn!(
                    "Not starting partition {} of {} after an earlier failure",
                    partition,
                    self.table
                );
                break;
            }

            let worker = worker.clone();
            let parent = self.metrics.clone();
            let totals = job_metrics.clone();
            let failed = failed.clone();
            let span = tracing::info_span!(
                "partition",
                index = partition.index,
                start = %format_source_datetime(partition.start),
                end = %format_source_datetime(partition.end)
            );
            tasks.spawn(
                async move {
                    let _permit = permit;
                    tracing::debug!("Partition started");
                    let result = worker.process(partition, parent, totals).await;
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    (partition, result)
                }
                .instrument(span),
            );
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((partition, Ok(metrics))) => {
                    tracing::debug!(
                        "Partition {} of {} done: {} processed",
                        partition,
                        self.table,
                        metrics.processed()
                    );
                    job_metrics.add(&metrics);
                    worker.merged(&self.metrics, job_metrics);
                }
                Ok((partition, Err(e))) => {
                    tracing::error!("Partition {} of {} failed: {:#}", partition, self.table, e);
                    if first_error.is_none() {
                        first_error = Some(
                            e.context(format!("Partition {} of {} failed", partition, self.table)),
                        );
                    }
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(
                            JobError::PartitionInterrupted {
                                table: self.table.clone(),
                            }
                            .into(),
                        );
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_source_datetime;

    fn at(s: &str) -> DateTime<Utc> {
        parse_source_datetime(s).unwrap()
    }

    fn assert_covers(parts: &[Partition], start: DateTime<Utc>, end: DateTime<Utc>) {
        assert_eq!(parts.first().unwrap().start, start);
        assert_eq!(parts.last().unwrap().end, end);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
    }

    #[test]
    fn test_five_days_make_five_partitions() {
        let parts = partitions(at("2024-03-01"), at("2024-03-06"), Interval::Day).unwrap();
        assert_eq!(parts.len(), 5);
        assert_covers(&parts, at("2024-03-01"), at("2024-03-06"));
        assert_eq!(parts[4].index, 4);
    }

    #[test]
    fn test_unaligned_bounds_are_clipped() {
        let start = at("2024-03-01 13:30:00");
        let end = at("2024-03-03 06:00:00");
        let parts = partitions(start, end, Interval::Day).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].end, at("2024-03-02"));
        assert_covers(&parts, start, end);
    }

    #[test]
    fn test_calendar_aligned_intervals() {
        // 2024-01-03 is a Wednesday
        let weeks = partitions(at("2024-01-03"), at("2024-01-20"), Interval::Week).unwrap();
        assert_eq!(weeks[0].end, at("2024-01-08"));
        assert_eq!(weeks.len(), 3);

        let months = partitions(at("2024-01-15"), at("2024-04-01"), Interval::Month).unwrap();
        assert_eq!(months.len(), 3);
        assert_eq!(months[1].start, at("2024-02-01"));
        assert_eq!(months[1].end, at("2024-03-01"));

        let quarters = partitions(at("2023-11-10"), at("2024-05-01"), Interval::Quarter).unwrap();
        assert_eq!(quarters.len(), 3);
        assert_eq!(quarters[0].end, at("2024-01-01"));
        assert_eq!(quarters[1].end, at("2024-04-01"));

        let hours = partitions(at("2024-01-01 10:15:00"), at("2024-01-01 12:00:00"), Interval::Hour)
            .unwrap();
        assert_eq!(hours.len(), 2);
    }

    #[test]
    fn test_empty_range_has_no_partitions() {
        assert!(partitions(at("2024-03-01"), at("2024-03-01"), Interval::Day)
            .unwrap()
            .is_empty());
        assert!(partitions(at("2024-03-02"), at("2024-03-01"), Interval::Year)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_every_instant_lands_in_exactly_one_partition() {
        let start = at("2023-12-30 17:00:00");
        let end = at("2024-02-02 03:00:00");
        for interval in [Interval::Day, Interval::Week, Interval::Month, Interval::Year] {
            let parts = partitions(start, end, interval).unwrap();
            let mut t = start;
            while t < end {
                let hits = parts.iter().filter(|p| p.range().contains(t)).count();
                assert_eq!(hits, 1, "{} at {}", interval, t);
                t += Duration::hours(7);
            }
        }
    }

    #[tokio::test]
    async fn test_open_ended_range_leaves_newest_partition_unbounded() {
        use crate::memory::MemorySource;
        use crate::reader::ReaderFactory;
        use crate::record::Record;
        use crate::source::{EncodedQuery, TableQuery};

        let source = Arc::new(MemorySource::new());
        // one row from the past and one created after the plan is made
        let later = Utc::now() + Duration::hours(1);
        for (key, created) in [
            ("old", "2024-01-01 00:00:00".to_string()),
            ("fresh", format_source_datetime(later)),
        ] {
            source.insert(
                Record::from_json(
                    "incident",
                    serde_json::json!({"sys_id": key, "sys_created_on": created}),
                )
                .unwrap(),
            );
        }
        let spec = LoadSpec {
            table: "incident".to_string(),
            filter: None,
            created: DateTimeRange::since(Some(at("2024-01-01"))),
            since: None,
            fields: vec![],
            page_size: 10,
            order_by_keys: false,
            max_rows: None,
        };

        let driver = DatePartitionedReader::new(source.as_ref(), &spec, Interval::Year, 1)
            .await
            .unwrap();
        let (newest, older) = driver.partitions().split_last().unwrap();
        assert!(newest.open_end);
        assert!(older.iter().all(|p| !p.open_end));

        let rendered = EncodedQuery::from(&TableQuery::new().with_created(newest.range()));
        assert!(!rendered.to_string().contains("sys_created_on<"));

        let factory = ReaderFactory::new(source, spec);
        let mut reader = factory.create(Some(newest), None);
        reader.initialize().await.unwrap();
        let mut keys = Vec::new();
        while let Some(page) = reader.next_page().await.unwrap() {
            keys.extend(page.records().iter().map(|r| r.key().to_string()));
        }
        assert_eq!(keys, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("Quarter".parse::<Interval>().unwrap(), Interval::Quarter);
        assert!("fortnight".parse::<Interval>().is_err());
        let parsed: Interval = serde_json::from_str("\"week\"").unwrap();
        assert_eq!(parsed, Interval::Week);
    }
}
