// ABOUTME: Hierarchical read-progress and write-outcome counters
// ABOUTME: Child nodes propagate every increment to their parent under per-node locks

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ReaderCounts {
    count: u64,
    expected: Option<u64>,
}

/// Read progress for one reader, optionally linked to a parent reader.
///
/// Partition readers link to the partitioned driver's node so the driver
/// always shows the total number of rows read so far.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    counts: Mutex<ReaderCounts>,
    parent: Option<Arc<ReaderMetrics>>,
}

impl ReaderMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_parent(parent: Arc<ReaderMetrics>) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(ReaderCounts::default()),
            parent: Some(parent),
        })
    }

    pub fn parent(&self) -> Option<&Arc<ReaderMetrics>> {
        self.parent.as_ref()
    }

    /// Add `n` to this node and every ancestor.
    pub fn increment(&self, n: u64) {
        let mut counts = lock(&self.counts);
        counts.count += n;
        if let Some(parent) = &self.parent {
            parent.increment(n);
        }
    }

    pub fn count(&self) -> u64 {
        lock(&self.counts).count
    }

    /// Set the number of rows the reader expects to return.
    pub fn set_expected(&self, expected: Option<u64>) {
        lock(&self.counts).expected = expected;
    }

    pub fn expected(&self) -> Option<u64> {
        lock(&self.counts).expected
    }

    pub fn progress(&self) -> String {
        let counts = lock(&self.counts);
        match counts.expected {
            Some(expected) => format!("{} / {}", counts.count, expected),
            None => counts.count.to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WriterCounts {
    inserted: u64,
    updated: u64,
    deleted: u64,
    skipped: u64,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
}

/// Point-in-time copy of a [`WriterMetrics`] node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterSnapshot {
    pub name: Option<String>,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub processed: u64,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// Write outcomes for one writer (or one job), optionally linked to a parent.
///
/// A node is either live-linked to its parent, in which case every counter
/// change propagates immediately, or merged into an unlinked parent exactly
/// once with [`WriterMetrics::add`] after it finishes. Doing both counts rows
/// twice.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    name: Option<String>,
    counts: Mutex<WriterCounts>,
    parent: Option<Arc<WriterMetrics>>,
}

impl WriterMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn named(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: Some(name.into()),
            ..Self::default()
        })
    }

    pub fn with_parent(parent: Arc<WriterMetrics>) -> Arc<Self> {
        Arc::new(Self {
            name: None,
            counts: Mutex::new(WriterCounts::default()),
            parent: Some(parent),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<&Arc<WriterMetrics>> {
        self.parent.as_ref()
    }

    /// Start the clock. Only the first call sets the start time.
    pub fn start(&self) {
        if let Some(parent) = &self.parent {
            parent.start();
        }
        let mut counts = lock(&self.counts);
        if counts.started.is_none() {
            counts.started = Some(Utc::now());
        }
    }

    /// Stop the clock. Later calls move the finish time forward.
    pub fn finish(&self) {
        {
            let mut counts = lock(&self.counts);
            counts.finished = Some(Utc::now());
        }
        if let Some(parent) = &self.parent {
            parent.finish();
        }
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        lock(&self.counts).started
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        lock(&self.counts).finished
    }

    pub fn elapsed_secs(&self) -> f64 {
        let counts = lock(&self.counts);
        match (counts.started, counts.finished) {
            (Some(start), Some(finish)) => (finish - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    pub fn inserted(&self) -> u64 {
        lock(&self.counts).inserted
    }

    pub fn updated(&self) -> u64 {
        lock(&self.counts).updated
    }

    pub fn deleted(&self) -> u64 {
        lock(&self.counts).deleted
    }

    pub fn skipped(&self) -> u64 {
        lock(&self.counts).skipped
    }

    /// Inserted + updated + deleted + skipped.
    pub fn processed(&self) -> u64 {
        let counts = lock(&self.counts);
        counts.inserted + counts.updated + counts.deleted + counts.skipped
    }

    pub fn increment_inserted(&self) {
        self.add_inserted(1);
    }

    pub fn increment_updated(&self) {
        self.add_updated(1);
    }

    pub fn increment_deleted(&self) {
        self.add_deleted(1);
    }

    pub fn increment_skipped(&self) {
        self.add_skipped(1);
    }

    pub fn add_inserted(&self, n: u64) {
        let mut counts = lock(&self.counts);
        counts.inserted += n;
        if let Some(parent) = &self.parent {
            parent.add_inserted(n);
        }
    }

    pub fn add_updated(&self, n: u64) {
        let mut counts = lock(&self.counts);
        counts.updated += n;
        if let Some(parent) = &self.parent {
            parent.add_updated(n);
        }
    }

    pub fn add_deleted(&self, n: u64) {
        let mut counts = lock(&self.counts);
        counts.deleted += n;
        if let Some(parent) = &self.parent {
            parent.add_deleted(n);
        }
    }

    pub fn add_skipped(&self, n: u64) {
        let mut counts = lock(&self.counts);
        counts.skipped += n;
        if let Some(parent) = &self.parent {
            parent.add_skipped(n);
        }
    }

    /// Merge the totals of a completed, unlinked sibling into this node.
    ///
    /// Keeps the earliest start and the latest finish of the two. Does not
    /// propagate to this node's parent.
    pub fn add(&self, other: &WriterMetrics) {
        debug_assert!(
            other.parent.is_none(),
            "merging a live-linked metrics node double counts"
        );
        let theirs = *lock(&other.counts);
        let mut counts = lock(&self.counts);
        if let Some(start) = theirs.started {
            if counts.started.map_or(true, |mine| mine > start) {
                counts.started = Some(start);
            }
        }
        if let Some(finish) = theirs.finished {
            if counts.finished.map_or(true, |mine| mine < finish) {
                counts.finished = Some(finish);
            }
        }
        counts.inserted += theirs.inserted;
        counts.updated += theirs.updated;
        counts.deleted += theirs.deleted;
        counts.skipped += theirs.skipped;
    }

    pub fn snapshot(&self) -> WriterSnapshot {
        let counts = *lock(&self.counts);
        WriterSnapshot {
            name: self.name.clone(),
            inserted: counts.inserted,
            updated: counts.updated,
            deleted: counts.deleted,
            skipped: counts.skipped,
            processed: counts.inserted + counts.updated + counts.deleted + counts.skipped,
            started: counts.started,
            finished: counts.finished,
        }
    }

    /// Render as `name.key=value` lines.
    pub fn to_properties(&self) -> String {
        let prefix = self
            .name
            .as_ref()
            .map(|n| format!("{}.", n))
            .unwrap_or_default();
        let snap = self.snapshot();
        let fmt_time = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        let mut out = String::new();
        out.push_str(&format!("{}start={}\n", prefix, fmt_time(snap.started)));
        out.push_str(&format!("{}finish={}\n", prefix, fmt_time(snap.finished)));
        out.push_str(&format!("{}elapsed={:.1}\n", prefix, self.elapsed_secs()));
        out.push_str(&format!("{}inserted={}\n", prefix, snap.inserted));
        out.push_str(&format!("{}updated={}\n", prefix, snap.updated));
        out.push_str(&format!("{}deleted={}\n", prefix, snap.deleted));
        out.push_str(&format!("{}skipped={}\n", prefix, snap.skipped));
        out.push_str(&format!("{}processed={}\n", prefix, snap.processed));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_increment_propagates_to_every_ancestor() {
        let root = ReaderMetrics::new();
        let middle = ReaderMetrics::with_parent(root.clone());
        let leaf = ReaderMetrics::with_parent(middle.clone());

        leaf.increment(7);
        middle.increment(3);

        assert_eq!(leaf.count(), 7);
        assert_eq!(middle.count(), 10);
        assert_eq!(root.count(), 10);
    }

    #[test]
    fn test_reader_progress_with_and_without_expected() {
        let metrics = ReaderMetrics::new();
        metrics.increment(5);
        assert_eq!(metrics.progress(), "5");
        metrics.set_expected(Some(20));
        assert_eq!(metrics.progress(), "5 / 20");
    }

    #[test]
    fn test_writer_counters_propagate_to_parent() {
        let parent = WriterMetrics::named("job");
        let child = WriterMetrics::with_parent(parent.clone());

        child.increment_inserted();
        child.add_updated(2);
        child.increment_deleted();
        child.add_skipped(4);

        assert_eq!(child.processed(), 8);
        assert_eq!(parent.inserted(), 1);
        assert_eq!(parent.updated(), 2);
        assert_eq!(parent.deleted(), 1);
        assert_eq!(parent.skipped(), 4);
        assert_eq!(parent.processed(), 8);
    }

    #[test]
    fn test_start_and_finish_propagate_and_are_repeatable() {
        let parent = WriterMetrics::new();
        let child = WriterMetrics::with_parent(parent.clone());

        child.start();
        let first_start = child.started();
        child.start();
        assert_eq!(child.started(), first_start);
        assert!(parent.started().is_some());

        child.finish();
        child.finish();
        assert!(child.finished().is_some());
        assert!(parent.finished().is_some());
        assert!(child.elapsed_secs() >= 0.0);
    }

    #[test]
    fn test_add_merges_counts_and_widens_time_window() {
        let job = WriterMetrics::named("job");
        let a = WriterMetrics::new();
        let b = WriterMetrics::new();

        a.start();
        a.add_inserted(3);
        a.add_skipped(1);
        a.finish();

        b.start();
        b.add_updated(2);
        b.add_deleted(5);
        b.finish();

        job.add(&a);
        job.add(&b);

        assert_eq!(job.inserted(), 3);
        assert_eq!(job.updated(), 2);
        assert_eq!(job.deleted(), 5);
        assert_eq!(job.skipped(), 1);
        assert_eq!(job.processed(), a.processed() + b.processed());
        assert_eq!(job.started(), a.started());
        assert_eq!(job.finished(), b.finished());
    }

    #[test]
    fn test_add_does_not_propagate_to_parent() {
        let root = WriterMetrics::new();
        let job = WriterMetrics::with_parent(root.clone());
        let partition = WriterMetrics::new();
        partition.add_inserted(4);

        job.add(&partition);

        assert_eq!(job.inserted(), 4);
        assert_eq!(root.inserted(), 0);
    }

    #[test]
    fn test_properties_rendering() {
        let metrics = WriterMetrics::named("incident");
        metrics.add_inserted(2);
        metrics.add_skipped(1);
        let props = metrics.to_properties();
        assert!(props.contains("incident.inserted=2\n"));
        assert!(props.contains("incident.skipped=1\n"));
        assert!(props.contains("incident.processed=3\n"));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let parent = WriterMetrics::new();
        let reader_parent = ReaderMetrics::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let child = WriterMetrics::with_parent(parent.clone());
                let reader = ReaderMetrics::with_parent(reader_parent.clone());
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        child.increment_inserted();
                        reader.increment(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(parent.inserted(), 8000);
        assert_eq!(reader_parent.count(), 8000);
    }
}
