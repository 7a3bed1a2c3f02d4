// ABOUTME: Progress sinks fed after every page and at job completion
// ABOUTME: Log lines via tracing, terminal bars via indicatif, or several at once

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::metrics::{ReaderMetrics, WriterMetrics};

/// Receives read/write progress for a named operation (usually a job name).
pub trait ProgressLogger: Send + Sync {
    fn progress(&self, operation: &str, reader: &ReaderMetrics, writer: &WriterMetrics);

    fn complete(&self, operation: &str, writer: &WriterMetrics);
}

/// Topmost ancestor of a reader node; partition readers report the job total.
pub fn root_reader(reader: &ReaderMetrics) -> &ReaderMetrics {
    let mut node = reader;
    while let Some(parent) = node.parent() {
        node = parent.as_ref();
    }
    node
}

fn outcome(writer: &WriterMetrics) -> String {
    format!(
        "inserted={} updated={} deleted={} skipped={}",
        writer.inserted(),
        writer.updated(),
        writer.deleted(),
        writer.skipped()
    )
}

/// Writes progress as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressLogger;

impl ProgressLogger for TracingProgressLogger {
    fn progress(&self, operation: &str, reader: &ReaderMetrics, writer: &WriterMetrics) {
        tracing::info!(
            "{}: read {} ({})",
            operation,
            root_reader(reader).progress(),
            outcome(writer)
        );
    }

    fn complete(&self, operation: &str, writer: &WriterMetrics) {
        tracing::info!(
            "{}: completed {} rows in {:.1}s ({})",
            operation,
            writer.processed(),
            writer.elapsed_secs(),
            outcome(writer)
        );
    }
}

/// One terminal progress bar per operation.
pub struct BarProgressLogger {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl BarProgressLogger {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, operation: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        bars.entry(operation.to_string())
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(0));
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                pb.set_message(operation.to_string());
                pb
            })
            .clone()
    }
}

impl Default for BarProgressLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLogger for BarProgressLogger {
    fn progress(&self, operation: &str, reader: &ReaderMetrics, _writer: &WriterMetrics) {
        let root = root_reader(reader);
        let pb = self.bar(operation);
        if let Some(expected) = root.expected() {
            pb.set_length(expected);
        }
        pb.set_position(root.count());
    }

    fn complete(&self, operation: &str, writer: &WriterMetrics) {
        let pb = self.bar(operation);
        pb.finish_with_message(format!("{} done: {}", operation, outcome(writer)));
    }
}

/// Fans every call out to each inner logger in order.
#[derive(Clone, Default)]
pub struct CompositeProgressLogger {
    loggers: Vec<Arc<dyn ProgressLogger>>,
}

impl CompositeProgressLogger {
    pub fn new(loggers: Vec<Arc<dyn ProgressLogger>>) -> Self {
        Self { loggers }
    }

    pub fn push(&mut self, logger: Arc<dyn ProgressLogger>) {
        self.loggers.push(logger);
    }
}

impl ProgressLogger for CompositeProgressLogger {
    fn progress(&self, operation: &str, reader: &ReaderMetrics, writer: &WriterMetrics) {
        for logger in &self.loggers {
            logger.progress(operation, reader, writer);
        }
    }

    fn complete(&self, operation: &str, writer: &WriterMetrics) {
        for logger in &self.loggers {
            logger.complete(operation, writer);
        }
    }
}
