// ABOUTME: Daemon host - runs jobs on an interval, reports status, escalates fatal faults
// ABOUTME: Ordinary job failures are absorbed; panics and out-of-memory trip the supervisor

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

use crate::config::{JobConfig, ReplicatorConfig};
use crate::metrics::{ReaderMetrics, WriterMetrics, WriterSnapshot};
use crate::progress::{root_reader, CompositeProgressLogger, ProgressLogger};
use crate::runner::JobRunner;
use crate::state::CheckpointStore;

/// Receives the lifecycle of every daemon-run job.
pub trait StatusSink: Send + Sync {
    fn job_started(&self, run_key: &str, job: &str);
    fn progress(&self, run_key: &str, job: &str, reader: &ReaderMetrics, writer: &WriterMetrics);
    fn job_completed(&self, run_key: &str, job: &str, metrics: &WriterMetrics);
    fn log_error(&self, run_key: &str, error: &anyhow::Error);
}

/// Status sink writing to the tracing log.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn job_started(&self, run_key: &str, job: &str) {
        tracing::info!(run_key, "Job {} started", job);
    }

    fn progress(&self, run_key: &str, job: &str, reader: &ReaderMetrics, writer: &WriterMetrics) {
        tracing::debug!(
            run_key,
            "Job {}: read {} written {}",
            job,
            root_reader(reader).progress(),
            writer.processed()
        );
    }

    fn job_completed(&self, run_key: &str, job: &str, metrics: &WriterMetrics) {
        tracing::info!(run_key, "Job {} completed: {} rows", job, metrics.processed());
    }

    fn log_error(&self, run_key: &str, error: &anyhow::Error) {
        tracing::error!(run_key, "Job failed: {:#}", error);
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StatusEvent<'a> {
    Started {
        run_key: &'a str,
        job: &'a str,
        at: DateTime<Utc>,
    },
    Progress {
        run_key: &'a str,
        job: &'a str,
        at: DateTime<Utc>,
        read: u64,
        expected: Option<u64>,
        processed: u64,
    },
    Completed {
        run_key: &'a str,
        job: &'a str,
        at: DateTime<Utc>,
        metrics: WriterSnapshot,
    },
    Error {
        run_key: &'a str,
        at: DateTime<Utc>,
        message: String,
    },
}

/// Status sink appending one JSON object per event to a file.
pub struct JsonLinesStatusSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStatusSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open status file {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn write(&self, event: &StatusEvent<'_>) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize status event: {}", e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!("Failed to write status to {:?}: {}", self.path, e);
        }
    }
}

impl StatusSink for JsonLinesStatusSink {
    fn job_started(&self, run_key: &str, job: &str) {
        self.write(&StatusEvent::Started {
            run_key,
            job,
            at: Utc::now(),
        });
    }

    fn progress(&self, run_key: &str, job: &str, reader: &ReaderMetrics, writer: &WriterMetrics) {
        let root = root_reader(reader);
        self.write(&StatusEvent::Progress {
            run_key,
            job,
            at: Utc::now(),
            read: root.count(),
            expected: root.expected(),
            processed: writer.processed(),
        });
    }

    fn job_completed(&self, run_key: &str, job: &str, metrics: &WriterMetrics) {
        self.write(&StatusEvent::Completed {
            run_key,
            job,
            at: Utc::now(),
            metrics: metrics.snapshot(),
        });
    }

    fn log_error(&self, run_key: &str, error: &anyhow::Error) {
        self.write(&StatusEvent::Error {
            run_key,
            at: Utc::now(),
            message: format!("{:#}", error),
        });
    }
}

/// Forwards dispatcher progress for one run to a status sink.
pub struct StatusProgressLogger {
    run_key: String,
    sink: Arc<dyn StatusSink>,
}

impl StatusProgressLogger {
    pub fn new(run_key: &str, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            run_key: run_key.to_string(),
            sink,
        }
    }
}

impl ProgressLogger for StatusProgressLogger {
    fn progress(&self, operation: &str, reader: &ReaderMetrics, writer: &WriterMetrics) {
        self.sink.progress(&self.run_key, operation, reader, writer);
    }

    fn complete(&self, operation: &str, writer: &WriterMetrics) {
        self.sink.job_completed(&self.run_key, operation, writer);
    }
}

/// An unrecoverable fault raised inside a job task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalFault {
    pub run_key: String,
    pub job: String,
    pub message: String,
}

/// Carries fatal faults from job tasks to the process owner.
///
/// Once tripped, the daemon schedules no further jobs; the owner of the
/// receiver decides how the process ends.
#[derive(Clone)]
pub struct Supervisor {
    tripped: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<FatalFault>,
}

impl Supervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FatalFault>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let supervisor = Self {
            tripped: Arc::new(AtomicBool::new(false)),
            sender,
        };
        (supervisor, receiver)
    }

    pub fn signal(&self, fault: FatalFault) {
        tracing::error!(
            run_key = %fault.run_key,
            "Fatal fault in job {}: {}",
            fault.job,
            fault.message
        );
        self.tripped.store(true, Ordering::SeqCst);
        // The receiver may already be gone during shutdown.
        let _ = self.sender.send(fault);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

fn is_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|e| e.kind() == ErrorKind::OutOfMemory)
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Runs one job as an isolated unit of work for a long-running host.
#[derive(Clone)]
pub struct DaemonJobRunner {
    runner: JobRunner,
    sink: Arc<dyn StatusSink>,
    supervisor: Supervisor,
}

impl DaemonJobRunner {
    pub fn new(runner: JobRunner, sink: Arc<dyn StatusSink>, supervisor: Supervisor) -> Self {
        Self {
            runner,
            sink,
            supervisor,
        }
    }

    pub fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run `job` in its own task.
    ///
    /// Returns the job metrics on success. Ordinary failures are logged,
    /// reported to the sink and yield `None`. Panics and out-of-memory errors
    /// are signalled on the supervisor instead.
    pub async fn run(&self, job: JobConfig) -> Option<Arc<WriterMetrics>> {
        let run_key = Uuid::new_v4().to_string();
        let name = job.name.clone();
        self.sink.job_started(&run_key, &name);

        let status: Arc<dyn ProgressLogger> =
            Arc::new(StatusProgressLogger::new(&run_key, self.sink.clone()));
        let progress = CompositeProgressLogger::new(vec![self.runner.progress().clone(), status]);
        let runner = self.runner.with_progress(Arc::new(progress));

        let mut task = JobTask(tokio::spawn(async move { runner.run(&job).await }));
        let error = match (&mut task.0).await {
            Ok(Ok(metrics)) => return Some(metrics),
            Ok(Err(e)) if is_fatal(&e) => {
                self.supervisor.signal(FatalFault {
                    run_key,
                    job: name,
                    message: format!("{:#}", e),
                });
                return None;
            }
            Ok(Err(e)) => e,
            Err(join_error) if join_error.is_panic() => {
                self.supervisor.signal(FatalFault {
                    run_key,
                    job: name,
                    message: panic_message(join_error.into_panic()),
                });
                return None;
            }
            Err(_) => anyhow!("Job {} was cancelled", name),
        };

        tracing::error!(run_key = %run_key, "Job {} failed: {:?}", name, error);
        self.sink.log_error(&run_key, &error);
        None
    }
}

/// A spawned job that is aborted if its caller stops waiting for it, so a
/// cancelled cycle never leaves the job writing in the background.
struct JobTask<T>(JoinHandle<T>);

impl<T> Drop for JobTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Outcome of one pass over the configured jobs.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub rows_processed: u64,
    pub duration_ms: u64,
}

impl CycleStats {
    pub fn is_success(&self) -> bool {
        self.jobs_failed == 0
    }
}

/// Runs the configured jobs once per interval until shutdown.
pub struct Daemon {
    config: ReplicatorConfig,
    jobs: Vec<String>,
    runner: DaemonJobRunner,
}

impl Daemon {
    pub fn new(config: ReplicatorConfig, runner: DaemonJobRunner) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            runner,
        }
    }

    /// Restrict each cycle to the named jobs.
    pub fn with_jobs(mut self, jobs: Vec<String>) -> Self {
        self.jobs = jobs;
        self
    }

    async fn load_checkpoints(&self) -> CheckpointStore {
        let path = &self.config.daemon.state_path;
        match CheckpointStore::load_or_default(path).await {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(
                    "Failed to load checkpoints from {:?}: {}. Starting without them.",
                    path,
                    e
                );
                CheckpointStore::default()
            }
        }
    }

    /// Run every selected job once, in file order.
    ///
    /// Stops early if the supervisor trips. Checkpoints are saved after each
    /// successful job.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let start = std::time::Instant::now();
        let mut stats = CycleStats::default();
        let mut store = self.load_checkpoints().await;

        for def in self.config.select_jobs(&self.jobs)? {
            if self.runner.supervisor().is_tripped() {
                tracing::warn!("Supervisor tripped, not starting job {}", def.name);
                break;
            }

            let job = match def.resolve(store.get(&def.name)) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!("Job {} could not be resolved: {:?}", def.name, e);
                    self.runner
                        .sink()
                        .log_error(&Uuid::new_v4().to_string(), &e);
                    stats.jobs_failed += 1;
                    continue;
                }
            };

            match self.runner.run(job).await {
                Some(metrics) => {
                    stats.jobs_succeeded += 1;
                    stats.rows_processed += metrics.processed();
                    store.record(&def.name, &def.fingerprint(), &metrics);
                    store.save(&self.config.daemon.state_path).await?;
                }
                None => stats.jobs_failed += 1,
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Run cycles until `shutdown` fires or the supervisor trips.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let period = Duration::from_secs(self.config.daemon.interval_secs);
        let mut ticker = interval(period);
        let mut cycles = 0u64;

        tracing::info!("Starting daemon with interval={:?}", period);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping daemon");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    tracing::info!("Starting cycle {}", cycles);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during cycle {}, aborting", cycles);
                            break;
                        }
                        result = self.run_cycle() => {
                            match result {
                                Ok(stats) => {
                                    tracing::info!(
                                        "Cycle {} completed: {} jobs, {} rows in {}ms",
                                        cycles,
                                        stats.jobs_succeeded,
                                        stats.rows_processed,
                                        stats.duration_ms
                                    );
                                    if !stats.is_success() {
                                        tracing::warn!("Cycle {} had {} failed jobs", cycles, stats.jobs_failed);
                                    }
                                }
                                Err(e) => {
                                    tracing::error!("Cycle {} failed: {:?}", cycles, e);
                                }
                            }
                        }
                    }

                    if self.runner.supervisor().is_tripped() {
                        tracing::error!("Supervisor tripped, stopping daemon");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_is_fatal() {
        let oom = anyhow::Error::from(std::io::Error::from(ErrorKind::OutOfMemory))
            .context("fetching page");
        assert!(is_fatal(&oom));

        let refused = anyhow::Error::from(std::io::Error::from(ErrorKind::ConnectionRefused));
        assert!(!is_fatal(&refused));
        assert!(!is_fatal(&anyhow!("plain failure")));
    }

    #[test]
    fn test_supervisor_trips_and_delivers() {
        let (supervisor, mut receiver) = Supervisor::new();
        assert!(!supervisor.is_tripped());
        supervisor.signal(FatalFault {
            run_key: "k".to_string(),
            job: "incident".to_string(),
            message: "boom".to_string(),
        });
        assert!(supervisor.clone().is_tripped());
        assert_eq!(receiver.try_recv().unwrap().job, "incident");
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(7)), "panic with a non-string payload");
    }

    #[test]
    fn test_cycle_stats_success() {
        let stats = CycleStats {
            jobs_succeeded: 3,
            ..CycleStats::default()
        };
        assert!(stats.is_success());
        let failed = CycleStats {
            jobs_failed: 1,
            ..stats
        };
        assert!(!failed.is_success());
    }
}
