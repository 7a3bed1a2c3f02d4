// ABOUTME: Integration tests for the daemon host
// ABOUTME: Error absorption, fatal fault escalation, status files and checkpointed cycles

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use record_replicator::config::{Action, JobConfig, ReplicatorConfig};
use record_replicator::daemon::{
    Daemon, DaemonJobRunner, JsonLinesStatusSink, LogStatusSink, StatusSink, Supervisor,
};
use record_replicator::memory::{MemoryConnector, MemoryDatabase, MemorySource};
use record_replicator::progress::TracingProgressLogger;
use record_replicator::record::{KeySet, Record};
use record_replicator::source::{PageWindow, RecordSource, TableQuery, TableSchema};
use record_replicator::state::CheckpointStore;
use record_replicator::JobRunner;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Wraps a memory source and misbehaves when paging one table.
struct FaultySource {
    inner: MemorySource,
    table: String,
    out_of_memory: bool,
}

#[async_trait]
impl RecordSource for FaultySource {
    fn default_page_size(&self) -> u64 {
        self.inner.default_page_size()
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.inner.table_schema(table).await
    }

    async fn count(&self, table: &str, query: &TableQuery) -> Result<u64> {
        self.inner.count(table, query).await
    }

    async fn fetch_page(
        &self,
        table: &str,
        query: &TableQuery,
        fields: &[String],
        window: PageWindow,
    ) -> Result<Vec<Record>> {
        if table == self.table {
            if self.out_of_memory {
                return Err(anyhow::Error::from(std::io::Error::from(ErrorKind::OutOfMemory))
                    .context("Failed to buffer response"));
            }
            panic!("source exploded while paging {}", table);
        }
        self.inner.fetch_page(table, query, fields, window).await
    }

    async fn fetch_keys(&self, table: &str, query: &TableQuery) -> Result<KeySet> {
        self.inner.fetch_keys(table, query).await
    }

    async fn earliest_created(
        &self,
        table: &str,
        query: &TableQuery,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.earliest_created(table, query).await
    }
}

fn record(table: &str, key: &str) -> Record {
    Record::from_json(
        table,
        json!({
            "sys_id": key,
            "sys_created_on": "2024-01-01 00:00:00",
            "sys_updated_on": "2024-01-02 00:00:00",
        }),
    )
    .unwrap()
}

fn memory_source() -> MemorySource {
    let source = MemorySource::new();
    for i in 0..4 {
        source.insert(record("incident", &format!("i{}", i)));
        source.insert(record("boom", &format!("b{}", i)));
    }
    source
}

fn faulty_source(out_of_memory: bool) -> Arc<dyn RecordSource> {
    Arc::new(FaultySource {
        inner: memory_source(),
        table: "boom".to_string(),
        out_of_memory,
    })
}

fn job_runner(source: Arc<dyn RecordSource>, db: Arc<MemoryDatabase>) -> JobRunner {
    JobRunner::new(
        source,
        Arc::new(MemoryConnector::new(db)),
        Arc::new(TracingProgressLogger),
    )
}

fn load_job(name: &str, source: &str) -> JobConfig {
    let mut job = JobConfig::new(name, Action::Load, source);
    job.auto_create = true;
    job
}

fn status_events(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn event_names(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["event"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_ordinary_failure_is_absorbed_and_reported() {
    let dir = tempdir().unwrap();
    let status_path = dir.path().join("status.jsonl");
    let sink: Arc<dyn StatusSink> = Arc::new(JsonLinesStatusSink::open(&status_path).unwrap());

    let source = Arc::new(memory_source());
    source.fail_table("incident");
    let (supervisor, mut faults) = Supervisor::new();
    let runner = DaemonJobRunner::new(
        job_runner(source, MemoryDatabase::new()),
        sink,
        supervisor.clone(),
    );

    let outcome = runner.run(load_job("incident", "incident")).await;

    assert!(outcome.is_none());
    assert!(!supervisor.is_tripped());
    assert!(faults.try_recv().is_err());

    let events = status_events(&status_path);
    assert_eq!(event_names(&events), vec!["started", "error"]);
    assert_eq!(events[0]["run_key"], events[1]["run_key"]);
    assert!(events[1]["message"].as_str().unwrap().contains("500"));
}

#[tokio::test]
async fn test_success_reports_progress_and_completion() {
    let dir = tempdir().unwrap();
    let status_path = dir.path().join("nested").join("status.jsonl");
    let sink: Arc<dyn StatusSink> = Arc::new(JsonLinesStatusSink::open(&status_path).unwrap());
    let (supervisor, _faults) = Supervisor::new();
    let db = MemoryDatabase::new();
    let runner = DaemonJobRunner::new(
        job_runner(Arc::new(memory_source()), db.clone()),
        sink,
        supervisor,
    );

    let metrics = runner.run(load_job("incident", "incident")).await.unwrap();
    assert_eq!(metrics.inserted(), 4);
    assert_eq!(db.row_count("incident"), 4);

    let events = status_events(&status_path);
    let names = event_names(&events);
    assert_eq!(names.first().map(String::as_str), Some("started"));
    assert!(names.contains(&"progress".to_string()));
    let completed = events.last().unwrap();
    assert_eq!(completed["event"], "completed");
    assert_eq!(completed["job"], "incident");
    assert_eq!(completed["metrics"]["processed"], 4);
}

#[tokio::test]
async fn test_panic_in_job_trips_the_supervisor() {
    let (supervisor, mut faults) = Supervisor::new();
    let runner = DaemonJobRunner::new(
        job_runner(faulty_source(false), MemoryDatabase::new()),
        Arc::new(LogStatusSink),
        supervisor.clone(),
    );

    let outcome = runner.run(load_job("boom", "boom")).await;

    assert!(outcome.is_none());
    assert!(supervisor.is_tripped());
    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.job, "boom");
    assert!(fault.message.contains("source exploded"));
}

#[tokio::test]
async fn test_out_of_memory_trips_the_supervisor() {
    let dir = tempdir().unwrap();
    let status_path = dir.path().join("status.jsonl");
    let sink: Arc<dyn StatusSink> = Arc::new(JsonLinesStatusSink::open(&status_path).unwrap());
    let (supervisor, mut faults) = Supervisor::new();
    let runner = DaemonJobRunner::new(
        job_runner(faulty_source(true), MemoryDatabase::new()),
        sink,
        supervisor.clone(),
    );

    assert!(runner.run(load_job("boom", "boom")).await.is_none());
    assert!(supervisor.is_tripped());
    assert_eq!(faults.try_recv().unwrap().job, "boom");
    // escalated, not reported as an ordinary job error
    assert_eq!(event_names(&status_events(&status_path)), vec!["started"]);
}

fn daemon_config(state_path: &Path, jobs: &str) -> ReplicatorConfig {
    let text = format!(
        r#"
[source]
url = "https://dev123.service-now.com"

[target]
url = "postgresql://dw@localhost:5432/mart"

[daemon]
interval_secs = 60
state_path = "{}"

{}
"#,
        state_path.display(),
        jobs
    );
    ReplicatorConfig::parse(&text).unwrap()
}

#[tokio::test]
async fn test_cycle_checkpoints_successes_and_continues_past_failures() {
    let dir = tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let config = daemon_config(
        &state_path,
        r#"
[[jobs]]
name = "missing"
source = "no_such_table"
auto_create = true

[[jobs]]
name = "incident"
source = "incident"
auto_create = true
since = "last"
"#,
    );
    let (supervisor, _faults) = Supervisor::new();
    let db = MemoryDatabase::new();
    let runner = DaemonJobRunner::new(
        job_runner(Arc::new(memory_source()), db.clone()),
        Arc::new(LogStatusSink),
        supervisor,
    );
    let daemon = Daemon::new(config, runner);

    let first = daemon.run_cycle().await.unwrap();
    assert_eq!(first.jobs_succeeded, 1);
    assert_eq!(first.jobs_failed, 1);
    assert_eq!(first.rows_processed, 4);
    assert!(!first.is_success());

    let store = CheckpointStore::load(&state_path).await.unwrap();
    assert!(store.get("missing").is_none());
    let checkpoint = store.get("incident").unwrap();
    assert_eq!(checkpoint.last_processed, 4);

    // nothing changed since the last run, so the incremental read is empty
    let second = daemon.run_cycle().await.unwrap();
    assert_eq!(second.jobs_succeeded, 1);
    assert_eq!(second.rows_processed, 0);
    assert_eq!(db.row_count("incident"), 4);
}

#[tokio::test]
async fn test_cycle_stops_scheduling_after_a_fatal_fault() {
    let dir = tempdir().unwrap();
    let config = daemon_config(
        &dir.path().join("state.json"),
        r#"
[[jobs]]
name = "boom"
source = "boom"
auto_create = true

[[jobs]]
name = "incident"
source = "incident"
auto_create = true
"#,
    );
    let (supervisor, mut faults) = Supervisor::new();
    let db = MemoryDatabase::new();
    let runner = DaemonJobRunner::new(
        job_runner(faulty_source(false), db.clone()),
        Arc::new(LogStatusSink),
        supervisor,
    );
    let daemon = Daemon::new(config, runner);

    let stats = daemon.run_cycle().await.unwrap();

    assert_eq!(stats.jobs_failed, 1);
    assert_eq!(stats.jobs_succeeded, 0);
    assert!(!db.has_table("incident"));
    assert_eq!(faults.try_recv().unwrap().job, "boom");
}

#[tokio::test]
async fn test_daemon_loop_exits_when_supervisor_trips() {
    let dir = tempdir().unwrap();
    let config = daemon_config(
        &dir.path().join("state.json"),
        r#"
[[jobs]]
name = "boom"
source = "boom"
"#,
    );
    let (supervisor, _faults) = Supervisor::new();
    let runner = DaemonJobRunner::new(
        job_runner(faulty_source(false), MemoryDatabase::new()),
        Arc::new(LogStatusSink),
        supervisor,
    );
    let daemon = Daemon::new(config, runner);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    tokio::time::timeout(Duration::from_secs(10), daemon.run(shutdown_rx))
        .await
        .expect("daemon kept running after a fatal fault")
        .unwrap();
}

#[tokio::test]
async fn test_daemon_loop_honours_shutdown() {
    let dir = tempdir().unwrap();
    let config = daemon_config(&dir.path().join("state.json"), "");
    let (supervisor, _faults) = Supervisor::new();
    let runner = DaemonJobRunner::new(
        job_runner(Arc::new(memory_source()), MemoryDatabase::new()),
        Arc::new(LogStatusSink),
        supervisor,
    );
    let daemon = Daemon::new(config, runner).with_jobs(vec![]);
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    shutdown_tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(10), daemon.run(shutdown_rx))
        .await
        .expect("daemon ignored shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_abandoned_job_stops_reading() {
    let source = Arc::new(
        MemorySource::new()
            .with_page_size(2)
            .with_latency(Duration::from_millis(100)),
    );
    for i in 0..40 {
        source.insert(record("incident", &format!("i{:02}", i)));
    }
    let db = MemoryDatabase::new();
    let (supervisor, _faults) = Supervisor::new();
    let runner = DaemonJobRunner::new(
        job_runner(source.clone(), db.clone()),
        Arc::new(LogStatusSink),
        supervisor,
    );

    // the caller gives up, as a cycle does on shutdown
    let job = runner.run(load_job("incident", "incident"));
    let outcome = tokio::time::timeout(Duration::from_millis(350), job).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = source.page_requests();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(source.page_requests(), requests);
    assert!(db.row_count("incident") < 40);
}
