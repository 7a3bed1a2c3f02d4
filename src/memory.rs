// ABOUTME: In-memory RecordSource and TargetDatabase backends
// ABOUTME: Used by the test suites, with counters and failure hooks for assertions

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::record::{Key, KeySet, Record, KEY_FIELD};
use crate::source::{
    FieldDef, FieldKind, PageWindow, RecordSource, TableQuery, TableSchema,
};
use crate::target::{DatabaseConnector, TargetDatabase};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Evaluate a simple `field=value^field!=value` filter against a record.
///
/// Unsupported terms never match, so a typo shows up as zero rows.
fn filter_matches(filter: &str, record: &Record) -> bool {
    filter
        .split('^')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((field, value)) = term.split_once("!=") {
                record.get_str(field).as_deref() != Some(value)
            } else if let Some((field, value)) = term.split_once('=') {
                record.get_str(field).as_deref() == Some(value)
            } else {
                false
            }
        })
}

fn query_matches(query: &TableQuery, record: &Record) -> bool {
    if let Some(filter) = &query.filter {
        if !filter_matches(filter, record) {
            return false;
        }
    }
    if !query
        .equals
        .iter()
        .all(|(field, value)| record.get_str(field).as_deref() == Some(value.as_str()))
    {
        return false;
    }
    if !query.created.is_unbounded() {
        match record.created() {
            Some(created) if query.created.contains(created) => {}
            _ => return false,
        }
    }
    if let Some(since) = query.updated_since {
        match record.updated() {
            Some(updated) if updated >= since => {}
            _ => return false,
        }
    }
    if let Some(keys) = &query.keys {
        if !keys.contains(record.key()) {
            return false;
        }
    }
    if let Some(after) = &query.after_key {
        if record.key() <= after {
            return false;
        }
    }
    true
}

/// Source tables held in memory, in insertion order.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, Vec<Record>>>,
    schemas: Mutex<HashMap<String, TableSchema>>,
    page_size: u64,
    latency: Option<Duration>,
    failing_tables: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    page_requests: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            page_size: 100,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Delay every page fetch, so that concurrent readers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, record: Record) {
        lock(&self.tables)
            .entry(record.table().to_string())
            .or_default()
            .push(record);
    }

    pub fn set_schema(&self, schema: TableSchema) {
        lock(&self.schemas).insert(schema.table().to_string(), schema);
    }

    /// Make every page fetch from `table` fail.
    pub fn fail_table(&self, table: &str) {
        lock(&self.failing_tables).insert(table.to_string());
    }

    /// Number of `fetch_page` calls so far.
    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    /// Highest number of page fetches that were in progress at once.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn matching(&self, table: &str, query: &TableQuery) -> Vec<Record> {
        let tables = lock(&self.tables);
        let mut rows: Vec<Record> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query_matches(query, r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if query.order_by_key {
            rows.sort_by(|a, b| a.key().cmp(b.key()));
        }
        rows
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn default_page_size(&self) -> u64 {
        self.page_size
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        if let Some(schema) = lock(&self.schemas).get(table) {
            return Ok(schema.clone());
        }
        let tables = lock(&self.tables);
        let Some(rows) = tables.get(table) else {
            bail!("Table {} not found in the source dictionary", table);
        };
        let mut fields: Vec<FieldDef> = Vec::new();
        for record in rows {
            for name in record.fields().keys() {
                if name != KEY_FIELD && !fields.iter().any(|f| &f.name == name) {
                    fields.push(FieldDef::new(name, FieldKind::String));
                }
            }
        }
        Ok(TableSchema::new(table, fields))
    }

    async fn count(&self, table: &str, query: &TableQuery) -> Result<u64> {
        Ok(self.matching(table, query).len() as u64)
    }

    async fn fetch_page(
        &self,
        table: &str,
        query: &TableQuery,
        fields: &[String],
        window: PageWindow,
    ) -> Result<Vec<Record>> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if lock(&self.failing_tables).contains(table) {
            bail!("Source API returned error 500 Internal Server Error for {}", table);
        }

        Ok(self
            .matching(table, query)
            .into_iter()
            .skip(window.offset as usize)
            .take(window.limit as usize)
            .map(|r| r.project(fields))
            .collect())
    }

    async fn fetch_keys(&self, table: &str, query: &TableQuery) -> Result<KeySet> {
        Ok(self
            .matching(table, query)
            .into_iter()
            .map(|r| r.key().clone())
            .collect())
    }

    async fn earliest_created(
        &self,
        table: &str,
        query: &TableQuery,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .matching(table, query)
            .iter()
            .filter_map(Record::created)
            .min())
    }
}

type Rows = BTreeMap<Key, Map<String, Value>>;

/// Target tables held in memory, keyed by record key.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<HashMap<String, Rows>>,
    statements: Mutex<Vec<String>>,
    failing_keys: Mutex<HashSet<Key>>,
    commits: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an empty table, as if by DDL outside the replicator.
    pub fn create_table(&self, table: &str) {
        lock(&self.tables).entry(table.to_string()).or_default();
    }

    /// Seed a row, creating the table if needed.
    pub fn seed(&self, table: &str, record: &Record) {
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .insert(record.key().clone(), record.fields().clone());
    }

    /// Make any write of `key` fail.
    pub fn fail_on_key(&self, key: &str) {
        lock(&self.failing_keys).insert(Key::from(key));
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock(&self.tables).contains_key(table)
    }

    pub fn keys(&self, table: &str) -> KeySet {
        lock(&self.tables)
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: &str) -> Option<Map<String, Value>> {
        lock(&self.tables)
            .get(table)
            .and_then(|rows| rows.get(&Key::from(key)).cloned())
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map_or(0, BTreeMap::len)
    }

    /// Statements passed to `execute_statement`, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn check_key(&self, key: &Key) -> Result<()> {
        if lock(&self.failing_keys).contains(key) {
            bail!("Injected write failure for {}", key);
        }
        Ok(())
    }

    fn row_values(schema: &TableSchema, record: &Record) -> Map<String, Value> {
        schema
            .fields()
            .iter()
            .map(|f| {
                let value = record.sql_value(&f.name).map_or(Value::Null, Value::String);
                (f.name.clone(), value)
            })
            .collect()
    }
}

#[async_trait]
impl TargetDatabase for MemoryDatabase {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.has_table(table))
    }

    async fn create_missing_table(&self, _schema: &TableSchema, table: &str) -> Result<bool> {
        let mut tables = lock(&self.tables);
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_string(), Rows::new());
        Ok(true)
    }

    async fn drop_table(&self, table: &str, ignore_if_absent: bool) -> Result<()> {
        if lock(&self.tables).remove(table).is_none() && !ignore_if_absent {
            bail!("Table {} does not exist", table);
        }
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        match lock(&self.tables).get_mut(table) {
            Some(rows) => {
                rows.clear();
                Ok(())
            }
            None => bail!("Table {} does not exist", table),
        }
    }

    async fn execute_statement(&self, sql: &str) -> Result<u64> {
        lock(&self.statements).push(sql.to_string());
        Ok(0)
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_record(
        &self,
        table: &str,
        schema: &TableSchema,
        record: &Record,
    ) -> Result<()> {
        self.check_key(record.key())?;
        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(table) else {
            bail!("Table {} does not exist", table);
        };
        if rows.contains_key(record.key()) {
            bail!("Duplicate key {} in {}", record.key(), table);
        }
        rows.insert(record.key().clone(), Self::row_values(schema, record));
        Ok(())
    }

    async fn update_record(
        &self,
        table: &str,
        schema: &TableSchema,
        record: &Record,
    ) -> Result<bool> {
        self.check_key(record.key())?;
        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(table) else {
            bail!("Table {} does not exist", table);
        };
        match rows.get_mut(record.key()) {
            Some(row) => {
                row.extend(Self::row_values(schema, record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_record(&self, table: &str, key: &Key) -> Result<bool> {
        self.check_key(key)?;
        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(table) else {
            bail!("Table {} does not exist", table);
        };
        Ok(rows.remove(key).is_some())
    }
}

/// Hands out the same [`MemoryDatabase`] to every worker.
#[derive(Clone)]
pub struct MemoryConnector {
    database: Arc<MemoryDatabase>,
    connections: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self {
            database,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    /// Number of `connect` calls so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn TargetDatabase>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.database.clone())
    }
}
