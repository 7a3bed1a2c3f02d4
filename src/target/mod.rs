// ABOUTME: Target database abstraction used by writers and the dispatcher
// ABOUTME: Each worker obtains its own connection through a DatabaseConnector

pub mod postgres;
pub mod sql;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::record::{Key, Record};
use crate::source::TableSchema;

pub use postgres::{PgConnector, PgDatabase};

/// Statement-level access to the target database.
///
/// Write methods bind only the columns in `schema`; record fields outside the
/// schema are ignored.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Create `table` from `schema` unless it exists. Returns true if created.
    async fn create_missing_table(&self, schema: &TableSchema, table: &str) -> Result<bool>;

    async fn drop_table(&self, table: &str, ignore_if_absent: bool) -> Result<()>;

    async fn truncate_table(&self, table: &str) -> Result<()>;

    async fn execute_statement(&self, sql: &str) -> Result<u64>;

    async fn commit(&self) -> Result<()>;

    /// Insert a row. A duplicate key is an error.
    async fn insert_record(&self, table: &str, schema: &TableSchema, record: &Record)
        -> Result<()>;

    /// Update the row with the record's key. Returns false if no such row.
    async fn update_record(&self, table: &str, schema: &TableSchema, record: &Record)
        -> Result<bool>;

    /// Delete the row with `key`. Returns false if no such row.
    async fn delete_record(&self, table: &str, key: &Key) -> Result<bool>;
}

/// Hands out target connections; one per worker.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TargetDatabase>>;
}
