// ABOUTME: Source API abstraction - paginated, key-only and audit-feed queries
// ABOUTME: The core sees only this trait; transports live in rest.rs and memory.rs

pub mod query;
pub mod rest;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::record::{DateTimeRange, Key, KeySet, Record};

pub use query::EncodedQuery;
pub use rest::{RestSource, RestSourceConfig};
pub use schema::{FieldDef, FieldKind, TableSchema};

/// Source table holding one row per deleted record.
pub const AUDIT_DELETE_TABLE: &str = "sys_audit_delete";
/// Audit field naming the table a deleted record belonged to.
pub const AUDIT_TABLE_FIELD: &str = "tablename";
/// Audit field holding the key of the deleted record.
pub const AUDIT_KEY_FIELD: &str = "documentkey";

/// Structured description of which rows to fetch.
///
/// Sources translate this into their own query language; see
/// [`EncodedQuery`] for the REST rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    /// Opaque row filter in the source's own syntax.
    pub filter: Option<String>,
    /// `field = value` terms, all of which must hold.
    pub equals: Vec<(String, String)>,
    /// Restrict `sys_created_on` to this half-open range.
    pub created: DateTimeRange,
    /// Only rows with `sys_updated_on >= updated_since`.
    pub updated_since: Option<DateTime<Utc>>,
    /// Only these keys.
    pub keys: Option<KeySet>,
    /// Only keys strictly greater than this one (keyset pagination).
    pub after_key: Option<Key>,
    /// Return rows ordered by key.
    pub order_by_key: bool,
}

impl TableQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn with_equals(mut self, field: &str, value: &str) -> Self {
        self.equals.push((field.to_string(), value.to_string()));
        self
    }

    pub fn with_created(mut self, created: DateTimeRange) -> Self {
        self.created = created;
        self
    }

    pub fn with_updated_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.updated_since = since;
        self
    }

    pub fn with_keys(mut self, keys: KeySet) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn ordered_by_key(mut self, order: bool) -> Self {
        self.order_by_key = order;
        self
    }
}

/// Which slice of the result set a page fetch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: u64,
    pub limit: u64,
}

/// Read access to a remote table API.
///
/// Every call may block on network I/O. Errors are returned as-is; the core
/// does not retry.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Page size used when a job does not set one.
    fn default_page_size(&self) -> u64;

    /// Field definitions for a table, including inherited fields.
    async fn table_schema(&self, table: &str) -> Result<TableSchema>;

    /// Number of rows matching `query`.
    async fn count(&self, table: &str, query: &TableQuery) -> Result<u64>;

    /// One page of full records. `fields` empty means all fields.
    async fn fetch_page(
        &self,
        table: &str,
        query: &TableQuery,
        fields: &[String],
        window: PageWindow,
    ) -> Result<Vec<Record>>;

    /// Keys of every row matching `query`.
    async fn fetch_keys(&self, table: &str, query: &TableQuery) -> Result<KeySet>;

    /// Earliest `sys_created_on` among rows matching `query`, if any.
    async fn earliest_created(&self, table: &str, query: &TableQuery)
        -> Result<Option<DateTime<Utc>>>;
}
