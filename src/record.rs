// ABOUTME: Record, key and date-range types flowing from readers to writers
// ABOUTME: Values stay loosely typed JSON until a writer binds them as SQL text

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Unique record identifier field.
pub const KEY_FIELD: &str = "sys_id";
/// Creation timestamp field, the partitioning dimension.
pub const CREATED_FIELD: &str = "sys_created_on";
/// Last-update timestamp field, used for incremental reads.
pub const UPDATED_FIELD: &str = "sys_updated_on";

const SOURCE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Opaque unique identifier of a source record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(value: impl Into<String>) -> Self {
        Key(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for a 32 character lowercase hex GUID.
    pub fn is_guid(&self) -> bool {
        self.0.len() == 32
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key(value.to_string())
    }
}

/// Deduplicated set of keys.
///
/// Iteration order is sorted so batches of keys are stable between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet(BTreeSet<Key>);

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Key) -> bool {
        self.0.insert(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    /// Split into consecutive batches of at most `size` keys.
    pub fn chunks(&self, size: usize) -> Vec<KeySet> {
        let size = size.max(1);
        let keys: Vec<&Key> = self.0.iter().collect();
        keys.chunks(size)
            .map(|chunk| chunk.iter().map(|k| (*k).clone()).collect())
            .collect()
    }
}

impl FromIterator<Key> for KeySet {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        KeySet(iter.into_iter().collect())
    }
}

impl IntoIterator for KeySet {
    type Item = Key;
    type IntoIter = std::collections::btree_set::IntoIter<Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One source record: owning table, key, and field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    key: Key,
    fields: Map<String, Value>,
}

impl Record {
    /// Build a record from a JSON object. The key is taken from `sys_id`.
    pub fn from_json(table: &str, value: Value) -> Result<Self> {
        let fields = match value {
            Value::Object(map) => map,
            other => bail!("Expected a JSON object for a {} record, got {}", table, other),
        };
        let key = fields
            .get(KEY_FIELD)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(Key::new)
            .with_context(|| format!("Record from {} has no {}", table, KEY_FIELD))?;
        Ok(Self {
            table: table.to_string(),
            key,
            fields,
        })
    }

    pub fn new(table: &str, key: Key, mut fields: Map<String, Value>) -> Self {
        fields.insert(KEY_FIELD.to_string(), Value::String(key.to_string()));
        Self {
            table: table.to_string(),
            key,
            fields,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value rendered as a string; reference objects yield their `value`.
    pub fn get_str(&self, field: &str) -> Option<String> {
        value_to_text(self.fields.get(field)?)
    }

    /// Field value as SQL text. Empty strings and JSON nulls become `None`.
    pub fn sql_value(&self, field: &str) -> Option<String> {
        self.get_str(field).filter(|s| !s.is_empty())
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.get_str(CREATED_FIELD)
            .and_then(|s| parse_source_datetime(&s).ok())
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.get_str(UPDATED_FIELD)
            .and_then(|s| parse_source_datetime(&s).ok())
    }

    /// Copy of the record keeping only `fields` (the key is always kept).
    pub fn project(&self, fields: &[String]) -> Record {
        if fields.is_empty() {
            return self.clone();
        }
        let mut projected = Map::new();
        for (name, value) in &self.fields {
            if name == KEY_FIELD || fields.iter().any(|f| f == name) {
                projected.insert(name.clone(), value.clone());
            }
        }
        Record {
            table: self.table.clone(),
            key: self.key.clone(),
            fields: projected,
        }
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("value").and_then(value_to_text),
        Value::Array(_) => Some(value.to_string()),
    }
}

/// An ordered batch of records produced by one reader fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    records: Vec<Record>,
}

impl RecordPage {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn last_key(&self) -> Option<&Key> {
        self.records.last().map(Record::key)
    }

    pub fn keys(&self) -> KeySet {
        self.records.iter().map(|r| r.key().clone()).collect()
    }
}

impl IntoIterator for RecordPage {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Half-open `[start, end)` range of timestamps; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateTimeRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: Option<DateTime<Utc>>) -> Self {
        Self { start, end: None }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t < e)
    }

    /// Narrow this range to its overlap with `other`.
    pub fn intersect(&self, other: &DateTimeRange) -> DateTimeRange {
        let start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        DateTimeRange { start, end }
    }
}

impl fmt::Display for DateTimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |t: Option<DateTime<Utc>>| {
            t.map(format_source_datetime)
                .unwrap_or_else(|| "*".to_string())
        };
        write!(f, "[{}, {})", show(self.start), show(self.end))
    }
}

/// Format a timestamp the way the source API renders `sys_*_on` fields.
pub fn format_source_datetime(t: DateTime<Utc>) -> String {
    t.format(SOURCE_DATETIME_FORMAT).to_string()
}

/// Parse `YYYY-MM-DD HH:MM:SS`, RFC 3339, or a bare `YYYY-MM-DD` date (UTC midnight).
pub fn parse_source_datetime(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, SOURCE_DATETIME_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    bail!("Unrecognized date/time '{}'", text)
}
