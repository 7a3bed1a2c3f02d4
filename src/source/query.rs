// ABOUTME: Renders a TableQuery in the REST API's encoded query syntax
// ABOUTME: Terms are joined with '^'; ordering is appended as ORDERBY<field>

use std::fmt;

use super::TableQuery;
use crate::record::{format_source_datetime, CREATED_FIELD, KEY_FIELD, UPDATED_FIELD};

/// Encoded query string builder.
///
/// ```
/// use record_replicator::source::EncodedQuery;
/// let q = EncodedQuery::new().equals("tablename", "incident").order_by("sys_id");
/// assert_eq!(q.to_string(), "tablename=incident^ORDERBYsys_id");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedQuery {
    terms: Vec<String>,
    order_by: Option<String>,
}

impl EncodedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw encoded fragment (may itself contain `^`).
    pub fn raw(mut self, fragment: &str) -> Self {
        let fragment = fragment.trim().trim_matches('^');
        if !fragment.is_empty() {
            self.terms.push(fragment.to_string());
        }
        self
    }

    pub fn equals(mut self, field: &str, value: &str) -> Self {
        self.terms.push(format!("{}={}", field, value));
        self
    }

    pub fn greater_or_equal(mut self, field: &str, value: &str) -> Self {
        self.terms.push(format!("{}>={}", field, value));
        self
    }

    pub fn less_than(mut self, field: &str, value: &str) -> Self {
        self.terms.push(format!("{}<{}", field, value));
        self
    }

    pub fn greater_than(mut self, field: &str, value: &str) -> Self {
        self.terms.push(format!("{}>{}", field, value));
        self
    }

    pub fn in_list<'a>(mut self, field: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        let joined: Vec<&str> = values.into_iter().collect();
        self.terms.push(format!("{}IN{}", field, joined.join(",")));
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.order_by.is_none()
    }
}

impl fmt::Display for EncodedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self.terms.clone();
        if let Some(field) = &self.order_by {
            parts.push(format!("ORDERBY{}", field));
        }
        f.write_str(&parts.join("^"))
    }
}

impl From<&TableQuery> for EncodedQuery {
    fn from(query: &TableQuery) -> Self {
        let mut encoded = EncodedQuery::new();
        if let Some(filter) = &query.filter {
            encoded = encoded.raw(filter);
        }
        for (field, value) in &query.equals {
            encoded = encoded.equals(field, value);
        }
        if let Some(start) = query.created.start {
            encoded = encoded.greater_or_equal(CREATED_FIELD, &format_source_datetime(start));
        }
        if let Some(end) = query.created.end {
            encoded = encoded.less_than(CREATED_FIELD, &format_source_datetime(end));
        }
        if let Some(since) = query.updated_since {
            encoded = encoded.greater_or_equal(UPDATED_FIELD, &format_source_datetime(since));
        }
        if let Some(keys) = &query.keys {
            encoded = encoded.in_list(KEY_FIELD, keys.iter().map(|k| k.as_str()));
        }
        if let Some(after) = &query.after_key {
            encoded = encoded.greater_than(KEY_FIELD, after.as_str());
        }
        if query.order_by_key {
            encoded = encoded.order_by(KEY_FIELD);
        }
        encoded
    }
}
