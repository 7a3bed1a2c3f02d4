// ABOUTME: RecordSource over the REST Table API (table, stats and dictionary endpoints)
// ABOUTME: Handles basic auth, paging parameters and error reporting; never retries

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::query::EncodedQuery;
use super::schema::{FieldDef, FieldKind, TableSchema};
use super::{PageWindow, RecordSource, TableQuery};
use crate::record::{parse_source_datetime, Key, KeySet, Record, CREATED_FIELD, KEY_FIELD};

/// Page size used when neither the job nor the source config sets one.
pub const DEFAULT_PAGE_SIZE: u64 = 200;

/// Rows per request when fetching key lists.
const KEY_BATCH_SIZE: u64 = 10_000;

/// Guard against cycles in the table hierarchy.
const MAX_HIERARCHY_DEPTH: usize = 16;

#[derive(Debug, Clone, Deserialize)]
pub struct RestSourceConfig {
    /// Instance base URL, e.g. `https://example.service-now.com`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Page size when a job does not set one
    pub page_size: Option<u64>,
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct StatsResult {
    stats: Stats,
}

#[derive(Debug, Deserialize)]
struct Stats {
    count: Value,
}

#[derive(Debug, Deserialize)]
struct DictionaryEntry {
    element: String,
    internal_type: Value,
    #[serde(default)]
    max_length: Value,
}

#[derive(Debug, Deserialize)]
struct TableObject {
    name: String,
    #[serde(default)]
    super_class: Value,
}

pub struct RestSource {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    page_size: u64,
}

impl RestSource {
    pub fn new(config: &RestSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        })
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(params);
        if let Some(ref user) = self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        tracing::debug!("GET {} {:?}", path, params);
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            bail!(
                "Source API rejected the credentials for {}.\n\
                 Check the source username and password in the configuration.",
                self.base_url
            );
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Source API returned error {} for {}: {}", status, path, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }

    async fn get_rows(&self, table: &str, params: &[(&str, String)]) -> Result<Vec<Value>> {
        let path = format!("/api/now/table/{}", table);
        let body = self.get_json(&path, params).await?;
        let envelope: ResultEnvelope<Vec<Value>> = serde_json::from_value(body)
            .with_context(|| format!("Unexpected response shape from {}", path))?;
        Ok(envelope.result)
    }

    /// Names of `table` and all of its ancestors, child first.
    async fn table_hierarchy(&self, table: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut query = EncodedQuery::new().equals("name", table);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let rows = self
                .get_rows(
                    "sys_db_object",
                    &[
                        ("sysparm_query", query.to_string()),
                        ("sysparm_fields", "name,super_class".to_string()),
                        ("sysparm_exclude_reference_link", "true".to_string()),
                        ("sysparm_limit", "1".to_string()),
                    ],
                )
                .await?;
            let Some(row) = rows.into_iter().next() else {
                break;
            };
            let object: TableObject = serde_json::from_value(row)
                .context("Unexpected sys_db_object row shape")?;
            names.push(object.name);
            match text(&object.super_class) {
                Some(parent) if !parent.is_empty() => {
                    query = EncodedQuery::new().equals(KEY_FIELD, &parent);
                }
                _ => break,
            }
        }
        if names.is_empty() {
            names.push(table.to_string());
        }
        Ok(names)
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("value").and_then(text),
        _ => None,
    }
}

fn window_params(window: PageWindow) -> [(&'static str, String); 2] {
    [
        ("sysparm_limit", window.limit.to_string()),
        ("sysparm_offset", window.offset.to_string()),
    ]
}

#[async_trait]
impl RecordSource for RestSource {
    fn default_page_size(&self) -> u64 {
        self.page_size
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let tables = self.table_hierarchy(table).await?;
        let query = EncodedQuery::new()
            .in_list("name", tables.iter().map(String::as_str))
            .raw("internal_type!=collection^elementISNOTEMPTY");
        let rows = self
            .get_rows(
                "sys_dictionary",
                &[
                    ("sysparm_query", query.to_string()),
                    ("sysparm_fields", "element,internal_type,max_length".to_string()),
                    ("sysparm_exclude_reference_link", "true".to_string()),
                ],
            )
            .await
            .with_context(|| format!("Failed to read dictionary for {}", table))?;

        if rows.is_empty() {
            bail!("Table {} not found in the source dictionary", table);
        }

        let mut fields = Vec::with_capacity(rows.len());
        for row in rows {
            let entry: DictionaryEntry =
                serde_json::from_value(row).context("Unexpected sys_dictionary row shape")?;
            let internal_type = text(&entry.internal_type).unwrap_or_default();
            let max_length = text(&entry.max_length).and_then(|s| s.parse::<u32>().ok());
            fields.push(
                FieldDef::new(&entry.element, FieldKind::from_internal_type(&internal_type))
                    .with_max_length(max_length),
            );
        }
        Ok(TableSchema::new(table, fields))
    }

    async fn count(&self, table: &str, query: &TableQuery) -> Result<u64> {
        let path = format!("/api/now/stats/{}", table);
        let encoded = EncodedQuery::from(query);
        let body = self
            .get_json(
                &path,
                &[
                    ("sysparm_count", "true".to_string()),
                    ("sysparm_query", encoded.to_string()),
                ],
            )
            .await?;
        let envelope: ResultEnvelope<StatsResult> = serde_json::from_value(body)
            .with_context(|| format!("Unexpected stats response for {}", table))?;
        text(&envelope.result.stats.count)
            .and_then(|s| s.parse::<u64>().ok())
            .with_context(|| format!("Stats response for {} has no numeric count", table))
    }

    async fn fetch_page(
        &self,
        table: &str,
        query: &TableQuery,
        fields: &[String],
        window: PageWindow,
    ) -> Result<Vec<Record>> {
        let encoded = EncodedQuery::from(query);
        let mut params = vec![
            ("sysparm_query", encoded.to_string()),
            ("sysparm_exclude_reference_link", "true".to_string()),
            ("sysparm_display_value", "false".to_string()),
        ];
        if !fields.is_empty() {
            params.push(("sysparm_fields", fields.join(",")));
        }
        params.extend(window_params(window));

        let rows = self
            .get_rows(table, &params)
            .await
            .with_context(|| format!("Failed to fetch page of {} at offset {}", table, window.offset))?;
        rows.into_iter()
            .map(|row| Record::from_json(table, row))
            .collect()
    }

    async fn fetch_keys(&self, table: &str, query: &TableQuery) -> Result<KeySet> {
        let mut keys = KeySet::new();
        let mut query = query.clone().ordered_by_key(true);
        loop {
            let encoded = EncodedQuery::from(&query);
            let mut params = vec![
                ("sysparm_query", encoded.to_string()),
                ("sysparm_fields", KEY_FIELD.to_string()),
            ];
            params.extend(window_params(PageWindow {
                offset: 0,
                limit: KEY_BATCH_SIZE,
            }));
            let rows = self
                .get_rows(table, &params)
                .await
                .with_context(|| format!("Failed to fetch keys of {}", table))?;
            let fetched = rows.len() as u64;
            let mut last = None;
            for row in rows {
                if let Some(key) = row.get(KEY_FIELD).and_then(text) {
                    let key = Key::new(key);
                    last = Some(key.clone());
                    keys.insert(key);
                }
            }
            match last {
                Some(last) if fetched == KEY_BATCH_SIZE => query.after_key = Some(last),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn earliest_created(
        &self,
        table: &str,
        query: &TableQuery,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = query.clone().ordered_by_key(false);
        let encoded = EncodedQuery::from(&query).order_by(CREATED_FIELD);
        let rows = self
            .get_rows(
                table,
                &[
                    ("sysparm_query", encoded.to_string()),
                    ("sysparm_fields", CREATED_FIELD.to_string()),
                    ("sysparm_limit", "1".to_string()),
                ],
            )
            .await?;
        match rows.first().and_then(|row| row.get(CREATED_FIELD)).and_then(text) {
            Some(value) if !value.is_empty() => Ok(Some(parse_source_datetime(&value)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_creation_trims_trailing_slash() {
        let source = RestSource::new(&RestSourceConfig {
            url: "https://example.service-now.com/".to_string(),
            username: Some("svc".to_string()),
            password: None,
            timeout_secs: 5,
            page_size: None,
        })
        .unwrap();
        assert_eq!(source.base_url, "https://example.service-now.com");
        assert_eq!(source.default_page_size(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_text_reads_reference_objects() {
        let value = serde_json::json!({"link": "x", "value": "abc"});
        assert_eq!(text(&value).as_deref(), Some("abc"));
        assert_eq!(text(&serde_json::json!(12)).as_deref(), Some("12"));
        assert_eq!(text(&Value::Null), None);
    }
}
