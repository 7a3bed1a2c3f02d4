// ABOUTME: PostgreSQL implementation of TargetDatabase on tokio-postgres
// ABOUTME: Runs in autocommit mode; each statement is its own transaction

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::sql::{
    build_create_table, build_delete, build_drop_table, build_exists, build_insert,
    build_truncate, build_update,
};
use super::{DatabaseConnector, TargetDatabase};
use crate::record::{Key, Record, KEY_FIELD};
use crate::source::TableSchema;
use crate::utils::sanitize_url;

/// Open a client connection and drive it on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(tls);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Target connection error: {}", e);
        }
    });

    Ok(client)
}

pub struct PgDatabase {
    client: Client,
    schema: String,
}

impl PgDatabase {
    pub fn new(client: Client, schema: &str) -> Self {
        Self {
            client,
            schema: schema.to_string(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn params<'a>(values: &'a [Option<String>]) -> Vec<&'a (dyn ToSql + Sync)> {
        values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }
}

#[async_trait]
impl TargetDatabase for PgDatabase {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let query = "SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )";

        let row = self
            .client
            .query_one(query, &[&self.schema, &table])
            .await
            .with_context(|| format!("Failed to check if {}.{} exists", self.schema, table))?;

        Ok(row.get(0))
    }

    async fn create_missing_table(&self, schema: &TableSchema, table: &str) -> Result<bool> {
        if self.table_exists(table).await? {
            return Ok(false);
        }
        let ddl = build_create_table(&self.schema, table, schema);
        tracing::info!("Creating table {}.{}", self.schema, table);
        tracing::debug!("{}", ddl);
        self.client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to create table {}.{}", self.schema, table))?;
        Ok(true)
    }

    async fn drop_table(&self, table: &str, ignore_if_absent: bool) -> Result<()> {
        tracing::info!("Dropping table {}.{}", self.schema, table);
        self.client
            .batch_execute(&build_drop_table(&self.schema, table, ignore_if_absent))
            .await
            .with_context(|| format!("Failed to drop table {}.{}", self.schema, table))?;
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        tracing::info!("Truncating table {}.{}", self.schema, table);
        self.client
            .batch_execute(&build_truncate(&self.schema, table))
            .await
            .with_context(|| format!("Failed to truncate table {}.{}", self.schema, table))?;
        Ok(())
    }

    async fn execute_statement(&self, sql: &str) -> Result<u64> {
        tracing::info!("Executing statement: {}", sql);
        self.client
            .execute(sql, &[])
            .await
            .with_context(|| format!("Failed to execute statement: {}", sql))
    }

    async fn commit(&self) -> Result<()> {
        // autocommit: nothing pending
        Ok(())
    }

    async fn insert_record(
        &self,
        table: &str,
        schema: &TableSchema,
        record: &Record,
    ) -> Result<()> {
        let sql = build_insert(&self.schema, table, schema);
        let values: Vec<Option<String>> = schema
            .fields()
            .iter()
            .map(|f| record.sql_value(&f.name))
            .collect();
        self.client
            .execute(&sql, &Self::params(&values))
            .await
            .with_context(|| {
                format!("Failed to insert {} into {}.{}", record.key(), self.schema, table)
            })?;
        Ok(())
    }

    async fn update_record(
        &self,
        table: &str,
        schema: &TableSchema,
        record: &Record,
    ) -> Result<bool> {
        let key = Some(record.key().to_string());
        let Some(sql) = build_update(&self.schema, table, schema) else {
            let rows = self
                .client
                .query(&build_exists(&self.schema, table), &[&key])
                .await
                .with_context(|| format!("Failed to look up {} in {}", record.key(), table))?;
            return Ok(!rows.is_empty());
        };
        let mut values: Vec<Option<String>> = schema
            .fields()
            .iter()
            .filter(|f| f.name != KEY_FIELD)
            .map(|f| record.sql_value(&f.name))
            .collect();
        values.push(key);
        let affected = self
            .client
            .execute(&sql, &Self::params(&values))
            .await
            .with_context(|| {
                format!("Failed to update {} in {}.{}", record.key(), self.schema, table)
            })?;
        Ok(affected > 0)
    }

    async fn delete_record(&self, table: &str, key: &Key) -> Result<bool> {
        let key = key.to_string();
        let affected = self
            .client
            .execute(&build_delete(&self.schema, table), &[&key])
            .await
            .with_context(|| format!("Failed to delete {} from {}.{}", key, self.schema, table))?;
        Ok(affected > 0)
    }
}

/// Connects a fresh [`PgDatabase`] per call.
#[derive(Debug, Clone)]
pub struct PgConnector {
    url: String,
    schema: String,
}

impl PgConnector {
    pub fn new(url: &str, schema: &str) -> Result<Self> {
        if url.trim().is_empty() {
            bail!("Target database URL is empty");
        }
        Ok(Self {
            url: url.to_string(),
            schema: schema.to_string(),
        })
    }
}

#[async_trait]
impl DatabaseConnector for PgConnector {
    async fn connect(&self) -> Result<Arc<dyn TargetDatabase>> {
        let client = connect(&self.url).await?;
        Ok(Arc::new(PgDatabase::new(client, &self.schema)))
    }
}
