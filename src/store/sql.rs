use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

use crate::config::StoreConfig;
use crate::error::{AppError, Result};
use crate::store::{Row, StoreHandle};

/// A MySQL-backed store with a fixed set of named statements.
pub struct SqlStore {
    name: String,
    pool: MySqlPool,
    statements: HashMap<String, String>,
}

impl SqlStore {
    /// Create the pool without connecting. The first query opens a connection.
    pub fn connect_lazy(name: &str, config: &StoreConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(AppError::Config(format!("No database URL for store {name}")));
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(&config.url)
            .map_err(|e| AppError::Config(format!("Invalid database URL for store {name}: {e}")))?;

        tracing::info!(
            store = name,
            statements = config.statements.len(),
            "Store configured"
        );

        Ok(Self {
            name: name.to_string(),
            pool,
            statements: config.statements.clone(),
        })
    }

    fn statement(&self, key: &str) -> Result<&str> {
        self.statements
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| {
                AppError::Config(format!("Store {} has no statement named {key}", self.name))
            })
    }
}

#[async_trait]
impl StoreHandle for SqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_one(&self, statement: &str, params: &[String]) -> Result<Option<Row>> {
        let sql = self.statement(statement)?;
        tracing::debug!(store = %self.name, statement, params = ?params, "Executing query");

        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_str());
        }

        let row = query.fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(|r| decode_row(&self.name, r)))
    }

    async fn execute(&self, statement: &str, params: &[String]) -> Result<u64> {
        let sql = self.statement(statement)?;
        tracing::debug!(store = %self.name, statement, params = ?params, "Executing update");

        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn is_available(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(store = %self.name, error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!(store = %self.name, "Store connections closed");
    }
}

/// Decode every column to text. NULLs are left out of the row.
fn decode_row(store: &str, row: &MySqlRow) -> Row {
    let mut decoded = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        if row.try_get_raw(idx).map_or(true, |raw| raw.is_null()) {
            continue;
        }
        match decode_column(row, idx) {
            Some(value) => decoded.insert(column.name().to_string(), value),
            None => tracing::warn!(
                store,
                column = column.name(),
                sql_type = column.type_info().name(),
                "Column cannot be rendered as text, leaving it out"
            ),
        }
    }
    decoded
}

fn decode_column(row: &MySqlRow, idx: usize) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<sqlx::types::Decimal>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return value.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return value.map(|v| v.to_string());
    }
    // VARBINARY and `_bin` collations carry the BINARY flag and refuse `String`.
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return value.map(text_from_bytes);
    }
    None
}

fn text_from_bytes(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
