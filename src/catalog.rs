//! Relational store abstraction and the schema catalog built on it.
//!
//! The [`Store`] trait is the pipeline's only view of the database: it can
//! describe a table and execute a statement. [`SqliteStore`] implements it
//! over a read-only `sqlx` pool and rolls back every execution, so
//! synthesized SQL can never change the data it is asked about.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column as _, Executor, Row, ValueRef};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::db;
use crate::models::{Column, DataSourceSchema};

/// Rows returned by a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A failed execution. `message` is the store's own error text, unmodified,
/// because the repair prompt quotes it back to the oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DatabaseError {
    pub message: String,
}

impl DatabaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Abstract relational store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`describe_schema`](Store::describe_schema) | Column names and declared types of one table |
/// | [`execute`](Store::execute) | Run a statement without side effects |
/// | [`dialect`](Store::dialect) | SQL dialect name quoted in repair prompts |
#[async_trait]
pub trait Store: Send + Sync {
    /// Columns of `table_name` in `db_schema`, in declaration order.
    ///
    /// An unknown table is an error.
    async fn describe_schema(&self, table_name: &str, db_schema: &str) -> Result<Vec<Column>>;

    /// Execute `sql` in a sandbox. Nothing the statement does is kept.
    async fn execute(&self, sql: &str) -> std::result::Result<ResultSet, DatabaseError>;

    fn dialect(&self) -> &str;
}

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
    dialect: String,
}

impl SqliteStore {
    /// Wrap an existing pool. The pool should be opened read-only.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            dialect: "SQLite".to_string(),
        }
    }

    /// Open the database at `path` read-only.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_read_only(path)
            .await
            .with_context(|| format!("Failed to open store: {}", path.display()))?;
        Ok(Self::new(pool))
    }

    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = dialect.into();
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn describe_schema(&self, table_name: &str, db_schema: &str) -> Result<Vec<Column>> {
        let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1, ?2) ORDER BY cid")
            .bind(table_name)
            .bind(db_schema)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to describe {}.{}", db_schema, table_name))?;

        if rows.is_empty() {
            anyhow::bail!("table not found: {}.{}", db_schema, table_name);
        }

        Ok(rows
            .iter()
            .map(|row| Column {
                name: row.get("name"),
                declared_type: row.get("type"),
            })
            .collect())
    }

    async fn execute(&self, sql: &str) -> std::result::Result<ResultSet, DatabaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::new(e.to_string()))?;

        let fetched = sqlx::query(sql).fetch_all(&mut *tx).await;

        // Without a row to read names from, ask the prepared statement.
        let described: Option<Vec<String>> = match &fetched {
            Ok(rows) if rows.is_empty() => (&mut *tx)
                .describe(sql)
                .await
                .ok()
                .map(|d| d.columns().iter().map(|c| c.name().to_string()).collect()),
            _ => None,
        };

        // Roll back regardless of outcome so the connection returns clean.
        if let Err(e) = tx.rollback().await {
            debug!(error = %e, "rollback after execution failed");
        }

        let rows = fetched.map_err(|e| match e {
            sqlx::Error::Database(db_err) => DatabaseError::new(db_err.message()),
            other => DatabaseError::new(other.to_string()),
        })?;

        let columns = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => described.unwrap_or_default(),
        };

        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| decode_cell(row, i)).collect())
            .collect();

        Ok(ResultSet { columns, rows })
    }

    fn dialect(&self) -> &str {
        &self.dialect
    }
}

/// Decode one cell by trying SQLite's storage classes in turn.
fn decode_cell(row: &SqliteRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }

    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return Value::String(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
        return Value::String(format!("<{} bytes>", v.len()));
    }
    Value::Null
}

/// Describes the tables named by a request.
pub struct SchemaCatalog {
    store: Arc<dyn Store>,
    db_schema: String,
}

impl SchemaCatalog {
    pub fn new(store: Arc<dyn Store>, db_schema: impl Into<String>) -> Self {
        Self {
            store,
            db_schema: db_schema.into(),
        }
    }

    /// Snapshot every table in `tables`, in the given order.
    pub async fn load(&self, tables: &[String]) -> Result<Vec<DataSourceSchema>> {
        let mut schemas = Vec::with_capacity(tables.len());
        for table in tables {
            let columns = self.store.describe_schema(table, &self.db_schema).await?;
            debug!(table = %table, columns = columns.len(), "described data source");
            schemas.push(DataSourceSchema {
                table_name: table.clone(),
                db_schema: self.db_schema.clone(),
                columns,
            });
        }
        Ok(schemas)
    }
}
