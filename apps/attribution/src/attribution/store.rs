use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::Row;

use crate::attribution::types::AttributionRecord;
use crate::db::{AttributionDb, DbError};

pub const DEFAULT_TABLE_NAME: &str = "deferred_deep_links";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributionStoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait AttributionStore: Send + Sync {
    fn driver_name(&self) -> &'static str;

    /// Inserts the record or replaces every column of the existing record for
    /// the same device key, as one atomic statement.
    async fn record_visit(&self, record: AttributionRecord) -> Result<(), AttributionStoreError>;

    async fn resolve_visit(
        &self,
        device_key: &str,
    ) -> Result<Option<AttributionRecord>, AttributionStoreError>;

    async fn ping(&self) -> Result<(), AttributionStoreError>;
}

/// Validated, optionally schema-qualified table name. Table names cannot be
/// bound as statement parameters, so they are checked and quoted instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let mut parts = raw.split('.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(format!("too many qualifiers in table name {raw:?}"));
        }
        let (schema, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };
        if let Some(schema) = schema {
            validate_identifier(schema)?;
        }
        validate_identifier(name)?;
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self {
            schema: None,
            name: DEFAULT_TABLE_NAME.to_string(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

fn validate_identifier(value: &str) -> Result<(), String> {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err("identifier cannot be empty".to_string());
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(format!("identifier {value:?} must start with a letter or underscore"));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "identifier {value:?} may only contain ASCII letters, digits and underscores"
        ));
    }
    if value.len() > 63 {
        return Err(format!("identifier {value:?} exceeds 63 bytes"));
    }
    Ok(())
}

pub fn memory() -> Arc<dyn AttributionStore> {
    Arc::new(MemoryAttributionStore::default())
}

/// Connects the postgres backend and makes sure the backing table exists.
pub async fn postgres(
    db: AttributionDb,
    table: &TableName,
) -> Result<Arc<dyn AttributionStore>, AttributionStoreError> {
    let store = PostgresAttributionStore::new(db, table);
    store.ensure_schema().await?;
    Ok(Arc::new(store))
}

/// Process-local backend. The map lock plays the role of the engine's row
/// atomicity: each upsert and lookup is a single critical section.
#[derive(Default)]
pub struct MemoryAttributionStore {
    records: Mutex<HashMap<String, AttributionRecord>>,
}

#[cfg(test)]
impl MemoryAttributionStore {
    pub(crate) async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl AttributionStore for MemoryAttributionStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    async fn record_visit(&self, record: AttributionRecord) -> Result<(), AttributionStoreError> {
        let mut records = self.records.lock().await;
        records.insert(record.device_key.clone(), record);
        Ok(())
    }

    async fn resolve_visit(
        &self,
        device_key: &str,
    ) -> Result<Option<AttributionRecord>, AttributionStoreError> {
        let records = self.records.lock().await;
        Ok(records.get(device_key).cloned())
    }

    async fn ping(&self) -> Result<(), AttributionStoreError> {
        Ok(())
    }
}

struct PostgresAttributionStore {
    db: AttributionDb,
    statements: Statements,
}

/// SQL text built once from the validated table name. Values are always
/// bound as parameters.
#[derive(Debug, Clone)]
struct Statements {
    create_schema: Option<String>,
    create_table: String,
    upsert: String,
    select_by_key: String,
}

impl Statements {
    fn for_table(table: &TableName) -> Self {
        let quoted = table.quoted();
        Self {
            create_schema: table
                .schema()
                .map(|schema| format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\"")),
            create_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {quoted} (
                  device_key TEXT PRIMARY KEY,
                  variant TEXT NOT NULL,
                  target TEXT NULL,
                  device_type TEXT NULL,
                  updated_at TIMESTAMPTZ NOT NULL
                )
                "#
            ),
            upsert: format!(
                r#"
                INSERT INTO {quoted} (device_key, variant, target, device_type, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (device_key) DO UPDATE
                   SET variant = EXCLUDED.variant,
                       target = EXCLUDED.target,
                       device_type = EXCLUDED.device_type,
                       updated_at = EXCLUDED.updated_at
                "#
            ),
            select_by_key: format!(
                r#"
                SELECT device_key,
                       variant,
                       target,
                       device_type,
                       updated_at
                  FROM {quoted}
                 WHERE device_key = $1
                "#
            ),
        }
    }
}

impl PostgresAttributionStore {
    fn new(db: AttributionDb, table: &TableName) -> Self {
        Self {
            db,
            statements: Statements::for_table(table),
        }
    }

    async fn ensure_schema(&self) -> Result<(), AttributionStoreError> {
        let client = self.db.acquire().await.map_err(map_db_error)?;
        if let Some(create_schema) = &self.statements.create_schema {
            client
                .batch_execute(create_schema.as_str())
                .await
                .map_err(map_pg_error)?;
        }
        client
            .batch_execute(self.statements.create_table.as_str())
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }
}

#[async_trait]
impl AttributionStore for PostgresAttributionStore {
    fn driver_name(&self) -> &'static str {
        "postgres"
    }

    async fn record_visit(&self, record: AttributionRecord) -> Result<(), AttributionStoreError> {
        let client = self.db.acquire().await.map_err(map_db_error)?;
        client
            .execute(
                self.statements.upsert.as_str(),
                &[
                    &record.device_key,
                    &record.variant,
                    &record.target,
                    &record.device_type,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn resolve_visit(
        &self,
        device_key: &str,
    ) -> Result<Option<AttributionRecord>, AttributionStoreError> {
        let client = self.db.acquire().await.map_err(map_db_error)?;
        let row = client
            .query_opt(self.statements.select_by_key.as_str(), &[&device_key])
            .await
            .map_err(map_pg_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(
            map_record_row(&row).map_err(AttributionStoreError::Storage)?,
        ))
    }

    async fn ping(&self) -> Result<(), AttributionStoreError> {
        let client = self.db.acquire().await.map_err(map_db_error)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }
}

fn map_record_row(row: &Row) -> Result<AttributionRecord, String> {
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|error| format!("decode updated_at: {error}"))?;
    Ok(AttributionRecord {
        device_key: row
            .try_get("device_key")
            .map_err(|error| format!("decode device_key: {error}"))?,
        variant: row
            .try_get("variant")
            .map_err(|error| format!("decode variant: {error}"))?,
        target: row
            .try_get("target")
            .map_err(|error| format!("decode target: {error}"))?,
        device_type: row
            .try_get("device_type")
            .map_err(|error| format!("decode device_type: {error}"))?,
        updated_at,
    })
}

fn map_db_error(error: DbError) -> AttributionStoreError {
    AttributionStoreError::StorageUnavailable(error.to_string())
}

// SQLSTATE classes 08 (connection exception), 53 (insufficient resources) and
// 57 (operator intervention) describe the server, not the statement.
fn map_pg_error(error: tokio_postgres::Error) -> AttributionStoreError {
    match error.code() {
        Some(state) if is_transient_sqlstate(state.code()) => {
            AttributionStoreError::StorageUnavailable(error.to_string())
        }
        Some(_) => AttributionStoreError::Storage(error.to_string()),
        None => AttributionStoreError::StorageUnavailable(error.to_string()),
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code.get(..2), Some("08" | "53" | "57"))
}
