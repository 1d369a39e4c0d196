//! Schema discovery and caching for datasync-core
//!
//! Provides:
//! - SchemaProvider: read-only schema discovery
//! - StoreSchemaProvider: discovery through the store's catalog queries
//! - SchemaCatalog: lazily-filled cache, invalidated only by explicit refresh

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, ForeignKeyDescriptor, KeyDescriptor, Row, TableSchema, Value};

/// Schema provider for read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// List all user tables
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Get table schema, `None` when the table does not exist
    async fn get_table(&self, table: &str) -> Result<Option<TableSchema>>;

    /// Check if a table exists
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.get_table(table).await?.is_some())
    }
}

/// Schema discovery through the dialect's catalog queries on a live connection
pub struct StoreSchemaProvider<'a> {
    conn: &'a dyn Connection,
    dialect: &'a dyn SqlDialect,
}

impl<'a> StoreSchemaProvider<'a> {
    /// Create a provider over a borrowed connection
    pub fn new(conn: &'a dyn Connection, dialect: &'a dyn SqlDialect) -> Self {
        Self { conn, dialect }
    }

    async fn keys(&self, table: &str) -> Result<Vec<KeyDescriptor>> {
        let indexes = self
            .conn
            .query(self.dialect.index_list_sql(), &[Value::from(table)])
            .await?;

        let mut keys = Vec::new();
        for index in indexes {
            let unique = int_field(&index, "unique") != 0;
            if !unique {
                continue;
            }
            let name = text_field(&index, "name");
            let origin = text_field(&index, "origin");
            let members = self
                .conn
                .query(self.dialect.index_columns_sql(), &[Value::from(name.as_str())])
                .await?;
            keys.push(KeyDescriptor {
                name,
                columns: members.iter().map(|m| text_field(m, "name")).collect(),
                primary: origin == "pk",
            });
        }
        Ok(keys)
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let rows = self
            .conn
            .query(self.dialect.foreign_keys_sql(), &[Value::from(table)])
            .await?;
        Ok(rows
            .iter()
            .map(|r| ForeignKeyDescriptor {
                column: text_field(r, "from"),
                referenced_table: text_field(r, "table"),
                // Empty when the reference targets the parent's primary key implicitly
                referenced_column: text_field(r, "to"),
            })
            .collect())
    }
}

#[async_trait]
impl SchemaProvider for StoreSchemaProvider<'_> {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self.conn.query(self.dialect.list_tables_sql(), &[]).await?;
        Ok(rows.iter().map(|r| text_field(r, "name")).collect())
    }

    async fn get_table(&self, table: &str) -> Result<Option<TableSchema>> {
        let rows = self
            .conn
            .query(self.dialect.table_info_sql(), &[Value::from(table)])
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut schema = TableSchema::new(table);
        for row in &rows {
            let mut column = ColumnMetadata::new(text_field(row, "name"), text_field(row, "type"));
            column.nullable = int_field(row, "notnull") == 0;
            let pk = int_field(row, "pk");
            if pk > 0 {
                column = column.primary_key(pk as u32);
            }
            column.default_value = row
                .get_by_name("dflt_value")
                .filter(|v| !v.is_null())
                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()));
            schema = schema.with_column(column);
        }
        schema.keys = self.keys(table).await?;
        schema.foreign_keys = self.foreign_keys(table).await?;

        debug!(
            table,
            columns = schema.columns.len(),
            keys = schema.keys.len(),
            foreign_keys = schema.foreign_keys.len(),
            "introspected table schema"
        );
        Ok(Some(schema))
    }
}

fn text_field(row: &Row, name: &str) -> String {
    match row.get_by_name(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn int_field(row: &Row, name: &str) -> i64 {
    row.get_by_name(name).and_then(Value::as_i64).unwrap_or(0)
}

/// Cache of table schemas keyed by case-insensitive table name.
///
/// Entries are built on first reference and stay until `invalidate` or
/// `invalidate_all` is called.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    tables: RwLock<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached schema, if present
    pub fn cached(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.read().get(&table.to_lowercase()).cloned()
    }

    /// Get a schema, loading it through `provider` on first reference
    pub async fn get(&self, provider: &dyn SchemaProvider, table: &str) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.cached(table) {
            return Ok(schema);
        }
        let schema = provider
            .get_table(table)
            .await?
            .ok_or_else(|| Error::TableNotFound {
                table: table.to_string(),
            })?;
        let schema = Arc::new(schema);
        self.tables
            .write()
            .insert(table.to_lowercase(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Insert a schema directly
    pub fn insert(&self, schema: TableSchema) -> Arc<TableSchema> {
        let schema = Arc::new(schema);
        self.tables
            .write()
            .insert(schema.name.to_lowercase(), Arc::clone(&schema));
        schema
    }

    /// Drop one cached table; returns whether it was cached
    pub fn invalidate(&self, table: &str) -> bool {
        self.tables.write().remove(&table.to_lowercase()).is_some()
    }

    /// Drop every cached table
    pub fn invalidate_all(&self) {
        self.tables.write().clear();
    }

    /// Number of cached tables
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}
