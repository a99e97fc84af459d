//! Table identity and the shared schema cache.
//!
//! The cache maps *source* qualified names to immutable [`TableSchema`]
//! snapshots. Readers (event translation, batch rendering) clone the `Arc`
//! and keep working against the snapshot they saw; a DDL reload swaps in a
//! fresh snapshot without disturbing in-flight work. Entries for dropped
//! tables are left in place - they simply stop being looked up.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use serde::{Deserialize, Serialize};

/// A `(schema, table)` pair. Comparison is case-sensitive; the display form
/// `"<schema>.<table>"` is the canonical key used by the state tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedTableName {
    pub schema_name: String,
    pub table_name: String,
}

impl QualifiedTableName {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    /// Parse the canonical `"<schema>.<table>"` form.
    pub fn parse(name: &str) -> Option<Self> {
        let (schema, table) = name.split_once('.')?;
        if schema.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self::new(schema, table))
    }
}

impl std::fmt::Display for QualifiedTableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_name)
    }
}

/// Cached column list and key metadata for one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: QualifiedTableName,
    /// Column names in ordinal order.
    pub columns: Vec<String>,
    /// Indices into `columns` for the primary-key columns.
    pub pk_indices: Vec<usize>,
    /// Index of the pagination-key column, when the table has one.
    pub pagination_key_index: Option<usize>,
}

impl TableSchema {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Shared, mutable map of table schemas, keyed by source qualified name.
#[derive(Clone, Default)]
pub struct TableSchemaCache {
    inner: Arc<RwLock<HashMap<QualifiedTableName, Arc<TableSchema>>>>,
}

impl TableSchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &QualifiedTableName) -> Option<Arc<TableSchema>> {
        self.inner.read().ok()?.get(name).cloned()
    }

    /// Insert or replace the snapshot for a table.
    pub fn insert(&self, schema: TableSchema) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(schema.name.clone(), Arc::new(schema));
        }
    }

    pub fn contains(&self, name: &QualifiedTableName) -> bool {
        self.inner
            .read()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    pub fn known_tables(&self) -> Vec<QualifiedTableName> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read a table's column and key metadata from `information_schema`.
///
/// Used against the target database after DDL has been applied there; the
/// caller re-keys the result by source names before caching when rewrites are
/// configured.
pub async fn load_table_schema(conn: &mut Conn, table: &QualifiedTableName) -> Result<TableSchema> {
    let rows: Vec<(String, String, String)> = conn
        .exec(
            "SELECT COLUMN_NAME, COLUMN_KEY, EXTRA \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (table.schema_name.as_str(), table.table_name.as_str()),
        )
        .await
        .with_context(|| format!("reading column metadata for {table}"))?;

    if rows.is_empty() {
        bail!("table {table} does not exist on the target");
    }

    let columns: Vec<String> = rows.iter().map(|(name, _, _)| name.clone()).collect();
    let pk_indices: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, (_, key, _))| key == "PRI")
        .map(|(i, _)| i)
        .collect();
    let pagination_key_index = rows
        .iter()
        .enumerate()
        .find(|(_, (_, key, extra))| key == "PRI" && extra.contains("auto_increment"))
        .map(|(i, _)| i)
        .or_else(|| match pk_indices.as_slice() {
            [only] => Some(*only),
            _ => None,
        });

    Ok(TableSchema {
        name: table.clone(),
        columns,
        pk_indices,
        pagination_key_index,
    })
}
