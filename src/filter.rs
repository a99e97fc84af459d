//! Table and row applicability filters for sharded runs.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use regex::Regex;

use crate::binlog::{value_as_u64, RowChange};
use crate::events::DmlEvent;
use crate::tables::{QualifiedTableName, TableSchema};

/// Decides which databases and tables take part in the run at all.
pub trait TableFilter: Send + Sync {
    fn applicable_databases(&self, databases: &[String]) -> Result<Vec<String>>;
    fn applicable_tables(&self, tables: &[Arc<TableSchema>]) -> Result<Vec<Arc<TableSchema>>>;
}

/// Decides, per DML event, whether the row belongs to this run.
pub trait CopyFilter: Send + Sync {
    fn applicable_dml_event(&self, event: &DmlEvent) -> Result<bool>;
}

/// Restricts the run to one source shard database.
///
/// A table participates when it carries the sharding key column, is a
/// designated primary-key table, or is a joined table; tables matching an
/// ignored pattern never participate.
pub struct ShardedTableFilter {
    pub source_shard: String,
    pub sharding_key: String,
    pub joined_tables: HashSet<String>,
    pub primary_key_tables: HashSet<String>,
    pub ignored_tables: Vec<Regex>,
}

impl TableFilter for ShardedTableFilter {
    fn applicable_databases(&self, databases: &[String]) -> Result<Vec<String>> {
        Ok(databases
            .iter()
            .filter(|db| **db == self.source_shard)
            .cloned()
            .collect())
    }

    fn applicable_tables(&self, tables: &[Arc<TableSchema>]) -> Result<Vec<Arc<TableSchema>>> {
        Ok(tables
            .iter()
            .filter(|table| {
                if self.is_ignored(&table.name) {
                    return false;
                }
                self.joined_tables.contains(&table.name.table_name)
                    || self.primary_key_tables.contains(&table.name.table_name)
                    || table.column_index(&self.sharding_key).is_some()
            })
            .cloned()
            .collect())
    }
}

impl ShardedTableFilter {
    fn is_ignored(&self, name: &QualifiedTableName) -> bool {
        let full = name.to_string();
        self.ignored_tables.iter().any(|re| re.is_match(&full))
    }
}

/// Replays only rows belonging to one shard.
///
/// Joined tables are never replayed from the binlog: their referential
/// consistency cannot be established row-by-row, so they are re-copied in
/// full while the source is locked at cutover.
pub struct ShardedRowFilter {
    pub sharding_key: String,
    pub sharding_value: u64,
    pub joined_tables: HashSet<String>,
    pub primary_key_tables: HashSet<String>,
}

impl CopyFilter for ShardedRowFilter {
    fn applicable_dml_event(&self, event: &DmlEvent) -> Result<bool> {
        let table = &event.table;
        if self.joined_tables.contains(&table.name.table_name) {
            return Ok(false);
        }

        let column_index = if self.primary_key_tables.contains(&table.name.table_name) {
            match table.pk_indices.as_slice() {
                [only] => *only,
                other => bail!(
                    "primary-key table {} must have a single-column key, has {}",
                    table.name,
                    other.len()
                ),
            }
        } else {
            match table.column_index(&self.sharding_key) {
                Some(index) => index,
                None => bail!("sharding key {} not present on {}", self.sharding_key, table.name),
            }
        };

        let row = match &event.change {
            RowChange::Insert { new } => new,
            RowChange::Update { old, .. } => old,
            RowChange::Delete { old } => old,
        };
        let Some(value) = row.get(column_index) else {
            bail!("row for {} is narrower than its schema", table.name);
        };
        Ok(value_as_u64(value)? == self.sharding_value)
    }
}
