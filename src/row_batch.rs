//! Row batches produced by the data iterator for the bulk-copy phase.

use std::sync::Arc;

use anyhow::{Context, Result};
use mysql_async::{Params, Value};

use crate::binlog::value_as_u64;
use crate::rewrite::{qualified_name, quote_ident};
use crate::tables::{QualifiedTableName, TableSchema};

/// One unit of work for the batch writer.
#[derive(Debug, Clone)]
pub enum RowBatch {
    /// A contiguous range of existing rows to insert.
    Insert(InsertRowBatch),
    /// A one-off initialisation statement with no row-range semantics, e.g.
    /// creating a table discovered mid-run.
    Init(InitRowBatch),
}

impl RowBatch {
    /// The source-side table this batch belongs to. State tracking keys off
    /// this name regardless of rewrites.
    pub fn source_table(&self) -> &QualifiedTableName {
        match self {
            RowBatch::Insert(batch) => &batch.table.name,
            RowBatch::Init(batch) => &batch.table,
        }
    }
}

/// An ordered list of rows for one table, rendered as a single multi-row
/// parameterised INSERT.
#[derive(Debug, Clone)]
pub struct InsertRowBatch {
    table: Arc<TableSchema>,
    values: Vec<Vec<Value>>,
    pagination_key_index: Option<usize>,
}

impl InsertRowBatch {
    pub fn new(
        table: Arc<TableSchema>,
        values: Vec<Vec<Value>>,
        pagination_key_index: Option<usize>,
    ) -> Self {
        Self {
            table,
            values,
            pagination_key_index,
        }
    }

    pub fn table_schema(&self) -> &Arc<TableSchema> {
        &self.table
    }

    pub fn values(&self) -> &[Vec<Value>] {
        &self.values
    }

    pub fn values_contain_pagination_key(&self) -> bool {
        self.pagination_key_index.is_some() && !self.values.is_empty()
    }

    /// The first and last pagination keys of the (contiguous) range, when the
    /// batch carries them.
    pub fn pagination_key_endpoints(&self) -> Result<Option<(u64, u64)>> {
        let Some(index) = self.pagination_key_index else {
            return Ok(None);
        };
        let (Some(first), Some(last)) = (self.values.first(), self.values.last()) else {
            return Ok(None);
        };
        let start = value_as_u64(&first[index])
            .with_context(|| format!("first pagination key of batch for {}", self.table.name))?;
        let end = value_as_u64(&last[index])
            .with_context(|| format!("last pagination key of batch for {}", self.table.name))?;
        Ok(Some((start, end)))
    }

    /// Render the batch as `INSERT IGNORE INTO ... VALUES (?,...),(?,...)`
    /// with positional parameters.
    pub fn as_sql(&self, database: &str, table: &str) -> (String, Params) {
        let columns = self
            .table
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        let row_template = format!(
            "({})",
            vec!["?"; self.table.columns.len()].join(",")
        );
        let rows = vec![row_template.as_str(); self.values.len()].join(",");
        let query = format!(
            "INSERT IGNORE INTO {} ({columns}) VALUES {rows}",
            qualified_name(database, table)
        );
        let params = Params::Positional(self.values.iter().flatten().cloned().collect());
        (query, params)
    }
}

/// A single statement executed in its own transaction, referenced by the
/// fully-qualified source name so rewrites can be substituted at render time.
#[derive(Debug, Clone)]
pub struct InitRowBatch {
    table: QualifiedTableName,
    statement: String,
}

impl InitRowBatch {
    /// `statement` must reference the table as `` `schema`.`table` `` so the
    /// target names can be substituted in.
    pub fn new(table: QualifiedTableName, statement: impl Into<String>) -> Self {
        Self {
            table,
            statement: statement.into(),
        }
    }

    pub fn as_sql(&self, database: &str, table: &str) -> String {
        self.statement.replace(
            &qualified_name(&self.table.schema_name, &self.table.table_name),
            &qualified_name(database, table),
        )
    }
}
