//! Applier-ready DXL events rendered to SQL at apply time.
//!
//! A DXL event is the normalised form of a source-side change: DML events are
//! batchable and render to statements that are safe to re-apply from any
//! earlier checkpoint; DDL events implicitly commit in MySQL and therefore
//! must run as their own single-event batch.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use mysql_async::Value;

use crate::binlog::{BinlogPosition, RowChange};
use crate::rewrite::{qualified_name, quote_ident};
use crate::tables::{QualifiedTableName, TableSchema};

/// A normalised source-side change, ready to be rendered against possibly
/// rewritten target names.
#[derive(Debug, Clone)]
pub enum DxlEvent {
    Dml(DmlEvent),
    Ddl(DdlEvent),
}

impl DxlEvent {
    /// DDL statements implicitly commit and must not share a batch.
    pub fn is_auto_transaction(&self) -> bool {
        matches!(self, DxlEvent::Ddl(_))
    }

    pub fn database(&self) -> &str {
        match self {
            DxlEvent::Dml(ev) => &ev.table.name.schema_name,
            DxlEvent::Ddl(ev) => &ev.table.schema_name,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            DxlEvent::Dml(ev) => &ev.table.name.table_name,
            DxlEvent::Ddl(ev) => &ev.table.table_name,
        }
    }

    pub fn binlog_position(&self) -> &BinlogPosition {
        match self {
            DxlEvent::Dml(ev) => &ev.position,
            DxlEvent::Ddl(ev) => &ev.position,
        }
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        match self {
            DxlEvent::Dml(ev) => ev.event_time,
            DxlEvent::Ddl(ev) => ev.event_time,
        }
    }

    /// Render a fully-bound SQL statement against the given target names.
    pub fn to_sql(&self, database: &str, table: &str) -> Result<String> {
        match self {
            DxlEvent::Dml(ev) => ev.to_sql(database, table),
            DxlEvent::Ddl(ev) => Ok(ev.to_sql(database)),
        }
    }
}

/// A single row operation from the binlog, carrying the schema snapshot that
/// was current when the event was translated.
#[derive(Debug, Clone)]
pub struct DmlEvent {
    pub table: Arc<TableSchema>,
    pub position: BinlogPosition,
    pub event_time: DateTime<Utc>,
    pub change: RowChange,
}

impl DmlEvent {
    /// Render an idempotent statement: re-applying an event from an earlier
    /// checkpoint must be a no-op. Inserts ignore duplicates; updates and
    /// deletes are keyed by primary key.
    pub fn to_sql(&self, database: &str, table: &str) -> Result<String> {
        let target = qualified_name(database, table);
        match &self.change {
            RowChange::Insert { new } => {
                self.check_width(new)?;
                let columns = self
                    .table
                    .columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(",");
                Ok(format!(
                    "INSERT IGNORE INTO {target} ({columns}) VALUES ({})",
                    render_values(new)
                ))
            }
            RowChange::Update { old, new } => {
                self.check_width(old)?;
                self.check_width(new)?;
                let assignments = self
                    .table
                    .columns
                    .iter()
                    .zip(new.iter())
                    .map(|(col, val)| format!("{}={}", quote_ident(col), render_value(val)))
                    .collect::<Vec<_>>()
                    .join(",");
                Ok(format!(
                    "UPDATE {target} SET {assignments} WHERE {}",
                    self.pk_conditions(old)?
                ))
            }
            RowChange::Delete { old } => {
                self.check_width(old)?;
                Ok(format!(
                    "DELETE FROM {target} WHERE {}",
                    self.pk_conditions(old)?
                ))
            }
        }
    }

    fn pk_conditions(&self, row: &[Value]) -> Result<String> {
        if self.table.pk_indices.is_empty() {
            bail!("table {} has no primary key to replay DML against", self.table.name);
        }
        Ok(self
            .table
            .pk_indices
            .iter()
            .map(|&i| format!("{}={}", quote_ident(&self.table.columns[i]), render_value(&row[i])))
            .collect::<Vec<_>>()
            .join(" AND "))
    }

    fn check_width(&self, row: &[Value]) -> Result<()> {
        if row.len() != self.table.columns.len() {
            bail!(
                "row width {} does not match schema of {} ({} columns)",
                row.len(),
                self.table.name,
                self.table.columns.len()
            );
        }
        Ok(())
    }
}

/// A schema-change statement from the binlog.
#[derive(Debug, Clone)]
pub struct DdlEvent {
    /// The table the statement affects, in source names.
    pub table: QualifiedTableName,
    pub position: BinlogPosition,
    pub event_time: DateTime<Utc>,
    /// The statement as emitted by the query analyzer, with unqualified table
    /// references.
    pub statement: String,
}

impl DdlEvent {
    /// DDL is applied under the (rewritten) target database. Any explicit
    /// `` `source_db`. `` qualifiers left in the statement are rewritten at the
    /// qualified-name level.
    pub fn to_sql(&self, database: &str) -> String {
        let statement = self.statement.replace(
            &format!("{}.", quote_ident(&self.table.schema_name)),
            &format!("{}.", quote_ident(database)),
        );
        format!("USE {};\n{}", quote_ident(database), statement)
    }
}

fn render_value(value: &Value) -> String {
    value.as_sql(false)
}

fn render_values(row: &[Value]) -> String {
    row.iter().map(render_value).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema {
            name: QualifiedTableName::new("shop", "users"),
            columns: vec!["id".to_string(), "email".to_string()],
            pk_indices: vec![0],
            pagination_key_index: Some(0),
        })
    }

    fn dml(change: RowChange) -> DmlEvent {
        DmlEvent {
            table: users_schema(),
            position: BinlogPosition::new("mysql-bin.00001", 120),
            event_time: Utc::now(),
            change,
        }
    }

    #[test]
    fn test_insert_renders_idempotent() {
        let ev = dml(RowChange::Insert {
            new: vec![Value::Int(1), Value::Bytes(b"a@b.c".to_vec())],
        });
        assert_eq!(
            ev.to_sql("shop_target", "users").unwrap(),
            "INSERT IGNORE INTO `shop_target`.`users` (`id`,`email`) VALUES (1,'a@b.c')"
        );
    }

    #[test]
    fn test_update_keyed_by_primary_key() {
        let ev = dml(RowChange::Update {
            old: vec![Value::Int(1), Value::Bytes(b"old".to_vec())],
            new: vec![Value::Int(1), Value::Bytes(b"new".to_vec())],
        });
        let sql = ev.to_sql("shop", "users").unwrap();
        assert_eq!(
            sql,
            "UPDATE `shop`.`users` SET `id`=1,`email`='new' WHERE `id`=1"
        );
    }

    #[test]
    fn test_delete_keyed_by_primary_key() {
        let ev = dml(RowChange::Delete {
            old: vec![Value::Int(9), Value::NULL],
        });
        assert_eq!(
            ev.to_sql("shop", "users").unwrap(),
            "DELETE FROM `shop`.`users` WHERE `id`=9"
        );
    }

    #[test]
    fn test_row_width_mismatch_is_an_error() {
        let ev = dml(RowChange::Insert {
            new: vec![Value::Int(1)],
        });
        assert!(ev.to_sql("shop", "users").is_err());
    }

    #[test]
    fn test_ddl_renders_under_target_database() {
        let ev = DdlEvent {
            table: QualifiedTableName::new("shop", "users"),
            position: BinlogPosition::new("mysql-bin.00001", 4),
            event_time: Utc::now(),
            statement: "ALTER TABLE `users` ADD COLUMN `age` INT".to_string(),
        };
        assert_eq!(
            ev.to_sql("shop_target"),
            "USE `shop_target`;\nALTER TABLE `users` ADD COLUMN `age` INT"
        );
    }

    #[test]
    fn test_ddl_rewrites_explicit_qualifiers() {
        let ev = DdlEvent {
            table: QualifiedTableName::new("shop", "users"),
            position: BinlogPosition::new("mysql-bin.00001", 4),
            event_time: Utc::now(),
            statement: "ALTER TABLE `shop`.`users` ADD COLUMN `age` INT".to_string(),
        };
        assert!(ev
            .to_sql("shop_target")
            .contains("ALTER TABLE `shop_target`.`users`"));
    }

    #[test]
    fn test_dml_is_auto_transaction_flags() {
        let ev = DxlEvent::Dml(dml(RowChange::Insert {
            new: vec![Value::Int(1), Value::NULL],
        }));
        assert!(!ev.is_auto_transaction());

        let ddl = DxlEvent::Ddl(DdlEvent {
            table: QualifiedTableName::new("shop", "users"),
            position: BinlogPosition::new("mysql-bin.00001", 4),
            event_time: Utc::now(),
            statement: "TRUNCATE TABLE `users`".to_string(),
        });
        assert!(ddl.is_auto_transaction());
    }
}
