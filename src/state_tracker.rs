//! Authoritative, crash-safe record of run progress.
//!
//! Progress has two halves: per-table bulk-copy positions and the last
//! binlog positions applied by the DML writer and stored by the inline
//! verifier. Both live in memory behind one mutex and are persisted to the
//! target database as SQL generated here and executed by the appliers inside
//! their own transactions.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::{Pool, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::binlog::BinlogPosition;
use crate::config::Config;
use crate::rewrite::quote_ident;
use crate::tables::{QualifiedTableName, TableSchemaCache};

/// What the copy phase is currently doing with a table. Transitions only move
/// forward: waiting -> copying -> completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableAction {
    Waiting,
    Copying,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProgress {
    /// Highest pagination key known to be committed on the target.
    pub last_successful_pagination_key: u64,
    /// Copy terminates for the table once this key is reached.
    pub target_pagination_key: u64,
    pub current_action: TableAction,
}

/// Snapshot of the whole run, serialisable for resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializableState {
    pub last_written_binlog_position: BinlogPosition,
    pub last_stored_binlog_position_for_inline_verifier: BinlogPosition,
    /// Keyed by the canonical `"<schema>.<table>"` source name.
    pub tables: HashMap<String, TableProgress>,
}

impl SerializableState {
    /// The safe binlog position to resume streaming from: the smaller of the
    /// writer and verifier positions, ignoring any position never recorded.
    pub fn min_binlog_position(&self) -> BinlogPosition {
        BinlogPosition::min_position(
            &self.last_written_binlog_position,
            &self.last_stored_binlog_position_for_inline_verifier,
        )
    }

    /// Fold one `_row_copy_state` row into the state.
    ///
    /// Rows for tables the schema cache does not know are skipped silently -
    /// this tolerates renames and reconfigurations between runs. A payload
    /// that fails to parse for a *known* table corrupts the resume point and
    /// fails the load.
    pub fn apply_state_row(
        &mut self,
        cache: &TableSchemaCache,
        table_name: &str,
        last_pagination_key: Option<&str>,
        copy_complete: bool,
    ) -> Result<()> {
        let known = QualifiedTableName::parse(table_name)
            .map(|name| cache.contains(&name))
            .unwrap_or(false);
        if !known {
            debug!(table = table_name, "ignoring state row for unknown table");
            return Ok(());
        }

        let key = match last_pagination_key {
            Some(payload) => serde_json::from_str::<u64>(payload).map_err(|source| {
                crate::error::FerryError::StateCorruption {
                    table: table_name.to_string(),
                    source,
                }
            })?,
            None => 0,
        };

        let current_action = if copy_complete {
            TableAction::Completed
        } else if key > 0 {
            TableAction::Copying
        } else {
            TableAction::Waiting
        };
        self.tables.insert(
            table_name.to_string(),
            TableProgress {
                last_successful_pagination_key: key,
                target_pagination_key: 0,
                current_action,
            },
        );
        Ok(())
    }
}

pub struct StateTracker {
    inner: Mutex<SerializableState>,
    /// Schema on the target holding the state tables; `None` opts out of
    /// database persistence entirely.
    state_schema: Option<String>,
    server_id: u32,
}

impl StateTracker {
    pub fn new(server_id: u32, state_schema: Option<String>) -> Self {
        Self {
            inner: Mutex::new(SerializableState::default()),
            state_schema,
            server_id,
        }
    }

    /// Create the state schema and tables on the target if needed, read any
    /// prior state, and return the tracker together with the loaded snapshot.
    pub async fn from_target_db(
        pool: &Pool,
        config: &Config,
        cache: &TableSchemaCache,
    ) -> Result<(Self, SerializableState)> {
        let tracker = Self::new(config.my_server_id, config.resume_state_from_db.clone());
        let Some(schema) = tracker.state_schema.clone() else {
            return Ok((tracker, SerializableState::default()));
        };

        let mut conn = pool.get_conn().await.context("connecting to target")?;
        conn.query_drop(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_ident(&schema)
        ))
        .await?;
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             table_name VARCHAR(255) NOT NULL PRIMARY KEY, \
             last_pagination_key JSON, \
             copy_complete TINYINT(1) NOT NULL DEFAULT 0)",
            tracker.row_copy_state_table()
        ))
        .await?;
        for table in [
            tracker.binlog_writer_state_table(),
            tracker.inline_verifier_state_table(),
        ] {
            conn.query_drop(format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 row_id INT NOT NULL PRIMARY KEY, \
                 position_name VARBINARY(255) NOT NULL DEFAULT '', \
                 position_offset BIGINT UNSIGNED NOT NULL DEFAULT 0, \
                 updated_at DATETIME(6))"
            ))
            .await?;
            conn.query_drop(format!(
                "INSERT IGNORE INTO {table} (row_id, position_name, position_offset) \
                 VALUES (1, '', 0)"
            ))
            .await?;
        }

        let mut state = SerializableState::default();
        state.last_written_binlog_position =
            read_position(&mut conn, &tracker.binlog_writer_state_table()).await?;
        state.last_stored_binlog_position_for_inline_verifier =
            read_position(&mut conn, &tracker.inline_verifier_state_table()).await?;

        let rows: Vec<(String, Option<String>, bool)> = conn
            .query(format!(
                "SELECT table_name, last_pagination_key, copy_complete FROM {}",
                tracker.row_copy_state_table()
            ))
            .await?;
        for (table_name, payload, copy_complete) in rows {
            state.apply_state_row(cache, &table_name, payload.as_deref(), copy_complete)?;
        }

        info!(
            tables = state.tables.len(),
            resume_position = %state.min_binlog_position(),
            "loaded resume state from target"
        );

        if let Ok(mut inner) = tracker.inner.lock() {
            *inner = state.clone();
        }
        Ok((tracker, state))
    }

    /// Record forward copy progress for a table. Keys are monotonic: a
    /// smaller key than the recorded one is ignored.
    pub fn update_last_successful_pagination_key(&self, table: &str, key: u64) {
        let Ok(mut state) = self.inner.lock() else { return };
        let progress = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| TableProgress {
                last_successful_pagination_key: 0,
                target_pagination_key: 0,
                current_action: TableAction::Waiting,
            });
        progress.last_successful_pagination_key =
            progress.last_successful_pagination_key.max(key);
        if progress.current_action == TableAction::Waiting {
            progress.current_action = TableAction::Copying;
        }
    }

    /// Announce a table to the copy phase with its terminal pagination key.
    pub fn register_table(&self, table: &str, target_pagination_key: u64) {
        let Ok(mut state) = self.inner.lock() else { return };
        let progress = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| TableProgress {
                last_successful_pagination_key: 0,
                target_pagination_key: 0,
                current_action: TableAction::Waiting,
            });
        progress.target_pagination_key = target_pagination_key;
    }

    /// Terminal action for a table; never reverts.
    pub fn mark_table_as_completed(&self, table: &str) {
        let Ok(mut state) = self.inner.lock() else { return };
        let progress = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| TableProgress {
                last_successful_pagination_key: 0,
                target_pagination_key: 0,
                current_action: TableAction::Waiting,
            });
        progress.current_action = TableAction::Completed;
    }

    pub fn table_action(&self, table: &str) -> Option<TableAction> {
        self.inner
            .lock()
            .ok()?
            .tables
            .get(table)
            .map(|p| p.current_action)
    }

    pub fn update_last_written_binlog_position(&self, position: BinlogPosition) {
        if let Ok(mut state) = self.inner.lock() {
            state.last_written_binlog_position = position;
        }
    }

    pub fn update_last_stored_binlog_position_for_inline_verifier(
        &self,
        position: BinlogPosition,
    ) {
        if let Ok(mut state) = self.inner.lock() {
            state.last_stored_binlog_position_for_inline_verifier = position;
        }
    }

    pub fn last_written_binlog_position(&self) -> BinlogPosition {
        self.inner
            .lock()
            .map(|state| state.last_written_binlog_position.clone())
            .unwrap_or_default()
    }

    pub fn serialize(&self) -> SerializableState {
        self.inner
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// SQL persisting the DML writer's binlog position, appended to the batch
    /// transaction. `None` when database persistence is opted out.
    pub fn store_binlog_writer_position_sql(
        &self,
        position: &BinlogPosition,
        event_time: DateTime<Utc>,
    ) -> Result<Option<String>> {
        self.store_position_sql(self.binlog_writer_state_table(), position, event_time)
    }

    /// Same as [`Self::store_binlog_writer_position_sql`] for the inline
    /// verifier's checkpoint table.
    pub fn store_inline_verifier_position_sql(
        &self,
        position: &BinlogPosition,
        event_time: DateTime<Utc>,
    ) -> Result<Option<String>> {
        self.store_position_sql(self.inline_verifier_state_table(), position, event_time)
    }

    fn store_position_sql(
        &self,
        table: String,
        position: &BinlogPosition,
        event_time: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if self.state_schema.is_none() {
            return Ok(None);
        }
        Ok(Some(format!(
            "UPDATE {table} SET position_name = {}, position_offset = {}, updated_at = '{}' \
             WHERE row_id = 1",
            Value::from(position.file.as_str()).as_sql(false),
            position.offset,
            event_time.format("%Y-%m-%d %H:%M:%S%.6f"),
        )))
    }

    /// SQL persisting copy completion for a table. `None` opts out.
    pub fn store_row_copy_done_sql(&self, table: &str) -> Result<Option<String>> {
        if self.state_schema.is_none() {
            return Ok(None);
        }
        Ok(Some(format!(
            "INSERT INTO {} (table_name, last_pagination_key, copy_complete) \
             VALUES ({}, NULL, 1) \
             ON DUPLICATE KEY UPDATE copy_complete = 1",
            self.row_copy_state_table(),
            Value::from(table).as_sql(false),
        )))
    }

    fn state_table(&self, suffix: &str) -> String {
        let schema = self.state_schema.as_deref().unwrap_or_default();
        format!(
            "{}.{}",
            quote_ident(schema),
            quote_ident(&format!("_ghostferry_{}_{suffix}", self.server_id))
        )
    }

    fn row_copy_state_table(&self) -> String {
        self.state_table("_row_copy_state")
    }

    fn binlog_writer_state_table(&self) -> String {
        self.state_table("_last_binlog_writer_state")
    }

    fn inline_verifier_state_table(&self) -> String {
        self.state_table("_last_inline_verifier_state")
    }
}

async fn read_position(conn: &mut mysql_async::Conn, table: &str) -> Result<BinlogPosition> {
    let row: Option<(String, u64)> = conn
        .query_first(format!(
            "SELECT position_name, position_offset FROM {table} WHERE row_id = 1"
        ))
        .await
        .with_context(|| format!("reading binlog position from {table}"))?;
    Ok(row
        .map(|(file, offset)| BinlogPosition::new(file, offset))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::TableSchema;

    fn tracker() -> StateTracker {
        StateTracker::new(91919, Some("gftest_state".to_string()))
    }

    fn cache_with(table: &QualifiedTableName) -> TableSchemaCache {
        let cache = TableSchemaCache::new();
        cache.insert(TableSchema {
            name: table.clone(),
            columns: vec!["id".to_string()],
            pk_indices: vec![0],
            pagination_key_index: Some(0),
        });
        cache
    }

    #[test]
    fn test_min_binlog_position() {
        let mut state = SerializableState::default();
        state.last_written_binlog_position = BinlogPosition::new("mysql-bin.00003", 4);
        state.last_stored_binlog_position_for_inline_verifier =
            BinlogPosition::new("mysql-bin.00003", 10);
        assert_eq!(
            state.min_binlog_position(),
            BinlogPosition::new("mysql-bin.00003", 4)
        );

        state.last_stored_binlog_position_for_inline_verifier =
            BinlogPosition::new("mysql-bin.00002", 10);
        assert_eq!(
            state.min_binlog_position(),
            BinlogPosition::new("mysql-bin.00002", 10)
        );

        state.last_written_binlog_position = BinlogPosition::default();
        assert_eq!(
            state.min_binlog_position(),
            BinlogPosition::new("mysql-bin.00002", 10)
        );

        state.last_stored_binlog_position_for_inline_verifier = BinlogPosition::default();
        assert_eq!(state.min_binlog_position(), BinlogPosition::default());
    }

    #[test]
    fn test_pagination_key_is_monotonic() {
        let tracker = tracker();
        tracker.update_last_successful_pagination_key("db.t", 10);
        tracker.update_last_successful_pagination_key("db.t", 7);
        tracker.update_last_successful_pagination_key("db.t", 12);

        let state = tracker.serialize();
        assert_eq!(state.tables["db.t"].last_successful_pagination_key, 12);
        assert_eq!(state.tables["db.t"].current_action, TableAction::Copying);
    }

    #[test]
    fn test_completed_is_terminal() {
        let tracker = tracker();
        tracker.mark_table_as_completed("db.t");
        tracker.update_last_successful_pagination_key("db.t", 5);

        assert_eq!(tracker.table_action("db.t"), Some(TableAction::Completed));
    }

    #[test]
    fn test_apply_state_row_skips_unknown_tables() {
        let table = QualifiedTableName::new("gftest", "table1");
        let cache = cache_with(&table);
        let mut state = SerializableState::default();

        // unknown table with garbage payload: silently ignored
        state
            .apply_state_row(&cache, "gftest.unknown_table", Some("not json"), false)
            .unwrap();
        assert!(state.tables.is_empty());

        // known table with garbage payload: fatal
        let err = state
            .apply_state_row(&cache, "gftest.table1", Some("not json"), false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::FerryError>(),
            Some(crate::error::FerryError::StateCorruption { .. })
        ));

        // known table with valid payload
        state
            .apply_state_row(&cache, "gftest.table1", Some("42"), false)
            .unwrap();
        assert_eq!(
            state.tables["gftest.table1"].last_successful_pagination_key,
            42
        );
        assert_eq!(
            state.tables["gftest.table1"].current_action,
            TableAction::Copying
        );

        // completion wins over key state
        state
            .apply_state_row(&cache, "gftest.table1", None, true)
            .unwrap();
        assert_eq!(
            state.tables["gftest.table1"].current_action,
            TableAction::Completed
        );
    }

    #[test]
    fn test_store_position_sql_shape() {
        let tracker = tracker();
        let sql = tracker
            .store_binlog_writer_position_sql(
                &BinlogPosition::new("mysql-bin.00007", 1234),
                Utc::now(),
            )
            .unwrap()
            .unwrap();
        assert!(sql.contains("`gftest_state`.`_ghostferry_91919__last_binlog_writer_state`"));
        assert!(sql.contains("'mysql-bin.00007'"));
        assert!(sql.contains("position_offset = 1234"));
    }

    #[test]
    fn test_state_sql_opt_out_without_schema() {
        let tracker = StateTracker::new(91919, None);
        assert!(tracker
            .store_binlog_writer_position_sql(&BinlogPosition::new("f", 1), Utc::now())
            .unwrap()
            .is_none());
        assert!(tracker.store_row_copy_done_sql("db.t").unwrap().is_none());
    }

    #[test]
    fn test_row_copy_done_sql_shape() {
        let tracker = tracker();
        let sql = tracker.store_row_copy_done_sql("db.t").unwrap().unwrap();
        assert!(sql.contains("`gftest_state`.`_ghostferry_91919__row_copy_state`"));
        assert!(sql.contains("'db.t'"));
        assert!(sql.contains("copy_complete = 1"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let tracker = tracker();
        tracker.update_last_written_binlog_position(BinlogPosition::new("mysql-bin.00002", 99));
        tracker.update_last_successful_pagination_key("db.t", 4);

        let json = serde_json::to_string(&tracker.serialize()).unwrap();
        let restored: SerializableState = serde_json::from_str(&json).unwrap();
        assert_eq!(
            restored.last_written_binlog_position,
            BinlogPosition::new("mysql-bin.00002", 99)
        );
        assert_eq!(restored.tables["db.t"].last_successful_pagination_key, 4);
    }
}
