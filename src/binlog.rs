//! Binlog positions and parsed replication events.
//!
//! The binlog reader (external to this crate) parses the MySQL binary log and
//! hands [`ReplicationEvent`]s to the binlog writer. Only row events and query
//! events are meaningful to the applier; anything else arriving here is a
//! streamer contract violation.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use mysql_async::Value;
use serde::{Deserialize, Serialize};

use crate::tables::QualifiedTableName;

/// A position in the MySQL binary log: file name plus byte offset.
///
/// Ordering is lexicographic on the file name, then numeric on the offset.
/// A position with an empty file name means "no position recorded yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// True when no position has been recorded.
    pub fn is_absent(&self) -> bool {
        self.file.is_empty()
    }

    /// The smaller of two positions, ignoring absent ones. Returns the absent
    /// position only when both are absent.
    pub fn min_position(a: &BinlogPosition, b: &BinlogPosition) -> BinlogPosition {
        match (a.is_absent(), b.is_absent()) {
            (true, _) => b.clone(),
            (_, true) => a.clone(),
            (false, false) => std::cmp::min(a, b).clone(),
        }
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// One parsed replication event plus where it sits in the binlog.
#[derive(Debug, Clone)]
pub struct ReplicationEvent {
    pub position: BinlogPosition,
    pub event_time: DateTime<Utc>,
    pub payload: EventPayload,
}

/// The payload variants the applier understands.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// INSERT/UPDATE/DELETE on a single table, one entry per affected row.
    Rows {
        table: QualifiedTableName,
        changes: Vec<RowChange>,
    },
    /// Arbitrary SQL executed on the source, typically DDL. `schema` is the
    /// default database the statement ran under.
    Query { schema: String, query: String },
    /// Anything the streamer could parse but the applier has no business
    /// receiving. Treated as fatal by the binlog writer.
    Unsupported { kind: String },
}

/// A single row-level change, column-aligned with the table schema.
#[derive(Debug, Clone)]
pub enum RowChange {
    Insert { new: Vec<Value> },
    Update { old: Vec<Value>, new: Vec<Value> },
    Delete { old: Vec<Value> },
}

/// Extract a u64 pagination-key value from a row column.
pub fn value_as_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Int(i) if *i >= 0 => Ok(*i as u64),
        Value::UInt(u) => Ok(*u),
        Value::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes)?;
            Ok(text.parse()?)
        }
        other => bail!("value {other:?} is not usable as a pagination key"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.00002", 10);
        let b = BinlogPosition::new("mysql-bin.00003", 4);
        assert!(a < b);

        let c = BinlogPosition::new("mysql-bin.00003", 10);
        assert!(b < c);
    }

    #[test]
    fn test_min_position_ignores_absent() {
        let present = BinlogPosition::new("mysql-bin.00002", 10);
        let absent = BinlogPosition::default();

        assert_eq!(BinlogPosition::min_position(&present, &absent), present);
        assert_eq!(BinlogPosition::min_position(&absent, &present), present);
        assert_eq!(
            BinlogPosition::min_position(&absent, &absent),
            BinlogPosition::default()
        );
    }

    #[test]
    fn test_value_as_u64() {
        assert_eq!(value_as_u64(&Value::Int(42)).unwrap(), 42);
        assert_eq!(value_as_u64(&Value::UInt(7)).unwrap(), 7);
        assert_eq!(value_as_u64(&Value::Bytes(b"19".to_vec())).unwrap(), 19);
        assert!(value_as_u64(&Value::NULL).is_err());
        assert!(value_as_u64(&Value::Int(-1)).is_err());
    }
}
