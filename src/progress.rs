//! Run-progress snapshots for the optional progress callback.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::binlog::BinlogPosition;
use crate::config::VerifierType;
use crate::state_tracker::{SerializableState, TableAction, TableProgress};

/// One observation of the whole run, POSTed verbatim to the progress
/// callback endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    /// What the run is doing right now, in one word.
    pub current_state: String,
    /// Forwarded from the progress-callback configuration so an aggregation
    /// service can identify the sender.
    pub custom_payload: serde_json::Value,
    pub tables: HashMap<String, TableProgress>,
    pub last_successful_binlog_pos: BinlogPosition,
    pub binlog_streamer_lag_seconds: f64,
    pub throttled: bool,
    pub verifier_type: VerifierType,
    pub pagination_keys_per_second: u64,
    pub time_taken_seconds: f64,
}

impl Progress {
    pub fn from_state(
        state: &SerializableState,
        current_state: impl Into<String>,
        custom_payload: serde_json::Value,
        verifier_type: VerifierType,
        streamer_lag: Duration,
        throttled: bool,
        time_taken: Duration,
    ) -> Self {
        let keys_copied: u64 = state
            .tables
            .values()
            .map(|t| t.last_successful_pagination_key)
            .sum();
        let seconds = time_taken.as_secs_f64();
        let pagination_keys_per_second = if seconds > 0.0 {
            (keys_copied as f64 / seconds) as u64
        } else {
            0
        };

        Self {
            current_state: current_state.into(),
            custom_payload,
            tables: state.tables.clone(),
            last_successful_binlog_pos: state.last_written_binlog_position.clone(),
            binlog_streamer_lag_seconds: streamer_lag.as_secs_f64(),
            throttled,
            verifier_type,
            pagination_keys_per_second,
            time_taken_seconds: seconds,
        }
    }

    /// Number of tables that still have copy work outstanding.
    pub fn tables_remaining(&self) -> usize {
        self.tables
            .values()
            .filter(|t| t.current_action != TableAction::Completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SerializableState {
        let mut state = SerializableState::default();
        state.last_written_binlog_position = BinlogPosition::new("mysql-bin.00004", 99);
        state.tables.insert(
            "shop.users".to_string(),
            TableProgress {
                last_successful_pagination_key: 500,
                target_pagination_key: 500,
                current_action: TableAction::Completed,
            },
        );
        state.tables.insert(
            "shop.orders".to_string(),
            TableProgress {
                last_successful_pagination_key: 100,
                target_pagination_key: 900,
                current_action: TableAction::Copying,
            },
        );
        state
    }

    #[test]
    fn test_progress_rollup() {
        let progress = Progress::from_state(
            &state(),
            "copying",
            serde_json::Value::Null,
            VerifierType::NoVerification,
            Duration::from_millis(1500),
            false,
            Duration::from_secs(60),
        );

        assert_eq!(progress.tables_remaining(), 1);
        assert_eq!(progress.pagination_keys_per_second, 10);
        assert_eq!(progress.binlog_streamer_lag_seconds, 1.5);
        assert_eq!(
            progress.last_successful_binlog_pos,
            BinlogPosition::new("mysql-bin.00004", 99)
        );
    }

    #[test]
    fn test_progress_serialises() {
        let progress = Progress::from_state(
            &state(),
            "done",
            serde_json::json!({"run": "shard-7"}),
            VerifierType::InlineFingerprint,
            Duration::ZERO,
            true,
            Duration::ZERO,
        );
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["current_state"], "done");
        assert_eq!(json["custom_payload"]["run"], "shard-7");
        assert_eq!(json["pagination_keys_per_second"], 0);
    }
}
