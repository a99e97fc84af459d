//! Transactional applier for bulk-copy row batches.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Pool, Transaction, TxOpts};
use tracing::debug;

use crate::config::Config;
use crate::error::FerryError;
use crate::retry::with_retries;
use crate::rewrite::{rewrite_database, rewrite_table};
use crate::row_batch::{InitRowBatch, InsertRowBatch, RowBatch};
use crate::state_tracker::StateTracker;
use crate::stmt_cache::StmtCache;
use crate::tables::QualifiedTableName;

/// Checks row fingerprints between source and target inside the write
/// transaction, returning the pagination keys of any mismatching rows.
#[async_trait]
pub trait InlineVerifier: Send + Sync {
    async fn check_fingerprint_in_tx(
        &self,
        tx: &mut Transaction<'_>,
        target_database: &str,
        target_table: &str,
        batch: &InsertRowBatch,
    ) -> Result<Vec<u64>>;
}

pub struct BatchWriter {
    pool: Pool,
    inline_verifier: Option<Arc<dyn InlineVerifier>>,
    state_tracker: Option<Arc<StateTracker>>,
    database_rewrites: HashMap<String, String>,
    table_rewrites: HashMap<String, String>,
    write_retries: usize,
    stmt_cache: StmtCache,
}

impl BatchWriter {
    pub fn new(pool: Pool, config: &Config) -> Self {
        Self {
            pool,
            inline_verifier: None,
            state_tracker: None,
            database_rewrites: config.database_rewrites.clone(),
            table_rewrites: config.table_rewrites.clone(),
            write_retries: config.write_retries,
            stmt_cache: StmtCache::new(),
        }
    }

    pub fn with_state_tracker(mut self, state_tracker: Arc<StateTracker>) -> Self {
        self.state_tracker = Some(state_tracker);
        self
    }

    pub fn with_inline_verifier(mut self, verifier: Arc<dyn InlineVerifier>) -> Self {
        self.inline_verifier = Some(verifier);
        self
    }

    /// Apply one batch atomically. On success the whole batch is committed
    /// and the state tracker reflects its terminal pagination key; on failure
    /// nothing is visible and the batch may be retried.
    ///
    /// Transient failures are retried up to the configured bound with no
    /// delay; a verification mismatch is returned as-is on the first attempt.
    pub async fn write_row_batch(&self, batch: &RowBatch) -> Result<()> {
        with_retries(self.write_retries, "write batch to target", || {
            self.write_row_batch_once(batch)
        })
        .await
    }

    async fn write_row_batch_once(&self, batch: &RowBatch) -> Result<()> {
        let source = batch.source_table();
        let database = rewrite_database(&self.database_rewrites, &source.schema_name);
        let table = rewrite_table(&self.table_rewrites, &source.table_name);

        match batch {
            RowBatch::Insert(insert) => self.write_insert_row_batch(insert, database, table).await,
            RowBatch::Init(init) => self.write_init_row_batch(init, database, table).await,
        }
    }

    async fn write_insert_row_batch(
        &self,
        batch: &InsertRowBatch,
        database: &str,
        table: &str,
    ) -> Result<()> {
        if batch.values().is_empty() {
            return Ok(());
        }
        let source = batch.table_schema().name.clone();
        let endpoints = batch.pagination_key_endpoints()?;
        let range = endpoints.map(|(s, e)| format!("{s} -> {e}")).unwrap_or_default();

        let (query, params) = batch.as_sql(database, table);
        let mut conn = self.pool.get_conn().await?;
        let stmt = self
            .stmt_cache
            .stmt_for(&mut conn, &query)
            .await
            .with_context(|| format!("during prepare near pagination key {range}"))?;

        // A transaction dropped before commit rolls back, so every early
        // return below leaves nothing behind.
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        tx.exec_drop(&stmt, params)
            .await
            .with_context(|| format!("during exec near pagination key {range}"))?;

        if let Some(verifier) = &self.inline_verifier {
            let mismatches = verifier
                .check_fingerprint_in_tx(&mut tx, database, table, batch)
                .await
                .with_context(|| format!("during fingerprint check near pagination key {range}"))?;
            check_verification(&source, mismatches)?;
        }

        tx.commit()
            .await
            .with_context(|| format!("during commit near pagination key {range}"))?;

        // State tracking is keyed by source names, not rewritten ones, and
        // only records a batch that actually committed.
        if let (Some(state_tracker), Some((_, end))) = (&self.state_tracker, endpoints) {
            state_tracker.update_last_successful_pagination_key(&source.to_string(), end);
        }
        debug!(table = %source, range, rows = batch.values().len(), "committed row batch");
        Ok(())
    }

    async fn write_init_row_batch(
        &self,
        batch: &InitRowBatch,
        database: &str,
        table: &str,
    ) -> Result<()> {
        let query = batch.as_sql(database, table);
        let mut conn = self.pool.get_conn().await?;
        let stmt = self
            .stmt_cache
            .stmt_for(&mut conn, &query)
            .await
            .with_context(|| format!("during prepare of init query ({query})"))?;

        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        tx.exec_drop(&stmt, ())
            .await
            .with_context(|| format!("during exec of init query ({query})"))?;
        tx.commit()
            .await
            .with_context(|| format!("during commit of init query ({query})"))?;
        Ok(())
    }
}

/// A non-empty mismatch list surfaces as the typed verification failure,
/// which aborts the transaction and passes through the retry wrapper
/// untouched.
fn check_verification(source: &QualifiedTableName, mismatches: Vec<u64>) -> Result<()> {
    if mismatches.is_empty() {
        return Ok(());
    }
    Err(FerryError::Verification {
        table: source.to_string(),
        pagination_keys: mismatches,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::tables::TableSchema;
    use mysql_async::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingVerifier {
        called: AtomicBool,
    }

    impl RecordingVerifier {
        fn new() -> Self {
            Self {
                called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl InlineVerifier for RecordingVerifier {
        async fn check_fingerprint_in_tx(
            &self,
            _tx: &mut Transaction<'_>,
            _target_database: &str,
            _target_table: &str,
            _batch: &InsertRowBatch,
        ) -> Result<Vec<u64>> {
            self.called.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn users_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema {
            name: QualifiedTableName::new("shop", "users"),
            columns: vec!["id".to_string(), "email".to_string()],
            pk_indices: vec![0],
            pagination_key_index: Some(0),
        })
    }

    // nothing listens on port 1, so connection attempts fail immediately
    fn unreachable_config() -> Config {
        Config {
            target: DatabaseConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ..DatabaseConfig::default()
            },
            write_retries: 2,
            ..Config::default()
        }
    }

    fn writer_against(config: &Config) -> BatchWriter {
        BatchWriter::new(Pool::new(config.target.opts()), config)
    }

    #[tokio::test]
    async fn test_empty_insert_batch_commits_trivially() {
        let config = unreachable_config();
        let state_tracker = Arc::new(StateTracker::new(config.my_server_id, None));
        let verifier = Arc::new(RecordingVerifier::new());
        let writer = writer_against(&config)
            .with_state_tracker(state_tracker.clone())
            .with_inline_verifier(verifier.clone());

        let batch = RowBatch::Insert(InsertRowBatch::new(users_schema(), Vec::new(), Some(0)));
        writer.write_row_batch(&batch).await.unwrap();

        // nothing was written, so nothing was verified or recorded
        assert!(!verifier.called.load(Ordering::SeqCst));
        assert!(state_tracker.serialize().tables.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_records_no_state() {
        let config = unreachable_config();
        let state_tracker = Arc::new(StateTracker::new(config.my_server_id, None));
        let verifier = Arc::new(RecordingVerifier::new());
        let writer = writer_against(&config)
            .with_state_tracker(state_tracker.clone())
            .with_inline_verifier(verifier.clone());

        let batch = RowBatch::Insert(InsertRowBatch::new(
            users_schema(),
            vec![vec![Value::Int(1), Value::Bytes(b"a@b.c".to_vec())]],
            Some(0),
        ));
        assert!(writer.write_row_batch(&batch).await.is_err());

        // retries were exhausted before anything committed: the tracker must
        // not have advanced and the verifier was never consulted
        assert!(state_tracker.serialize().tables.is_empty());
        assert!(!verifier.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_init_batch_failure_propagates() {
        let config = unreachable_config();
        let writer = writer_against(&config);
        let batch = RowBatch::Init(InitRowBatch::new(
            QualifiedTableName::new("shop", "users"),
            "CREATE TABLE IF NOT EXISTS `shop`.`users` (`id` BIGINT PRIMARY KEY)",
        ));
        assert!(writer.write_row_batch(&batch).await.is_err());
    }

    #[test]
    fn test_check_verification_passes_on_empty_mismatches() {
        let source = QualifiedTableName::new("shop", "users");
        check_verification(&source, Vec::new()).unwrap();
    }

    #[test]
    fn test_check_verification_carries_table_and_keys() {
        let source = QualifiedTableName::new("shop", "users");
        let error = check_verification(&source, vec![3, 9]).unwrap_err();
        match error.downcast_ref::<FerryError>() {
            Some(FerryError::Verification {
                table,
                pagination_keys,
            }) => {
                assert_eq!(table, "shop.users");
                assert_eq!(pagination_keys, &vec![3, 9]);
            }
            other => panic!("expected a verification failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verification_mismatch_is_not_retried() {
        let source = QualifiedTableName::new("shop", "users");
        let attempts = AtomicUsize::new(0);

        let result: Result<()> = with_retries(5, "verified batch write", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { check_verification(&source, vec![4]) }
        })
        .await;

        assert!(matches!(
            result.unwrap_err().downcast_ref::<FerryError>(),
            Some(FerryError::Verification { .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
