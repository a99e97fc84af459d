//! End-to-end run orchestration for a replication-mode ferry.
//!
//! The coordinator starts the bulk copy and the binlog stream in parallel,
//! waits for the copy to finish and the stream to catch up, then walks the
//! cutover sequence: lock source writes through the external endpoint, drain
//! the binlog, re-copy the joined tables, unlock. With cutover disabled the
//! run streams continuously until the streamer is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::batch_writer::BatchWriter;
use crate::binlog_writer::{BinlogWriter, BinlogWriterHandle};
use crate::config::{Config, HttpCallbackConfig};
use crate::error::{ErrorHandler, FerryError};
use crate::metrics::Metrics;
use crate::progress::Progress;
use crate::row_batch::RowBatch;
use crate::state_tracker::StateTracker;
use crate::tables::{QualifiedTableName, TableSchemaCache};
use crate::throttler::Throttler;

const BINLOG_CAUGHT_UP_LAG: Duration = Duration::from_secs(1);
const CATCH_UP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where the run currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    CopyingAndStreaming,
    RowCopyComplete,
    BinlogCaughtUp,
    SourceLocked,
    BinlogFlushed,
    SourceUnlocked,
    Done,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Initializing => "initializing",
            RunState::CopyingAndStreaming => "copying",
            RunState::RowCopyComplete => "row_copy_complete",
            RunState::BinlogCaughtUp => "binlog_caught_up",
            RunState::SourceLocked => "source_locked",
            RunState::BinlogFlushed => "binlog_flushed",
            RunState::SourceUnlocked => "source_unlocked",
            RunState::Done => "done",
        }
    }
}

/// Produces paginated row batches for the bulk-copy phase. External to this
/// crate; the pagination strategy is its concern.
#[async_trait]
pub trait DataIterator: Send + Sync {
    /// Stream batches for every table in the run, returning once each table
    /// has reached its target pagination key.
    async fn run(&self, batches: mpsc::Sender<RowBatch>) -> Result<()>;

    /// Re-copy the given tables from scratch. Used for joined tables while
    /// the source is locked.
    async fn copy_tables(
        &self,
        tables: &[QualifiedTableName],
        batches: mpsc::Sender<RowBatch>,
    ) -> Result<()>;
}

/// Reads the source binlog and feeds the writer. External to this crate.
#[async_trait]
pub trait BinlogStreamer: Send + Sync {
    /// Stream replication events into the writer until stopped.
    async fn run(&self, writer: BinlogWriterHandle) -> Result<()>;

    /// Stop reading after the current event; `run` returns once the last
    /// read event has been handed to the writer.
    fn request_stop(&self);

    /// How far behind the source the streamer currently is.
    fn lag(&self) -> Duration;
}

/// POST to an external callback endpoint. Non-2xx responses and transport
/// errors are failures.
pub async fn post_callback(
    client: &reqwest::Client,
    callback: &HttpCallbackConfig,
) -> Result<()> {
    let response = client
        .post(&callback.uri)
        .json(&callback.payload)
        .send()
        .await
        .map_err(|e| FerryError::Cutover {
            url: callback.uri.clone(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FerryError::Cutover {
            url: callback.uri.clone(),
            reason: format!("status {status}: {body}"),
        }
        .into());
    }
    Ok(())
}

pub struct CutoverCoordinator {
    config: Config,
    state_tracker: Arc<StateTracker>,
    table_schema_cache: TableSchemaCache,
    batch_writer: Arc<BatchWriter>,
    binlog_writer: Option<BinlogWriter>,
    writer_handle: Option<BinlogWriterHandle>,
    data_iterator: Arc<dyn DataIterator>,
    binlog_streamer: Arc<dyn BinlogStreamer>,
    error_handler: Arc<dyn ErrorHandler>,
    throttler: Option<Arc<dyn Throttler>>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
    run_state: Mutex<RunState>,
}

impl CutoverCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        state_tracker: Arc<StateTracker>,
        table_schema_cache: TableSchemaCache,
        batch_writer: Arc<BatchWriter>,
        binlog_writer: BinlogWriter,
        writer_handle: BinlogWriterHandle,
        data_iterator: Arc<dyn DataIterator>,
        binlog_streamer: Arc<dyn BinlogStreamer>,
        error_handler: Arc<dyn ErrorHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            state_tracker,
            table_schema_cache,
            batch_writer,
            binlog_writer: Some(binlog_writer),
            writer_handle: Some(writer_handle),
            data_iterator,
            binlog_streamer,
            error_handler,
            throttler: None,
            metrics,
            http: reqwest::Client::new(),
            run_state: Mutex::new(RunState::Initializing),
        }
    }

    pub fn with_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    pub fn current_state(&self) -> RunState {
        self.run_state
            .lock()
            .map(|state| *state)
            .unwrap_or(RunState::Initializing)
    }

    /// Drive the run to completion. Lock/unlock and delta-copy failures are
    /// fatal and also returned to the caller.
    pub async fn run(mut self) -> Result<()> {
        let started = Instant::now();
        let writer = self
            .binlog_writer
            .take()
            .context("coordinator has already run")?;
        let handle = self
            .writer_handle
            .take()
            .context("coordinator has already run")?;

        self.set_state(RunState::CopyingAndStreaming, started).await;
        let writer_task = tokio::spawn(writer.run());
        let streamer = self.binlog_streamer.clone();
        let streamer_handle = handle.clone();
        let streamer_task = tokio::spawn(async move { streamer.run(streamer_handle).await });

        let copy_result = self.metrics.measure("RowCopy", self.run_copy_phase()).await;
        if let Err(e) = copy_result {
            error!(error = %format!("{e:#}"), "bulk copy failed, aborting run");
            self.error_handler.fatal("coordinator", &e);
            return Err(e);
        }
        self.set_state(RunState::RowCopyComplete, started).await;
        handle.data_iteration_done().await;

        self.wait_until_binlog_caught_up().await;
        self.set_state(RunState::BinlogCaughtUp, started).await;

        if self.config.disable_cutover {
            info!("cutover disabled: streaming continuously until the streamer stops");
            if let Err(e) = join_task(streamer_task, "binlog streamer").await {
                self.error_handler.fatal("binlog_streamer", &e);
                return Err(e);
            }
            handle.stop();
            writer_task
                .await
                .map_err(|e| anyhow!("binlog writer task panicked: {e}"))?;
            self.set_state(RunState::Done, started).await;
            return Ok(());
        }

        let cutover_started = Instant::now();

        if let Some(callback) = self.config.cutover_lock.clone() {
            // The endpoint must ensure in-flight source transactions finish
            // and no further writes happen once it responds.
            let result = self
                .metrics
                .measure("CutoverLock", post_callback(&self.http, &callback))
                .await;
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "locking failed, aborting run");
                self.error_handler.fatal("coordinator", &e);
                return Err(e);
            }
        }
        self.set_state(RunState::SourceLocked, started).await;

        self.binlog_streamer.request_stop();
        if let Err(e) = join_task(streamer_task, "binlog streamer").await {
            self.error_handler.fatal("binlog_streamer", &e);
            return Err(e);
        }
        handle.stop();
        writer_task
            .await
            .map_err(|e| anyhow!("binlog writer task panicked: {e}"))?;
        self.set_state(RunState::BinlogFlushed, started).await;

        let delta_result = self
            .metrics
            .measure("DeltaCopyJoinedTables", self.delta_copy_joined_tables())
            .await;
        if let Err(e) = delta_result {
            error!(error = %format!("{e:#}"), "failed to delta-copy joined tables after locking");
            self.error_handler.fatal("coordinator", &e);
            return Err(e);
        }

        if let Some(callback) = self.config.cutover_unlock.clone() {
            let result = self
                .metrics
                .measure("CutoverUnlock", post_callback(&self.http, &callback))
                .await;
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "unlocking failed, aborting run");
                self.error_handler.fatal("coordinator", &e);
                return Err(e);
            }
        }
        self.set_state(RunState::SourceUnlocked, started).await;

        self.metrics
            .record_duration("CutoverTime", cutover_started.elapsed());
        self.set_state(RunState::Done, started).await;
        Ok(())
    }

    async fn run_copy_phase(&self) -> Result<()> {
        let (batch_tx, batch_rx) = mpsc::channel(self.config.binlog_batch_size.max(1));
        let workers = self.spawn_batch_writers(batch_rx);
        let iterator_result = self.data_iterator.run(batch_tx).await;
        for worker in workers {
            worker
                .await
                .map_err(|e| anyhow!("batch writer task panicked: {e}"))??;
        }
        iterator_result
    }

    async fn delta_copy_joined_tables(&self) -> Result<()> {
        let joined: Vec<QualifiedTableName> = self
            .table_schema_cache
            .known_tables()
            .into_iter()
            .filter(|table| self.config.joined_tables.contains(&table.table_name))
            .collect();
        if joined.is_empty() {
            debug!("no joined tables to delta-copy");
            return Ok(());
        }
        info!(tables = joined.len(), "delta-copying joined tables under the source lock");

        let (batch_tx, batch_rx) = mpsc::channel(self.config.binlog_batch_size.max(1));
        let workers = self.spawn_batch_writers(batch_rx);
        let iterator_result = self.data_iterator.copy_tables(&joined, batch_tx).await;
        for worker in workers {
            worker
                .await
                .map_err(|e| anyhow!("batch writer task panicked: {e}"))??;
        }
        iterator_result
    }

    fn spawn_batch_writers(
        &self,
        batch_rx: mpsc::Receiver<RowBatch>,
    ) -> Vec<JoinHandle<Result<()>>> {
        let shared_rx = Arc::new(AsyncMutex::new(batch_rx));
        (0..self.config.data_iteration_concurrency.max(1))
            .map(|_| {
                let rx = shared_rx.clone();
                let writer = self.batch_writer.clone();
                tokio::spawn(async move {
                    loop {
                        // hold the lock only while dequeuing so the lanes
                        // actually write concurrently
                        let batch = { rx.lock().await.recv().await };
                        match batch {
                            Some(batch) => writer.write_row_batch(&batch).await?,
                            None => return Ok(()),
                        }
                    }
                })
            })
            .collect()
    }

    async fn wait_until_binlog_caught_up(&self) {
        loop {
            let lag = self.binlog_streamer.lag();
            if lag <= BINLOG_CAUGHT_UP_LAG {
                return;
            }
            debug!(lag_seconds = lag.as_secs_f64(), "waiting for binlog streamer to catch up");
            sleep(CATCH_UP_POLL_INTERVAL).await;
        }
    }

    async fn set_state(&self, state: RunState, started: Instant) {
        info!(state = state.as_str(), "run state changed");
        if let Ok(mut current) = self.run_state.lock() {
            *current = state;
        }
        self.report_progress(state, started).await;
    }

    async fn report_progress(&self, state: RunState, started: Instant) {
        let Some(callback) = &self.config.progress_callback else {
            return;
        };
        let throttled = self
            .throttler
            .as_ref()
            .map(|t| t.throttled())
            .unwrap_or(false);
        let progress = Progress::from_state(
            &self.state_tracker.serialize(),
            state.as_str(),
            callback.payload.clone(),
            self.config.verifier_type,
            self.binlog_streamer.lag(),
            throttled,
            started.elapsed(),
        );
        let payload = match serde_json::to_value(&progress) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialise progress");
                return;
            }
        };
        let request = HttpCallbackConfig {
            uri: callback.uri.clone(),
            payload,
        };
        // progress is advisory; a failed report never aborts the run
        if let Err(e) = post_callback(&self.http, &request).await {
            warn!(error = %format!("{e:#}"), "progress callback failed");
        }
    }
}

async fn join_task(task: JoinHandle<Result<()>>, name: &str) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(join_error) => Err(anyhow!("{name} task panicked: {join_error}")),
    }
}

/// Streamer stub that idles until stopped. Useful for wiring tests and for
/// runs that replay from a pre-recorded queue.
pub struct IdleBinlogStreamer {
    stopped: AtomicBool,
}

impl IdleBinlogStreamer {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
        }
    }
}

impl Default for IdleBinlogStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BinlogStreamer for IdleBinlogStreamer {
    async fn run(&self, _writer: BinlogWriterHandle) -> Result<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn lag(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog_writer::BinlogWriter;
    use crate::config::DatabaseConfig;
    use crate::error::CollectingErrorHandler;
    use crate::filter::ShardedTableFilter;
    use std::collections::HashSet;

    struct EmptyIterator;

    #[async_trait]
    impl DataIterator for EmptyIterator {
        async fn run(&self, _batches: mpsc::Sender<RowBatch>) -> Result<()> {
            Ok(())
        }

        async fn copy_tables(
            &self,
            _tables: &[QualifiedTableName],
            _batches: mpsc::Sender<RowBatch>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn streaming_coordinator() -> (
        CutoverCoordinator,
        Arc<IdleBinlogStreamer>,
        Arc<CollectingErrorHandler>,
        Arc<Metrics>,
    ) {
        let mut config = Config {
            disable_cutover: true,
            replicate_schema_changes: true,
            ..Config::default()
        };
        config.validate().unwrap();

        let pool = mysql_async::Pool::new(DatabaseConfig::default().opts());
        let cache = TableSchemaCache::new();
        let error_handler = Arc::new(CollectingErrorHandler::new());
        let metrics = Arc::new(Metrics::new());
        let state_tracker = Arc::new(StateTracker::new(config.my_server_id, None));
        let table_filter = Arc::new(ShardedTableFilter {
            source_shard: "shop".to_string(),
            sharding_key: "id".to_string(),
            joined_tables: HashSet::new(),
            primary_key_tables: HashSet::new(),
            ignored_tables: vec![],
        });

        let (binlog_writer, writer_handle) = BinlogWriter::new(
            pool.clone(),
            &config,
            cache.clone(),
            table_filter,
            error_handler.clone(),
            metrics.clone(),
        );
        let batch_writer = Arc::new(BatchWriter::new(pool, &config));
        let streamer = Arc::new(IdleBinlogStreamer::new());

        let coordinator = CutoverCoordinator::new(
            config,
            state_tracker,
            cache,
            batch_writer,
            binlog_writer,
            writer_handle,
            Arc::new(EmptyIterator),
            streamer.clone(),
            error_handler.clone(),
            metrics.clone(),
        );
        (coordinator, streamer, error_handler, metrics)
    }

    #[tokio::test]
    async fn test_continuous_streaming_run_completes_when_streamer_stops() {
        let (coordinator, streamer, error_handler, metrics) = streaming_coordinator();

        let run = tokio::spawn(coordinator.run());
        sleep(Duration::from_millis(100)).await;
        streamer.request_stop();

        run.await.unwrap().unwrap();
        assert!(error_handler.is_empty(), "{:?}", error_handler.errors());
        assert!(metrics.duration("RowCopy").is_some());
    }

    #[tokio::test]
    async fn test_post_callback_rejects_unreachable_endpoint() {
        let client = reqwest::Client::new();
        let callback = HttpCallbackConfig {
            uri: "http://127.0.0.1:1/unlock".to_string(),
            payload: serde_json::Value::Null,
        };
        let error = post_callback(&client, &callback).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<FerryError>(),
            Some(FerryError::Cutover { .. })
        ));
    }
}
