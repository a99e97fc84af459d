//! Buffered, batching applier of replication events.
//!
//! The writer owns a single consumer loop: events are batched while the
//! queue keeps producing, flushed when it idles, and DDL statements - which
//! implicitly commit in MySQL - always run as their own single-event batch.
//! Replaying DML from an earlier checkpoint is safe because every rendered
//! statement is idempotent; the schema barrier is what keeps DDL from racing
//! the bulk copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::binlog::{EventPayload, ReplicationEvent, RowChange};
use crate::config::Config;
use crate::error::{ErrorHandler, FerryError};
use crate::events::{DdlEvent, DmlEvent, DxlEvent};
use crate::filter::{CopyFilter, TableFilter};
use crate::metrics::Metrics;
use crate::query_analyzer::QueryAnalyzer;
use crate::retry::with_retries;
use crate::rewrite::{rewrite_database, rewrite_table};
use crate::state_tracker::StateTracker;
use crate::tables::{load_table_schema, QualifiedTableName, TableSchemaCache};
use crate::throttler::{wait_for_throttle, Throttler};

enum ControlSignal {
    DataIterationDone,
}

/// Runs before the wrapping transaction of the entry's batch.
#[derive(Debug, Clone)]
pub enum PreApplyCommand {
    /// Hold the event until every table has finished its bulk copy. DDL may
    /// change column lists; copying a table concurrently with its own ALTER
    /// would corrupt it.
    WaitForCopyCompletion { table: QualifiedTableName },
}

/// Runs after the entry's batch has committed.
#[derive(Debug, Clone)]
pub enum PostApplyCommand {
    /// Refresh the schema cache from the target and record the tables as
    /// fully copied, so neither a resumed run nor a concurrent iterator
    /// attempts to copy them.
    ReloadSchemaAndMarkCopied { tables: Vec<QualifiedTableName> },
}

/// An applier-ready event plus the commands surrounding its application.
#[derive(Debug, Clone)]
pub struct EventEntry {
    pub event: DxlEvent,
    pub pre_apply: Option<PreApplyCommand>,
    pub post_apply: Option<PostApplyCommand>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    Resume,
    ShuttingDown,
}

enum WriterFlow {
    Continue,
    Shutdown,
}

/// Producer-side handle: the binlog streamer enqueues events, the
/// coordinator signals copy completion and shutdown.
#[derive(Clone)]
pub struct BinlogWriterHandle {
    event_tx: mpsc::Sender<ReplicationEvent>,
    control_tx: mpsc::Sender<ControlSignal>,
    data_iterator_done: Arc<AtomicBool>,
}

impl BinlogWriterHandle {
    /// Enqueue one replication event, applying backpressure when the queue
    /// is full. Fails once the writer has shut down.
    pub async fn buffer_event(&self, event: ReplicationEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("binlog writer has shut down"))
    }

    /// Signal that the bulk-copy phase has finished. Idempotent: only the
    /// first call wakes the schema barrier.
    pub async fn data_iteration_done(&self) {
        info!("received event: data iteration is complete");
        if self.data_iterator_done.swap(true, Ordering::SeqCst) {
            debug!("data iteration completed event received before, ignored");
            return;
        }
        let _ = self.control_tx.send(ControlSignal::DataIterationDone).await;
        debug!("data iteration completion propagated to the writer");
    }

    /// Close the event queue and the control channel. The writer flushes
    /// whatever it has batched and exits its loop. The channels actually
    /// close once every clone of this handle is dropped.
    pub fn stop(self) {}
}

pub struct BinlogWriter {
    pool: Pool,
    database_rewrites: HashMap<String, String>,
    table_rewrites: HashMap<String, String>,
    batch_size: usize,
    write_retries: usize,
    apply_schema_changes: bool,
    force_resume_state_updates_to_db: bool,
    error_handler: Arc<dyn ErrorHandler>,
    state_tracker: Option<Arc<StateTracker>>,
    throttler: Option<Arc<dyn Throttler>>,
    copy_filter: Option<Arc<dyn CopyFilter>>,
    table_filter: Arc<dyn TableFilter>,
    table_schema_cache: TableSchemaCache,
    query_analyzer: QueryAnalyzer,
    metrics: Arc<Metrics>,
    event_rx: mpsc::Receiver<ReplicationEvent>,
    control_rx: mpsc::Receiver<ControlSignal>,
    data_iterator_done: Arc<AtomicBool>,
}

impl BinlogWriter {
    pub fn new(
        pool: Pool,
        config: &Config,
        table_schema_cache: TableSchemaCache,
        table_filter: Arc<dyn TableFilter>,
        error_handler: Arc<dyn ErrorHandler>,
        metrics: Arc<Metrics>,
    ) -> (Self, BinlogWriterHandle) {
        let (event_tx, event_rx) = mpsc::channel(config.binlog_batch_size.max(1));
        // one control event is defined today; the buffer holds exactly it
        let (control_tx, control_rx) = mpsc::channel(1);
        let data_iterator_done = Arc::new(AtomicBool::new(false));

        let handle = BinlogWriterHandle {
            event_tx,
            control_tx,
            data_iterator_done: data_iterator_done.clone(),
        };
        let writer = Self {
            pool,
            database_rewrites: config.database_rewrites.clone(),
            table_rewrites: config.table_rewrites.clone(),
            batch_size: config.binlog_batch_size.max(1),
            write_retries: config.write_retries,
            apply_schema_changes: config.apply_schema_changes,
            force_resume_state_updates_to_db: config.force_resume_state_updates_to_db,
            error_handler,
            state_tracker: None,
            throttler: None,
            copy_filter: None,
            table_filter,
            table_schema_cache,
            query_analyzer: QueryAnalyzer::new(),
            metrics,
            event_rx,
            control_rx,
            data_iterator_done,
        };
        (writer, handle)
    }

    pub fn with_state_tracker(mut self, state_tracker: Arc<StateTracker>) -> Self {
        self.state_tracker = Some(state_tracker);
        self
    }

    pub fn with_copy_filter(mut self, copy_filter: Arc<dyn CopyFilter>) -> Self {
        self.copy_filter = Some(copy_filter);
        self
    }

    pub fn with_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Consume the event queue until it closes, then flush and return.
    pub async fn run(mut self) {
        let mut batch: Vec<EventEntry> = Vec::with_capacity(self.batch_size);
        loop {
            let event = if batch.is_empty() {
                // nothing pending: block for the next event
                match self.event_rx.recv().await {
                    Some(event) => event,
                    None => {
                        debug!("binlog queue closed");
                        break;
                    }
                }
            } else {
                // batch pending: only take more work if it is already there
                match self.event_rx.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => {
                        debug!(size = batch.len(), "flushing batch on idle queue");
                        match self.apply_batch(&mut batch).await {
                            WriterFlow::Continue => continue,
                            WriterFlow::Shutdown => return,
                        }
                    }
                    Err(TryRecvError::Disconnected) => {
                        debug!("binlog queue closed");
                        break;
                    }
                }
            };

            let entries = match self.translate_replication_event(&event) {
                Ok(entries) => entries,
                Err(error) => {
                    self.error_handler.fatal("binlog_writer", &error);
                    return;
                }
            };

            for entry in entries {
                if !batch.is_empty() && entry.event.is_auto_transaction() {
                    debug!(size = batch.len(), "flushing batch ahead of auto-transaction statement");
                    if let WriterFlow::Shutdown = self.apply_batch(&mut batch).await {
                        return;
                    }
                }
                batch.push(entry);
                if batch.len() >= self.batch_size {
                    debug!(size = batch.len(), "flushing full batch");
                    if let WriterFlow::Shutdown = self.apply_batch(&mut batch).await {
                        return;
                    }
                }
            }
        }

        let _ = self.apply_batch(&mut batch).await;
    }

    /// Translate one replication event into zero or more applier entries.
    pub fn translate_replication_event(
        &self,
        event: &ReplicationEvent,
    ) -> Result<Vec<EventEntry>> {
        match &event.payload {
            EventPayload::Rows { table, changes } => self.translate_rows_event(event, table, changes),
            EventPayload::Query { schema, query } => self.translate_query_event(event, schema, query),
            EventPayload::Unsupported { kind } => Err(FerryError::UnsupportedEvent {
                kind: kind.clone(),
                position: event.position.clone(),
            }
            .into()),
        }
    }

    fn translate_rows_event(
        &self,
        event: &ReplicationEvent,
        table: &QualifiedTableName,
        changes: &[RowChange],
    ) -> Result<Vec<EventEntry>> {
        // tables outside the run have no cache entry and are dropped silently
        let Some(schema) = self.table_schema_cache.get(table) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(changes.len());
        for change in changes {
            let dml = DmlEvent {
                table: schema.clone(),
                position: event.position.clone(),
                event_time: event.event_time,
                change: change.clone(),
            };
            if let Some(filter) = &self.copy_filter {
                if !filter.applicable_dml_event(&dml)? {
                    continue;
                }
            }
            debug!(database = %table.schema_name, table = %table.table_name, "received row event");
            self.metrics.count("RowEvent", &table.table_name);
            entries.push(EventEntry {
                event: DxlEvent::Dml(dml),
                pre_apply: None,
                post_apply: None,
            });
        }
        Ok(entries)
    }

    fn translate_query_event(
        &self,
        event: &ReplicationEvent,
        current_schema: &str,
        query: &str,
    ) -> Result<Vec<EventEntry>> {
        let schema_changes = self
            .query_analyzer
            .parse_schema_changes(query, current_schema)?;

        let mut applicable_changes = Vec::new();
        let mut tables_to_reload = Vec::new();
        for change in schema_changes {
            if !self.apply_schema_changes {
                warn!(table = %change.affected_table, "ignoring schema event: schema change application disabled");
                return Ok(Vec::new());
            }

            let applicable = self
                .table_filter
                .applicable_databases(std::slice::from_ref(&change.affected_table.schema_name))?;
            if applicable.is_empty() {
                info!(table = %change.affected_table, "ignoring schema change: not an applicable database");
                continue;
            }

            if change.is_schema_change {
                // After a drop there is nothing to re-read; a rename is
                // re-read under its new name. The old entry is left in the
                // cache either way.
                let table_to_reload = if change.deleted_table.is_none() {
                    Some(change.affected_table.clone())
                } else {
                    change.created_table.clone()
                };
                if let Some(table) = table_to_reload {
                    tables_to_reload.push(table);
                }
            }
            applicable_changes.push(change);
        }

        let mut entries = Vec::with_capacity(applicable_changes.len());
        for change in applicable_changes {
            debug!(database = %change.affected_table.schema_name, table = %change.affected_table.table_name, "received schema event");
            self.metrics
                .count("SchemaEvent", &change.affected_table.table_name);
            entries.push(EventEntry {
                event: DxlEvent::Ddl(DdlEvent {
                    table: change.affected_table.clone(),
                    position: event.position.clone(),
                    event_time: event.event_time,
                    statement: change.statement,
                }),
                pre_apply: Some(PreApplyCommand::WaitForCopyCompletion {
                    table: change.affected_table,
                }),
                post_apply: Some(PostApplyCommand::ReloadSchemaAndMarkCopied {
                    tables: tables_to_reload.clone(),
                }),
            });
        }
        Ok(entries)
    }

    async fn apply_batch(&mut self, batch: &mut Vec<EventEntry>) -> WriterFlow {
        if batch.is_empty() {
            return WriterFlow::Continue;
        }

        for entry in batch.iter() {
            if let Some(PreApplyCommand::WaitForCopyCompletion { table }) = &entry.pre_apply {
                match self.wait_until_copy_phase_completed(table).await {
                    BarrierOutcome::Resume => {}
                    BarrierOutcome::ShuttingDown => {
                        // the held-back statement is dropped; a resumed run
                        // replays it from the checkpointed position
                        batch.clear();
                        return WriterFlow::Shutdown;
                    }
                }
            }
        }

        let result = with_retries(self.write_retries, "write events to target", || {
            self.write_events(batch)
        })
        .await;
        if let Err(error) = result {
            self.error_handler.fatal("binlog_writer", &error);
            batch.clear();
            return WriterFlow::Shutdown;
        }

        for entry in batch.drain(..) {
            if let Some(PostApplyCommand::ReloadSchemaAndMarkCopied { tables }) = entry.post_apply {
                for table in &tables {
                    if let Err(error) = self.reload_table_schema(table).await {
                        self.error_handler.fatal("binlog_writer", &error);
                        return WriterFlow::Shutdown;
                    }
                    if let Err(error) = self.mark_table_as_copied(table).await {
                        self.error_handler.fatal("binlog_writer", &error);
                        return WriterFlow::Shutdown;
                    }
                }
            }
        }
        WriterFlow::Continue
    }

    /// The schema barrier: no DDL applies before every table has finished
    /// its bulk copy.
    pub async fn wait_until_copy_phase_completed(
        &mut self,
        table: &QualifiedTableName,
    ) -> BarrierOutcome {
        if self.data_iterator_done.load(Ordering::SeqCst) {
            return BarrierOutcome::Resume;
        }
        info!(table = %table, "blocking schema change until the copy phase completes");
        match self.control_rx.recv().await {
            Some(ControlSignal::DataIterationDone) => {
                info!(table = %table, "resuming schema change: copy phase complete");
                BarrierOutcome::Resume
            }
            None => {
                debug!(table = %table, "shutdown while waiting on the schema barrier");
                BarrierOutcome::ShuttingDown
            }
        }
    }

    /// Apply one batch as a single `BEGIN; ...; COMMIT` blob against the
    /// target, appending the binlog-position checkpoint when configured.
    async fn write_events(&self, events: &[EventEntry]) -> Result<()> {
        let Some(last) = events.last() else {
            return Ok(());
        };
        wait_for_throttle(self.throttler.as_deref()).await;

        let mut query = String::from("BEGIN;\n");
        for entry in events {
            let database = rewrite_database(&self.database_rewrites, entry.event.database());
            let table = rewrite_table(&self.table_rewrites, entry.event.table());
            let sql = entry
                .event
                .to_sql(database, table)
                .with_context(|| format!("generating sql query at {}", entry.event.binlog_position()))?;
            query.push_str(&sql);
            query.push_str(";\n");
        }

        if self.force_resume_state_updates_to_db {
            if let Some(state_tracker) = &self.state_tracker {
                // A failure to generate the checkpoint SQL must not abort
                // the batch commit; the checkpoint simply lags behind.
                if let Ok(Some(sql)) = state_tracker.store_binlog_writer_position_sql(
                    last.event.binlog_position(),
                    last.event.event_time(),
                ) {
                    query.push_str(&sql);
                    query.push_str(";\n");
                }
            }
        }
        query.push_str("COMMIT");

        let first_position = events[0].event.binlog_position().clone();
        let last_position = last.event.binlog_position().clone();
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(&query).await.with_context(|| {
            format!(
                "exec query at {first_position} -> {last_position} ({} bytes)",
                query.len()
            )
        })?;

        if let Some(state_tracker) = &self.state_tracker {
            state_tracker.update_last_written_binlog_position(last_position);
        }
        Ok(())
    }

    async fn reload_table_schema(&self, table: &QualifiedTableName) -> Result<()> {
        info!(table = %table, "re-loading table schema from the target");
        let target = QualifiedTableName::new(
            rewrite_database(&self.database_rewrites, &table.schema_name),
            rewrite_table(&self.table_rewrites, &table.table_name),
        );
        let mut conn = self.pool.get_conn().await?;
        let mut schema = load_table_schema(&mut conn, &target).await?;
        // the cache is keyed by source names regardless of rewrites
        schema.name = table.clone();
        self.table_schema_cache.insert(schema);
        Ok(())
    }

    async fn mark_table_as_copied(&self, table: &QualifiedTableName) -> Result<()> {
        let Some(state_tracker) = &self.state_tracker else {
            return Ok(());
        };
        info!(table = %table, "recording table as fully copied");
        match state_tracker.store_row_copy_done_sql(&table.to_string())? {
            None => debug!("skip applying copy-done statement: state writer opt-out"),
            Some(sql) => {
                let mut conn = self.pool.get_conn().await?;
                conn.query_drop(sql)
                    .await
                    .with_context(|| format!("applying copy-done statement for {table}"))?;
            }
        }
        state_tracker.mark_table_as_completed(&table.to_string());
        Ok(())
    }
}
