//! ghostferry - live MySQL-to-MySQL data migration.
//!
//! The engine moves a database (or one shard of it) to a new target without
//! stopping source writes, in two concurrent phases:
//!
//! - an iterative bulk copy of existing rows, applied transactionally by
//!   [`batch_writer::BatchWriter`], and
//! - a continuous replay of the source binlog, applied in batches by
//!   [`binlog_writer::BinlogWriter`].
//!
//! DML replay is idempotent, so the two phases may overlap freely; schema
//! changes are serialised behind a barrier that waits for bulk-copy
//! completion. The [`cutover::CutoverCoordinator`] sequences the endgame:
//! source lock, binlog drain, delta re-copy of joined tables, unlock.
//!
//! Reading the source binlog and paginating source rows are the business of
//! external collaborators (see [`cutover::BinlogStreamer`] and
//! [`cutover::DataIterator`]); this crate is the applier and the coordinator.

pub mod batch_writer;
pub mod binlog;
pub mod binlog_writer;
pub mod config;
pub mod cutover;
pub mod error;
pub mod events;
pub mod filter;
pub mod metrics;
pub mod progress;
pub mod query_analyzer;
pub mod retry;
pub mod rewrite;
pub mod row_batch;
pub mod state_tracker;
pub mod stmt_cache;
pub mod tables;
pub mod throttler;

pub use batch_writer::{BatchWriter, InlineVerifier};
pub use binlog::{BinlogPosition, EventPayload, ReplicationEvent, RowChange};
pub use binlog_writer::{BinlogWriter, BinlogWriterHandle};
pub use config::{Config, DatabaseConfig, VerifierType};
pub use cutover::{BinlogStreamer, CutoverCoordinator, DataIterator, RunState};
pub use error::{ErrorHandler, FerryError};
pub use events::{DdlEvent, DmlEvent, DxlEvent};
pub use query_analyzer::{QueryAnalyzer, SchemaChange};
pub use row_batch::{InitRowBatch, InsertRowBatch, RowBatch};
pub use state_tracker::{SerializableState, StateTracker, TableAction, TableProgress};
pub use tables::{QualifiedTableName, TableSchema, TableSchemaCache};
