//! Run configuration, deserialised from JSON.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Connection parameters for one side of the migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "ghostferry".to_string(),
            password: None,
            database: None,
        }
    }
}

impl DatabaseConfig {
    pub fn opts(&self) -> mysql_async::Opts {
        let mut builder = mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(self.password.clone());
        if let Some(database) = &self.database {
            builder = builder.db_name(Some(database.clone()));
        }
        builder.into()
    }
}

/// An external HTTP endpoint invoked at cutover or for progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallbackConfig {
    pub uri: String,
    /// Forwarded verbatim as the request body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// How copied rows are verified against the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VerifierType {
    #[default]
    NoVerification,
    InlineFingerprint,
}

/// Operator pause switch applied before every binlog batch write.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub start_paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,

    /// Used in the state-table name prefix; must be unique among concurrent
    /// runs against the same target.
    pub my_server_id: u32,

    /// Source database name -> target database name.
    pub database_rewrites: HashMap<String, String>,
    /// Source table name -> target table name.
    pub table_rewrites: HashMap<String, String>,

    pub write_retries: usize,
    /// Capacity of the binlog event queue and size of the DML batches.
    pub binlog_batch_size: usize,
    /// Number of concurrent batch-writer lanes during the copy phase.
    pub data_iteration_concurrency: usize,

    pub apply_schema_changes: bool,
    pub replicate_schema_changes: bool,
    pub disable_cutover: bool,

    /// Append the binlog-position checkpoint to each of the binlog writer's
    /// batch transactions.
    pub force_resume_state_updates_to_db: bool,
    /// Schema on the target holding the state tables; `None` disables
    /// database-backed resume.
    pub resume_state_from_db: Option<String>,

    /// Tables re-copied in full while the source is locked at cutover.
    pub joined_tables: HashSet<String>,
    /// Tables whose sharding value is their own primary key.
    pub primary_key_tables: HashSet<String>,
    /// Regexes of fully-qualified table names excluded from the run.
    pub ignored_tables: Vec<String>,

    pub verifier_type: VerifierType,
    pub throttle: Option<ThrottleConfig>,

    /// Column that carries the shard identity, for sharded runs.
    pub sharding_key: Option<String>,
    pub sharding_value: Option<u64>,

    pub cutover_lock: Option<HttpCallbackConfig>,
    pub cutover_unlock: Option<HttpCallbackConfig>,
    pub progress_callback: Option<HttpCallbackConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: DatabaseConfig::default(),
            target: DatabaseConfig::default(),
            my_server_id: 99399,
            database_rewrites: HashMap::new(),
            table_rewrites: HashMap::new(),
            write_retries: 5,
            binlog_batch_size: 100,
            data_iteration_concurrency: 4,
            apply_schema_changes: false,
            replicate_schema_changes: false,
            disable_cutover: false,
            force_resume_state_updates_to_db: false,
            resume_state_from_db: None,
            joined_tables: HashSet::new(),
            primary_key_tables: HashSet::new(),
            ignored_tables: Vec::new(),
            verifier_type: VerifierType::NoVerification,
            throttle: None,
            sharding_key: None,
            sharding_value: None,
            cutover_lock: None,
            cutover_unlock: None,
            progress_callback: None,
        }
    }
}

impl Config {
    /// Fill derived defaults and reject inconsistent combinations.
    pub fn validate(&mut self) -> Result<()> {
        if self.my_server_id == 0 {
            bail!("my_server_id must be non-zero");
        }
        if self.binlog_batch_size == 0 {
            bail!("binlog_batch_size must be at least 1");
        }
        if self.write_retries == 0 {
            self.write_retries = 1;
        }
        if self.data_iteration_concurrency == 0 {
            self.data_iteration_concurrency = 1;
        }

        // Replicating schema changes only makes sense if we also apply them.
        if self.replicate_schema_changes {
            self.apply_schema_changes = true;
        }

        if self.force_resume_state_updates_to_db && self.resume_state_from_db.is_none() {
            bail!("force_resume_state_updates_to_db requires resume_state_from_db");
        }

        if self.sharding_key.is_some() != self.sharding_value.is_some() {
            bail!("sharding_key and sharding_value must be configured together");
        }

        for pattern in &self.ignored_tables {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid ignored_tables pattern {pattern:?}: {e}"))?;
        }

        if !self.disable_cutover && (self.cutover_lock.is_none() || self.cutover_unlock.is_none()) {
            bail!("cutover requires both cutover_lock and cutover_unlock endpoints");
        }

        Ok(())
    }

    pub fn compiled_ignored_tables(&self) -> Result<Vec<regex::Regex>> {
        self.ignored_tables
            .iter()
            .map(|pattern| {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("invalid ignored_tables pattern {pattern:?}: {e}"))
            })
            .collect()
    }
}
