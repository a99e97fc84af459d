//! Resume-state preflight for a migration run.
//!
//! Loads and validates a run configuration, connects to the target, creates
//! the state schema if needed, and reports the safe binlog position and
//! per-table copy progress a run would resume from.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use tracing_subscriber::EnvFilter;

use ghostferry::rewrite::rewrite_database;
use ghostferry::state_tracker::StateTracker;
use ghostferry::tables::{load_table_schema, QualifiedTableName, TableSchemaCache};
use ghostferry::Config;

#[derive(Parser)]
#[command(name = "ghostferry")]
#[command(about = "Validate a migration config and inspect the resume state on the target")]
struct Cli {
    /// Path to the JSON run configuration
    config: PathBuf,

    /// Show verbose logging output
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("ghostferry=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let mut config: Config =
        serde_json::from_str(&raw).context("parsing config file")?;
    config.validate().context("validating config")?;

    tracing::info!(
        source = %config.source.host,
        target = %config.target.host,
        server_id = config.my_server_id,
        "configuration is valid"
    );

    let pool = Pool::new(config.target.opts());
    let cache = load_run_tables(&pool, &config).await?;
    tracing::info!(tables = cache.len(), "loaded table schemas from the target");

    let (_tracker, state) = StateTracker::from_target_db(&pool, &config, &cache).await?;
    tracing::info!(
        resume_position = %state.min_binlog_position(),
        tables_with_state = state.tables.len(),
        "resume state loaded"
    );
    for (table, progress) in &state.tables {
        tracing::info!(
            table,
            action = ?progress.current_action,
            last_pagination_key = progress.last_successful_pagination_key,
            "table progress"
        );
    }

    pool.disconnect().await?;
    Ok(())
}

/// Discover the run's tables on the target (under rewritten names) and cache
/// their schemas under source names, the way the appliers expect them.
async fn load_run_tables(pool: &Pool, config: &Config) -> Result<TableSchemaCache> {
    let cache = TableSchemaCache::new();
    let Some(source_db) = &config.source.database else {
        return Ok(cache);
    };
    let target_db = rewrite_database(&config.database_rewrites, source_db).to_string();

    let mut conn = pool.get_conn().await.context("connecting to target")?;
    let tables: Vec<String> = conn
        .exec(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
            (target_db.as_str(),),
        )
        .await?;

    for table in tables {
        let target = QualifiedTableName::new(target_db.clone(), table.clone());
        let mut schema = load_table_schema(&mut conn, &target).await?;
        schema.name = QualifiedTableName::new(source_db.clone(), table);
        cache.insert(schema);
    }
    Ok(cache)
}
