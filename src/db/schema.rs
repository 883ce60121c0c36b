//! Schema lifecycle: schema creation, migrations and stream partitions.
//!
//! # Architecture
//!
//! Storage is initialized in four ordered steps, each a separate unit of work:
//!
//! 1. `createSchema` transaction creates the node's schema if it is missing.
//! 2. An optional caller-supplied `preMigrationTx` transaction.
//! 3. Embedded migrations, applied on a dedicated single-connection pool.
//! 4. `initPartitions` transaction fixes the partition count and creates the
//!    partition tables.
//!
//! Initialization must finish before the store is handed to callers.
//! Concurrent node startups are serialized by the advisory lock sqlx takes
//! while migrating.

use crate::db::pool::PoolInfo;
use crate::db::runner::{TxOpts, TxRunner};
use crate::db::types::AccessMode;
use crate::error::{StoreError, StoreResult};
use futures_util::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::migrate::{Migrate, Migrator};
use sqlx::postgres::{PgConnection, PgPool};
use std::collections::HashSet;
use tracing::{info, warn};

/// Migrations embedded from `migrations/`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Work run once before migrations, inside its own read-write transaction.
pub type PreMigrationTx =
    Box<dyn for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<()>> + Send>;

/// Outcome of [`init_storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageInit {
    /// Migration scripts applied by this run. 0 when the schema was up to date.
    pub applied_migrations: usize,
    /// Partition count stored in the database.
    pub num_partitions: i32,
}

mod queries {
    pub const SCHEMA_EXISTS: &str =
        "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)";

    pub const INSERT_SETTINGS: &str = "INSERT INTO settings (single_row_key, num_partitions) \
         VALUES (true, $1) ON CONFLICT (single_row_key) DO NOTHING";

    pub const SELECT_NUM_PARTITIONS: &str =
        "SELECT num_partitions FROM settings WHERE single_row_key = true";
}

/// Create the schema, run migrations and set up partitions.
///
/// Any failure aborts initialization; the returned error carries the schema name.
pub async fn init_storage(
    runner: &TxRunner,
    pool_info: &PoolInfo,
    migrator: &Migrator,
    pre_migration: Option<PreMigrationTx>,
) -> StoreResult<StorageInit> {
    init_storage_steps(runner, pool_info, migrator, pre_migration)
        .await
        .map_err(|err| {
            StoreError::transaction(
                err.code(),
                "InitStorage",
                vec![("schemaName".to_string(), pool_info.schema.clone())],
                err,
            )
        })
}

async fn init_storage_steps(
    runner: &TxRunner,
    pool_info: &PoolInfo,
    migrator: &Migrator,
    pre_migration: Option<PreMigrationTx>,
) -> StoreResult<StorageInit> {
    let scope = runner.shutdown_token().clone();
    let configured_partitions = pool_info
        .config
        .resolved_num_partitions()
        .map_err(StoreError::config)?;

    let schema = pool_info.schema.clone();
    let detailed_log = pool_info.config.detailed_log;
    runner
        .run(
            &scope,
            "createSchema",
            AccessMode::ReadWrite,
            TxOpts::new(),
            move |conn| Box::pin(create_schema_tx(conn, schema.clone(), detailed_log)),
        )
        .await?;

    if let Some(pre_migration) = pre_migration {
        info!(schema = %pool_info.schema, "Running pre-migration transaction");
        runner
            .run(
                &scope,
                "preMigrationTx",
                AccessMode::ReadWrite,
                TxOpts::new(),
                pre_migration,
            )
            .await?;
    }

    let applied_migrations = run_migrations(pool_info, migrator).await?;

    let num_partitions = runner
        .run(
            &scope,
            "initPartitions",
            AccessMode::ReadWrite,
            TxOpts::new(),
            move |conn| Box::pin(init_partitions_tx(conn, configured_partitions)),
        )
        .await?;

    Ok(StorageInit {
        applied_migrations,
        num_partitions,
    })
}

async fn create_schema_tx(
    conn: &mut PgConnection,
    schema: String,
    detailed_log: bool,
) -> StoreResult<()> {
    let exists: bool = sqlx::query_scalar(queries::SCHEMA_EXISTS)
        .bind(&schema)
        .fetch_one(&mut *conn)
        .await?;

    if !exists {
        // Safe to quote: the name was checked by validate_schema_name.
        sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema))
            .execute(&mut *conn)
            .await?;
        info!(schema = %schema, "DB Schema created");
    } else if detailed_log {
        info!(schema = %schema, "DB Schema already exists");
    }
    Ok(())
}

/// Apply every pending migration on a dedicated pool and return how many ran.
///
/// The pool is opened from the same connection options as the traffic pool, so
/// `_sqlx_migrations` lives inside the node's schema.
pub async fn run_migrations(pool_info: &PoolInfo, migrator: &Migrator) -> StoreResult<usize> {
    let pool = pool_info.open_independent_pool(1).await?;
    let result = apply_migrations(&pool, migrator).await;
    pool.close().await;

    let applied = result?;
    if applied > 0 {
        info!(schema = %pool_info.schema, applied, "Applied migrations");
    }
    Ok(applied)
}

async fn apply_migrations(pool: &PgPool, migrator: &Migrator) -> StoreResult<usize> {
    let before = applied_versions(pool).await?;
    migrator.run(pool).await?;
    let after = applied_versions(pool).await?;
    Ok(after.difference(&before).count())
}

async fn applied_versions(pool: &PgPool) -> StoreResult<HashSet<i64>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table().await?;
    let applied = conn.list_applied_migrations().await?;
    Ok(applied.into_iter().map(|m| m.version).collect())
}

async fn init_partitions_tx(conn: &mut PgConnection, configured: i32) -> StoreResult<i32> {
    sqlx::query(queries::INSERT_SETTINGS)
        .bind(configured)
        .execute(&mut *conn)
        .await?;

    let stored: i32 = sqlx::query_scalar(queries::SELECT_NUM_PARTITIONS)
        .fetch_one(&mut *conn)
        .await?;
    if stored != configured {
        warn!(
            configured,
            stored, "Partition count differs from configuration, using stored value"
        );
    }

    for partition in 0..stored {
        for ddl in partition_tables_ddl(partition) {
            sqlx::query(&ddl).execute(&mut *conn).await?;
        }
    }
    Ok(stored)
}

/// Partition suffix: `p` followed by two lowercase hex digits.
pub fn partition_suffix(partition: i32) -> String {
    format!("p{:02x}", partition)
}

pub fn miniblocks_table(partition: i32) -> String {
    format!("miniblocks_{}", partition_suffix(partition))
}

pub fn minipools_table(partition: i32) -> String {
    format!("minipools_{}", partition_suffix(partition))
}

/// Partition holding `stream_id`: first two bytes of its SHA-256, big-endian,
/// modulo `num_partitions`.
pub fn partition_for_stream(stream_id: &[u8], num_partitions: i32) -> i32 {
    let digest = Sha256::digest(stream_id);
    let prefix = u16::from_be_bytes([digest[0], digest[1]]);
    i32::from(prefix) % num_partitions.max(1)
}

fn partition_tables_ddl(partition: i32) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             stream_id CHAR(64) NOT NULL, \
             seq_num BIGINT NOT NULL, \
             blockdata BYTEA NOT NULL, \
             PRIMARY KEY (stream_id, seq_num))",
            miniblocks_table(partition)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             stream_id CHAR(64) NOT NULL, \
             generation BIGINT NOT NULL, \
             slot_num BIGINT NOT NULL, \
             envelope BYTEA, \
             PRIMARY KEY (stream_id, generation, slot_num))",
            minipools_table(partition)
        ),
    ]
}
