//! Point-in-time status of the pool and the database behind it.

use crate::db::pool::{PoolStat, StatPool};
use crate::error::{SQLSTATE_UNDEFINED_COLUMN, SQLSTATE_UNDEFINED_TABLE, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

mod queries {
    pub const VERSION: &str = "SELECT version()";
    pub const SYSTEM_ID: &str = "SELECT system_identifier::text FROM pg_control_system()";
    pub const UNMIGRATED_STREAMS: &str = "SELECT count(*) FROM es WHERE migrated = false";
    pub const MIGRATED_STREAMS: &str = "SELECT count(*) FROM es WHERE migrated = true";
    pub const NUM_PARTITIONS: &str =
        "SELECT num_partitions FROM settings WHERE single_row_key = true";
}

/// Pool counters plus server identity and stream layout.
///
/// Sampling never fails as a whole: identity queries that fail carry an
/// `"Error: ..."` value and counters that cannot be read are zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PostgresStatus {
    #[serde(flatten)]
    pub pool: PoolStat,
    pub version: String,
    pub system_id: String,
    pub migrated_streams: i64,
    pub unmigrated_streams: i64,
    pub num_partitions: i64,
    pub sampled_at: DateTime<Utc>,
}

/// Sample the pool and run the status queries.
pub async fn prepare_status(pool: &StatPool, scope: &CancellationToken) -> PostgresStatus {
    let version = match fetch_text(pool, scope, queries::VERSION).await {
        Ok(version) => version,
        Err(e) => {
            error!(error = %e, "Failed to get PostgreSQL version");
            format!("Error: {}", e)
        }
    };

    let system_id = fetch_text(pool, scope, queries::SYSTEM_ID)
        .await
        .unwrap_or_else(|e| format!("Error: {}", e));

    // Stream tables only exist once migrations have run.
    let unmigrated_streams = fetch_count(pool, scope, queries::UNMIGRATED_STREAMS)
        .await
        .unwrap_or_else(|e| {
            log_unless_missing(&e, true, "Error calculating unmigrated stream count");
            0
        });
    let migrated_streams = fetch_count(pool, scope, queries::MIGRATED_STREAMS)
        .await
        .unwrap_or_else(|e| {
            log_unless_missing(&e, true, "Error calculating migrated stream count");
            0
        });
    let num_partitions = fetch_partitions(pool, scope)
        .await
        .unwrap_or_else(|e| {
            log_unless_missing(&e, false, "Error calculating partition count");
            0
        });

    PostgresStatus {
        pool: pool.stat(),
        version,
        system_id,
        migrated_streams,
        unmigrated_streams,
        num_partitions,
        sampled_at: Utc::now(),
    }
}

async fn fetch_text(pool: &StatPool, scope: &CancellationToken, sql: &str) -> StoreResult<String> {
    let mut conn = pool.acquire(scope).await?;
    Ok(sqlx::query_scalar(sql).fetch_one(&mut *conn).await?)
}

async fn fetch_count(pool: &StatPool, scope: &CancellationToken, sql: &str) -> StoreResult<i64> {
    let mut conn = pool.acquire(scope).await?;
    Ok(sqlx::query_scalar(sql).fetch_one(&mut *conn).await?)
}

async fn fetch_partitions(pool: &StatPool, scope: &CancellationToken) -> StoreResult<i64> {
    let mut conn = pool.acquire(scope).await?;
    let partitions: i32 = sqlx::query_scalar(queries::NUM_PARTITIONS)
        .fetch_one(&mut *conn)
        .await?;
    Ok(i64::from(partitions))
}

/// Missing tables (and optionally columns) are expected before migrations.
fn is_missing_relation(err: &StoreError, include_columns: bool) -> bool {
    match err.sql_state() {
        Some(SQLSTATE_UNDEFINED_TABLE) => true,
        Some(SQLSTATE_UNDEFINED_COLUMN) => include_columns,
        _ => false,
    }
}

fn log_unless_missing(err: &StoreError, include_columns: bool, message: &str) {
    if !is_missing_relation(err, include_columns) {
        error!(error = %err, "{}", message);
    }
}
