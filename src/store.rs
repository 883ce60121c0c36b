//! The Postgres event store.

use crate::db::pool::PoolInfo;
use crate::db::runner::{TxMetrics, TxOpts, TxRunner};
use crate::db::schema::{MIGRATOR, PreMigrationTx, StorageInit, init_storage};
use crate::db::status::{PostgresStatus, prepare_status};
use crate::db::types::{AccessMode, IsolationLevel};
use crate::error::StoreResult;
use crate::metrics::MetricsFactory;
use futures_util::future::BoxFuture;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Transactional storage for one node schema.
///
/// Construction creates the schema and applies migrations; once [`new`] returns,
/// every operation goes through [`run`] or [`run_with`].
///
/// [`new`]: PostgresEventStore::new
/// [`run`]: PostgresEventStore::run
/// [`run_with`]: PostgresEventStore::run_with
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool_info: PoolInfo,
    runner: TxRunner,
    init: StorageInit,
}

impl PostgresEventStore {
    /// Initialize storage with the embedded migrations.
    ///
    /// `shutdown` is the operation scope: read-write transactions only stop when
    /// it is cancelled.
    pub async fn new(
        pool_info: PoolInfo,
        factory: &MetricsFactory,
        shutdown: CancellationToken,
    ) -> StoreResult<Self> {
        Self::with_migrations(pool_info, factory, shutdown, &MIGRATOR, None).await
    }

    /// Initialize storage with a custom migration set and optional pre-migration work.
    pub async fn with_migrations(
        pool_info: PoolInfo,
        factory: &MetricsFactory,
        shutdown: CancellationToken,
        migrator: &Migrator,
        pre_migration: Option<PreMigrationTx>,
    ) -> StoreResult<Self> {
        let runner = TxRunner::new(&pool_info, TxMetrics::new(factory)?, shutdown);
        if runner.isolation_level() != IsolationLevel::Serializable {
            info!(level = %runner.isolation_level(), "Using isolation level");
        }

        let init = init_storage(&runner, &pool_info, migrator, pre_migration).await?;
        info!(
            schema = %pool_info.schema,
            applied_migrations = init.applied_migrations,
            num_partitions = init.num_partitions,
            "Storage initialized"
        );

        Ok(Self {
            pool_info,
            runner,
            init,
        })
    }

    /// Run `work` as a transaction with default options.
    pub async fn run<T, F>(
        &self,
        scope: &CancellationToken,
        name: &str,
        mode: AccessMode,
        work: F,
    ) -> StoreResult<T>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.runner
            .run(scope, name, mode, TxOpts::default(), work)
            .await
    }

    /// Run `work` as a transaction with explicit options.
    pub async fn run_with<T, F>(
        &self,
        scope: &CancellationToken,
        name: &str,
        mode: AccessMode,
        opts: TxOpts,
        work: F,
    ) -> StoreResult<T>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.runner.run(scope, name, mode, opts, work).await
    }

    pub async fn report_status(&self, scope: &CancellationToken) -> PostgresStatus {
        prepare_status(&self.pool_info.pool, scope).await
    }

    pub fn schema_name(&self) -> &str {
        &self.pool_info.schema
    }

    pub fn num_partitions(&self) -> i32 {
        self.init.num_partitions
    }

    pub fn applied_migrations(&self) -> usize {
        self.init.applied_migrations
    }

    pub fn pool_info(&self) -> &PoolInfo {
        &self.pool_info
    }

    /// Close the pool. In-flight transactions finish or fail with a pool error.
    pub async fn close(&self) {
        self.pool_info.pool.close().await;
    }
}
