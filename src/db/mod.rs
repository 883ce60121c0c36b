//! Database layer.
//!
//! This module provides the transactional storage engine:
//! - Pool provisioning and pool statistics
//! - Retrying transaction runner with backoff
//! - Schema creation, migrations and stream partitions
//! - Status sampling and periodic health reporting
//! - Isolation levels and access modes

pub mod backoff;
pub mod health;
pub mod pool;
pub mod runner;
pub mod schema;
pub mod status;
pub mod types;

pub use backoff::BackoffTracker;
pub use health::PoolHealthReporter;
pub use pool::{PoolInfo, PoolStat, StatPool, TrackedConnection, provision};
pub use runner::{TxMetrics, TxOpts, TxRunner};
pub use schema::{MIGRATOR, PreMigrationTx, StorageInit, init_storage, partition_for_stream};
pub use status::{PostgresStatus, prepare_status};
pub use types::{AccessMode, IsolationLevel};
