//! PG Stream Store Library
//!
//! Transactional PostgreSQL storage engine for stream nodes: retried
//! serializable transactions, per-node schemas with embedded migrations, and
//! connection pool health metrics.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::{ErrorCode, StoreError, StoreResult};
pub use metrics::MetricsFactory;
pub use store::PostgresEventStore;
