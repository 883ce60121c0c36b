//! PG Stream Store - Main entry point.
//!
//! Provisions the node's connection pool, initializes storage (schema,
//! migrations, partitions) and serves metrics and status over HTTP until a
//! shutdown signal arrives.

use clap::Parser;
use pg_stream_store::config::Config;
use pg_stream_store::db::{PoolHealthReporter, provision};
use pg_stream_store::transport::{StatusServer, wait_for_signal};
use pg_stream_store::{MetricsFactory, PostgresEventStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let db_config = config.database_config()?;
    let schema = config.schema_name()?;

    info!(
        schema = %schema,
        "Starting PG Stream Store v{}",
        env!("CARGO_PKG_VERSION")
    );

    let shutdown = CancellationToken::new();
    let factory = MetricsFactory::new();

    let pool_info = provision(&db_config, &schema).await?;
    let store = PostgresEventStore::new(pool_info, &factory, shutdown.clone()).await?;

    if config.migrate_only {
        info!(
            applied_migrations = store.applied_migrations(),
            "Migrations complete, exiting"
        );
        store.close().await;
        return Ok(());
    }

    let reporter = PoolHealthReporter::start(store.pool_info(), &factory, shutdown.clone())?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.cancel();
    });

    info!(
        host = %config.http_host,
        port = config.http_port,
        "Using HTTP endpoint"
    );
    let server = StatusServer::new(
        factory,
        store.pool_info().pool.clone(),
        shutdown.clone(),
        &config.http_host,
        config.http_port,
    );
    let result = server.run().await;

    // Stop background work before closing the pool
    shutdown.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "Pool health reporter ended abnormally");
    }

    info!("Closing database connections");
    store.close().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
