//! Periodic pool health reporting.
//!
//! A background task samples [`PostgresStatus`] every five seconds and mirrors it
//! into Prometheus gauges. Server identity (version and system id) is published
//! as info gauges labelled with the value; these are only rewritten when the
//! value changes.

use crate::db::pool::{PoolInfo, StatPool};
use crate::db::status::{PostgresStatus, prepare_status};
use crate::error::StoreResult;
use crate::metrics::MetricsFactory;
use prometheus::{Gauge, GaugeVec};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

pub const VERSION_INFO_METRIC: &str = "postgres_version_info";
pub const SYSTEM_ID_INFO_METRIC: &str = "postgres_system_id_info";

type StatusField = fn(&PostgresStatus) -> f64;

const NUMERIC_GAUGES: &[(&str, &str, StatusField)] = &[
    ("postgres_total_conns", "Total number of connections in the pool", |s| {
        f64::from(s.pool.total_conns)
    }),
    ("postgres_acquired_conns", "Number of currently acquired connections", |s| {
        f64::from(s.pool.acquired_conns)
    }),
    ("postgres_idle_conns", "Number of idle connections in the pool", |s| {
        f64::from(s.pool.idle_conns)
    }),
    ("postgres_constructing_conns", "Number of connections being constructed", |s| {
        f64::from(s.pool.constructing_conns)
    }),
    ("postgres_max_conns", "Maximum number of connections allowed", |s| {
        f64::from(s.pool.max_conns)
    }),
    ("postgres_new_conns_count", "Total number of new connections opened", |s| {
        s.pool.new_conns_count as f64
    }),
    ("postgres_acquire_count", "Total number of successful connection acquisitions", |s| {
        s.pool.acquire_count as f64
    }),
    (
        "postgres_empty_acquire_count",
        "Total number of acquires that waited because the pool had no idle connection",
        |s| s.pool.empty_acquire_count as f64,
    ),
    ("postgres_canceled_acquire_count", "Total number of cancelled acquires", |s| {
        s.pool.canceled_acquire_count as f64
    }),
    (
        "postgres_acquire_duration_seconds",
        "Total time spent waiting for connections, in seconds",
        |s| s.pool.acquire_duration.as_secs_f64(),
    ),
    (
        "postgres_max_lifetime_destroy_count",
        "Total number of connections closed for exceeding their max lifetime",
        |s| s.pool.max_lifetime_destroy_count as f64,
    ),
    (
        "postgres_max_idle_destroy_count",
        "Total number of connections closed for exceeding the idle timeout",
        |s| s.pool.max_idle_destroy_count as f64,
    ),
    (
        "postgres_unmigrated_streams",
        "Streams not yet moved to the fixed partition layout",
        |s| s.unmigrated_streams as f64,
    ),
    (
        "postgres_migrated_streams",
        "Streams stored in the fixed partition layout",
        |s| s.migrated_streams as f64,
    ),
    (
        "postgres_num_stream_partitions",
        "Partitions used by the fixed partition layout",
        |s| s.num_partitions as f64,
    ),
];

#[derive(Debug, Default)]
struct LastIdentity {
    version: Option<String>,
    system_id: Option<String>,
}

/// Which identity gauges a publish rewrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityChange {
    pub version: bool,
    pub system_id: bool,
}

pub struct PoolHealthReporter {
    pool: StatPool,
    gauges: Vec<(Gauge, StatusField)>,
    version_info: GaugeVec,
    system_id_info: GaugeVec,
    last_identity: Mutex<LastIdentity>,
}

impl std::fmt::Debug for PoolHealthReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHealthReporter")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PoolHealthReporter {
    pub fn new(pool: StatPool, factory: &MetricsFactory) -> StoreResult<Self> {
        let gauges = NUMERIC_GAUGES
            .iter()
            .map(|(name, help, field)| Ok((factory.new_gauge(name, help)?, *field)))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Self {
            pool,
            gauges,
            version_info: factory.new_gauge_vec(
                VERSION_INFO_METRIC,
                "PostgreSQL server version",
                &["version"],
            )?,
            system_id_info: factory.new_gauge_vec(
                SYSTEM_ID_INFO_METRIC,
                "PostgreSQL system identifier",
                &["system_id"],
            )?,
            last_identity: Mutex::new(LastIdentity::default()),
        })
    }

    /// Register the gauges and spawn the sampling task.
    ///
    /// The first sample is taken right away; the task exits once `shutdown` fires.
    pub fn start(
        pool_info: &PoolInfo,
        factory: &MetricsFactory,
        shutdown: CancellationToken,
    ) -> StoreResult<JoinHandle<()>> {
        let reporter = Self::new(pool_info.pool.clone(), factory)?;
        Ok(tokio::spawn(reporter.run(shutdown)))
    }

    async fn run(self, shutdown: CancellationToken) {
        let pool = self.pool.clone();
        self.sample_loop(shutdown, move |scope| {
            let pool = pool.clone();
            async move { prepare_status(&pool, &scope).await }
        })
        .await
    }

    /// Publish one sample immediately and then one every `SAMPLE_INTERVAL`.
    async fn sample_loop<S, Fut>(&self, shutdown: CancellationToken, mut sample: S)
    where
        S: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = PostgresStatus>,
    {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Pool health reporter stopped");
                    return;
                }
                _ = interval.tick() => {
                    let status = sample(shutdown.clone()).await;
                    self.publish(&status);
                }
            }
        }
    }

    /// Mirror `status` into the gauges.
    pub fn publish(&self, status: &PostgresStatus) -> IdentityChange {
        for (gauge, field) in &self.gauges {
            gauge.set(field(status));
        }

        let mut last = self.last_identity.lock().unwrap_or_else(|e| e.into_inner());
        IdentityChange {
            version: update_identity(&self.version_info, &mut last.version, &status.version),
            system_id: update_identity(
                &self.system_id_info,
                &mut last.system_id,
                &status.system_id,
            ),
        }
    }
}

fn update_identity(gauge: &GaugeVec, last: &mut Option<String>, current: &str) -> bool {
    if last.as_deref() == Some(current) {
        return false;
    }
    gauge.reset();
    gauge.with_label_values(&[current]).set(1.0);
    *last = Some(current.to_string());
    true
}
