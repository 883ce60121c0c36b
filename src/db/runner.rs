//! Transaction runner.
//!
//! Every unit of work runs inside one database transaction that starts with
//! `SET TRANSACTION ISOLATION LEVEL <level> <mode>`. Serialization failures and
//! deadlocks restart the whole transaction after a backoff; every other failure is
//! returned once, wrapped with the operation name and caller tags.
//!
//! Read-write work runs on its own task under the engine shutdown token, so a
//! caller that goes away cannot abort a write half way. Read-only work runs
//! under the caller's token.

use crate::db::backoff::BackoffTracker;
use crate::db::pool::{PoolInfo, StatPool};
use crate::db::types::{AccessMode, IsolationLevel, set_transaction_sql};
use crate::error::{ErrorClass, ErrorCode, StoreError, StoreResult, classify};
use crate::metrics::{DEFAULT_DURATION_BUCKETS_SECONDS, MetricsFactory, StatusCounterVec};
use futures_util::future::BoxFuture;
use prometheus::HistogramVec;
use sqlx::Connection;
use sqlx::postgres::PgConnection;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

pub const TX_STATUS_METRIC: &str = "dbtx_status";
pub const TX_DURATION_METRIC: &str = "dbtx_duration_seconds";

/// Per-call transaction options.
#[derive(Debug, Clone, Default)]
pub struct TxOpts {
    /// Treat a not-found result as an expected outcome: log at debug, count as pass.
    pub skip_logging_not_found: bool,
    /// Extra key/value pairs attached to logs and to the returned error.
    pub tags: Vec<(String, String)>,
}

impl TxOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_logging_not_found(mut self) -> Self {
        self.skip_logging_not_found = true;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.push((key.into(), value.to_string()));
        self
    }
}

/// Counters and timers recorded for every transaction.
#[derive(Clone)]
pub struct TxMetrics {
    status: StatusCounterVec,
    duration: HistogramVec,
}

impl std::fmt::Debug for TxMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxMetrics")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TxMetrics {
    pub fn new(factory: &MetricsFactory) -> StoreResult<Self> {
        Ok(Self {
            status: factory.new_status_counter_vec(
                TX_STATUS_METRIC,
                "PG transaction status",
                &["name"],
            )?,
            duration: factory.new_histogram_vec(
                TX_DURATION_METRIC,
                "PG transaction duration",
                DEFAULT_DURATION_BUCKETS_SECONDS,
                &["name"],
            )?,
        })
    }

    pub fn status(&self) -> &StatusCounterVec {
        &self.status
    }
}

/// One try at running a transaction from begin to commit.
pub trait TxAttempt: Send {
    type Output: Send;

    fn attempt(&mut self) -> impl Future<Output = StoreResult<Self::Output>> + Send;
}

/// Drive `attempt` until it succeeds, fails for good, or `scope` is cancelled.
pub async fn run_attempts<A: TxAttempt>(
    name: &str,
    db_schema: &str,
    opts: &TxOpts,
    metrics: &TxMetrics,
    scope: &CancellationToken,
    attempt: &mut A,
) -> StoreResult<A::Output> {
    let _timer = metrics.duration.with_label_values(&[name]).start_timer();
    let mut backoff = BackoffTracker::new();

    loop {
        let err = match attempt.attempt().await {
            Ok(output) => {
                metrics.status.inc_pass(name);
                return Ok(output);
            }
            Err(err) => err,
        };

        match classify(&err, opts.skip_logging_not_found) {
            ErrorClass::Transient => {
                metrics.status.inc_retry(name);
                warn!(
                    name,
                    db_schema,
                    tags = ?opts.tags,
                    error = %err,
                    "Transaction conflict, retrying"
                );

                if let Err(cancelled) = backoff.wait(scope).await {
                    metrics.status.inc_fail(name);
                    warn!(
                        name,
                        db_schema,
                        tags = ?opts.tags,
                        error = %cancelled,
                        "Transaction abandoned during backoff"
                    );
                    return Err(StoreError::transaction(
                        ErrorCode::Canceled,
                        name,
                        opts.tags.clone(),
                        cancelled,
                    ));
                }
            }
            ErrorClass::ExpectedAbsence => {
                metrics.status.inc_pass(name);
                debug!(
                    name,
                    db_schema,
                    tags = ?opts.tags,
                    error = %err,
                    "Transaction finished with expected not-found"
                );
                return Err(StoreError::transaction(
                    ErrorCode::NotFound,
                    name,
                    opts.tags.clone(),
                    err,
                ));
            }
            ErrorClass::Fatal => {
                metrics.status.inc_fail(name);
                warn!(
                    name,
                    db_schema,
                    tags = ?opts.tags,
                    error = %err,
                    "Transaction failed"
                );
                return Err(StoreError::transaction(
                    fatal_code(&err),
                    name,
                    opts.tags.clone(),
                    err,
                ));
            }
        }
    }
}

/// Cancellation and not-found keep their own code; everything else is a db failure.
fn fatal_code(err: &StoreError) -> ErrorCode {
    match err.root().code() {
        code @ (ErrorCode::Canceled | ErrorCode::NotFound) => code,
        _ => ErrorCode::DbOperationFailure,
    }
}

/// Run `body` in the scope that matches `mode`.
///
/// Read-write bodies are spawned under `shutdown` and run to completion even if
/// the returned future is dropped. Read-only bodies run inline under a
/// token cancelled by either `caller` or `shutdown`.
pub async fn run_scoped<T, Fut, B>(
    mode: AccessMode,
    caller: &CancellationToken,
    shutdown: &CancellationToken,
    body: B,
) -> StoreResult<T>
where
    T: Send + 'static,
    Fut: Future<Output = StoreResult<T>> + Send + 'static,
    B: FnOnce(CancellationToken) -> Fut,
{
    match mode {
        AccessMode::ReadWrite => tokio::spawn(body(shutdown.clone()))
            .await
            .map_err(|e| StoreError::internal(format!("Transaction task failed: {}", e)))?,
        AccessMode::ReadOnly => {
            let (scope, _guard) = linked_scope(caller, shutdown);
            body(scope).await
        }
    }
}

/// Token cancelled when either parent is. The guard stops the link when dropped.
fn linked_scope(
    caller: &CancellationToken,
    shutdown: &CancellationToken,
) -> (CancellationToken, DropGuard) {
    let scope = shutdown.child_token();
    let caller = caller.clone();
    let linked = scope.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => linked.cancel(),
            _ = linked.cancelled() => {}
        }
    });
    (scope.clone(), scope.drop_guard())
}

/// A real transaction against the pool.
struct PgAttempt<F, T> {
    pool: StatPool,
    scope: CancellationToken,
    set_transaction: String,
    work: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> PgAttempt<F, T>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send,
    T: Send,
{
    async fn run_once(&mut self) -> StoreResult<T> {
        let mut conn = self.pool.acquire(&self.scope).await?;
        let mut tx = conn.begin().await?;

        sqlx::query(&self.set_transaction).execute(&mut *tx).await?;
        let output = (self.work)(&mut *tx).await?;

        // Dropping `tx` without commit rolls it back.
        tx.commit().await?;
        Ok(output)
    }
}

impl<F, T> TxAttempt for PgAttempt<F, T>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send,
    T: Send,
{
    type Output = T;

    async fn attempt(&mut self) -> StoreResult<T> {
        let scope = self.scope.clone();
        tokio::select! {
            biased;
            _ = scope.cancelled() => Err(StoreError::cancelled(
                "transaction",
                "Transaction cancelled",
            )),
            result = self.run_once() => result,
        }
    }
}

/// Runs units of work as retried transactions against one pool.
#[derive(Debug, Clone)]
pub struct TxRunner {
    pool: StatPool,
    schema: String,
    isolation: IsolationLevel,
    metrics: TxMetrics,
    shutdown: CancellationToken,
}

impl TxRunner {
    pub fn new(pool_info: &PoolInfo, metrics: TxMetrics, shutdown: CancellationToken) -> Self {
        Self {
            pool: pool_info.pool.clone(),
            schema: pool_info.schema.clone(),
            isolation: IsolationLevel::parse_lenient(&pool_info.config.isolation_level),
            metrics,
            shutdown,
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn metrics(&self) -> &TxMetrics {
        &self.metrics
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `work` as a transaction named `name`.
    ///
    /// `work` may be invoked more than once; each call sees a fresh transaction.
    pub async fn run<T, F>(
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
        let runner = self.clone();
        let name = name.to_string();
        run_scoped(mode, scope, &self.shutdown, move |op_scope| async move {
            let mut attempt = PgAttempt {
                pool: runner.pool.clone(),
                scope: op_scope.clone(),
                set_transaction: set_transaction_sql(runner.isolation, mode),
                work,
                _output: PhantomData,
            };
            run_attempts(
                &name,
                &runner.schema,
                &opts,
                &runner.metrics,
                &op_scope,
                &mut attempt,
            )
            .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SQLSTATE_DEADLOCK_DETECTED, SQLSTATE_SERIALIZATION_FAILURE};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Replays a fixed list of outcomes. Runs out into serialization failures.
    struct ScriptedAttempt {
        outcomes: VecDeque<StoreResult<u32>>,
        calls: usize,
        commits: usize,
    }

    impl ScriptedAttempt {
        fn new(outcomes: Vec<StoreResult<u32>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                calls: 0,
                commits: 0,
            }
        }
    }

    impl TxAttempt for ScriptedAttempt {
        type Output = u32;

        async fn attempt(&mut self) -> StoreResult<u32> {
            self.calls += 1;
            let outcome = self.outcomes.pop_front().unwrap_or_else(|| Err(conflict()));
            if outcome.is_ok() {
                self.commits += 1;
            }
            outcome
        }
    }

    fn conflict() -> StoreError {
        StoreError::database(
            "could not serialize access due to concurrent update",
            Some(SQLSTATE_SERIALIZATION_FAILURE.to_string()),
            "retry",
        )
    }

    fn metrics() -> TxMetrics {
        TxMetrics::new(&MetricsFactory::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_conflicts_until_commit() {
        let metrics = metrics();
        let scope = CancellationToken::new();
        let deadlock = StoreError::database(
            "deadlock detected",
            Some(SQLSTATE_DEADLOCK_DETECTED.to_string()),
            "retry",
        );
        let mut attempt = ScriptedAttempt::new(vec![Err(conflict()), Err(deadlock), Ok(42)]);

        let result = run_attempts(
            "addEvent",
            "s1",
            &TxOpts::new(),
            &metrics,
            &scope,
            &mut attempt,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt.calls, 3);
        assert_eq!(attempt.commits, 1);
        assert_eq!(metrics.status().get("addEvent", "retry"), 2);
        assert_eq!(metrics.status().get("addEvent", "pass"), 1);
        assert_eq!(metrics.status().get("addEvent", "fail"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let metrics = metrics();
        let scope = CancellationToken::new();
        let mut attempt = ScriptedAttempt::new(vec![]);

        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = run_attempts(
            "addEvent",
            "s1",
            &TxOpts::new(),
            &metrics,
            &scope,
            &mut attempt,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Canceled);
        match &err {
            StoreError::Transaction { name, source, .. } => {
                assert_eq!(name, "addEvent");
                assert!(
                    matches!(source.as_ref(), StoreError::Cancelled { message, .. } if message == "Timed out waiting for backoff")
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("addEvent"));
        // Second attempt happens right away, the third would need a 50ms backoff.
        assert_eq!(attempt.calls, 2);
        assert_eq!(attempt.commits, 0);
        assert_eq!(metrics.status().get("addEvent", "fail"), 1);
        assert_eq!(metrics.status().get("addEvent", "pass"), 0);
    }

    #[tokio::test]
    async fn test_expected_not_found_counts_as_pass() {
        let metrics = metrics();
        let scope = CancellationToken::new();
        let mut attempt =
            ScriptedAttempt::new(vec![Err(StoreError::not_found("stream not found"))]);

        let err = run_attempts(
            "getStream",
            "s1",
            &TxOpts::new().skip_logging_not_found().tag("streamId", "abcd"),
            &metrics,
            &scope,
            &mut attempt,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(err.is_not_found());
        match &err {
            StoreError::Transaction { name, tags, .. } => {
                assert_eq!(name, "getStream");
                assert_eq!(tags, &vec![("streamId".to_string(), "abcd".to_string())]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let rendered = err.to_string();
        assert!(rendered.contains("getStream"), "{rendered}");
        assert!(rendered.contains("abcd"), "{rendered}");
        assert_eq!(attempt.calls, 1);
        assert_eq!(metrics.status().get("getStream", "pass"), 1);
        assert_eq!(metrics.status().get("getStream", "fail"), 0);
    }

    #[tokio::test]
    async fn test_unexpected_not_found_is_wrapped_and_failed() {
        let metrics = metrics();
        let scope = CancellationToken::new();
        let mut attempt =
            ScriptedAttempt::new(vec![Err(StoreError::not_found("stream not found"))]);

        let err = run_attempts(
            "getStream",
            "s1",
            &TxOpts::new(),
            &metrics,
            &scope,
            &mut attempt,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(matches!(err, StoreError::Transaction { .. }));
        assert_eq!(metrics.status().get("getStream", "fail"), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_is_wrapped_with_tags() {
        let metrics = metrics();
        let scope = CancellationToken::new();
        let mut attempt = ScriptedAttempt::new(vec![Err(StoreError::database(
            "relation \"es\" does not exist",
            Some("42P01".to_string()),
            "check",
        ))]);

        let err = run_attempts(
            "getStream",
            "s1",
            &TxOpts::new().tag("streamId", "abcd"),
            &metrics,
            &scope,
            &mut attempt,
        )
        .await
        .unwrap_err();

        match &err {
            StoreError::Transaction {
                code, name, tags, ..
            } => {
                assert_eq!(*code, ErrorCode::DbOperationFailure);
                assert_eq!(name, "getStream");
                assert_eq!(tags, &vec![("streamId".to_string(), "abcd".to_string())]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.sql_state(), Some("42P01"));
        assert_eq!(attempt.calls, 1);
        assert_eq!(metrics.status().get("getStream", "fail"), 1);
        assert_eq!(metrics.status().get("getStream", "retry"), 0);
    }

    #[tokio::test]
    async fn test_duration_is_recorded() {
        let metrics = metrics();
        let scope = CancellationToken::new();
        let mut attempt = ScriptedAttempt::new(vec![Ok(1)]);

        run_attempts("getStream", "s1", &TxOpts::new(), &metrics, &scope, &mut attempt)
            .await
            .unwrap();

        let count = metrics
            .duration
            .with_label_values(&["getStream"])
            .get_sample_count();
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_write_survives_dropped_caller() {
        let caller = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let done = Arc::clone(&finished);
        let (caller_clone, shutdown_clone) = (caller.clone(), shutdown.clone());
        let call = tokio::spawn(async move {
            run_scoped(
                AccessMode::ReadWrite,
                &caller_clone,
                &shutdown_clone,
                move |scope| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    assert!(!scope.is_cancelled());
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.cancel();
        call.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_read_only_scope_follows_caller_and_shutdown() {
        let caller = CancellationToken::new();
        let shutdown = CancellationToken::new();
        caller.cancel();

        let cancelled = run_scoped(AccessMode::ReadOnly, &caller, &shutdown, |scope| async move {
            scope.cancelled().await;
            Ok(true)
        })
        .await
        .unwrap();
        assert!(cancelled);

        let caller = CancellationToken::new();
        shutdown.cancel();
        let seen = run_scoped(AccessMode::ReadOnly, &caller, &shutdown, |scope| async move {
            Ok(scope.is_cancelled())
        })
        .await
        .unwrap();
        assert!(seen);
    }

    #[tokio::test]
    async fn test_read_write_ignores_caller_cancellation() {
        let caller = CancellationToken::new();
        let shutdown = CancellationToken::new();
        caller.cancel();

        let seen = run_scoped(AccessMode::ReadWrite, &caller, &shutdown, |scope| async move {
            Ok(scope.is_cancelled())
        })
        .await
        .unwrap();
        assert!(!seen);
    }

    #[test]
    fn test_tx_opts_builder() {
        let opts = TxOpts::new()
            .skip_logging_not_found()
            .tag("streamId", "ab")
            .tag("blockNum", 7);
        assert!(opts.skip_logging_not_found);
        assert_eq!(
            opts.tags,
            vec![
                ("streamId".to_string(), "ab".to_string()),
                ("blockNum".to_string(), "7".to_string())
            ]
        );
    }
}
