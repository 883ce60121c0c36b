//! Prometheus metrics registration.
//!
//! Metrics are registered against an explicit [`prometheus::Registry`] owned by a
//! [`MetricsFactory`]. Creating the same metric twice returns the already registered
//! collector, so several stores may share one factory.

use crate::error::{StoreError, StoreResult};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Buckets for operation durations, in seconds.
pub const DEFAULT_DURATION_BUCKETS_SECONDS: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0,
];

const STATUS_LABEL: &str = "status";

/// Counter vector with a trailing `status` label (pass, fail, retry).
#[derive(Clone)]
pub struct StatusCounterVec {
    inner: IntCounterVec,
}

impl std::fmt::Debug for StatusCounterVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCounterVec").finish_non_exhaustive()
    }
}

impl StatusCounterVec {
    pub fn inc_pass(&self, name: &str) {
        self.inc(name, "pass");
    }

    pub fn inc_fail(&self, name: &str) {
        self.inc(name, "fail");
    }

    pub fn inc_retry(&self, name: &str) {
        self.inc(name, "retry");
    }

    /// Current value for `name` and `status`.
    pub fn get(&self, name: &str, status: &str) -> u64 {
        self.inner.with_label_values(&[name, status]).get()
    }

    fn inc(&self, name: &str, status: &str) {
        self.inner.with_label_values(&[name, status]).inc();
    }
}

#[derive(Clone)]
pub struct MetricsFactory {
    registry: Registry,
    created: Arc<Mutex<HashMap<String, Box<dyn Any + Send>>>>,
}

impl std::fmt::Debug for MetricsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsFactory").finish_non_exhaustive()
    }
}

impl MetricsFactory {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            created: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn new_status_counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> StoreResult<StatusCounterVec> {
        let mut all_labels = labels.to_vec();
        all_labels.push(STATUS_LABEL);
        let inner = self.get_or_register(name, || {
            IntCounterVec::new(Opts::new(name, help), &all_labels)
        })?;
        Ok(StatusCounterVec { inner })
    }

    pub fn new_histogram_vec(
        &self,
        name: &str,
        help: &str,
        buckets: &[f64],
        labels: &[&str],
    ) -> StoreResult<HistogramVec> {
        self.get_or_register(name, || {
            HistogramVec::new(
                HistogramOpts::new(name, help).buckets(buckets.to_vec()),
                labels,
            )
        })
    }

    pub fn new_gauge(&self, name: &str, help: &str) -> StoreResult<Gauge> {
        self.get_or_register(name, || Gauge::new(name, help))
    }

    pub fn new_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> StoreResult<GaugeVec> {
        self.get_or_register(name, || GaugeVec::new(Opts::new(name, help), labels))
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn encode_text(&self) -> StoreResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| StoreError::metrics(e.to_string()))
    }

    fn get_or_register<M, F>(&self, name: &str, create: F) -> StoreResult<M>
    where
        M: prometheus::core::Collector + Clone + Send + 'static,
        F: FnOnce() -> prometheus::Result<M>,
    {
        let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = created.get(name) {
            return existing.downcast_ref::<M>().cloned().ok_or_else(|| {
                StoreError::metrics(format!(
                    "Metric '{}' is already registered with a different type",
                    name
                ))
            });
        }

        let metric = create()?;
        self.registry.register(Box::new(metric.clone()))?;
        created.insert(name.to_string(), Box::new(metric.clone()));
        Ok(metric)
    }
}

impl Default for MetricsFactory {
    fn default() -> Self {
        Self::new()
    }
}
