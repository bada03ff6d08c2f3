//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the download engine maintains.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    active_tasks: IntGauge,
    queue_depth: IntGauge,
    tasks_admitted_total: IntCounter,
    tasks_queued_total: IntCounter,
    policy_actions_total: IntCounterVec,
    reconfigurations_total: IntCounter,
    rebuild_failures_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Tasks currently holding an admission slot.
    pub active_tasks: i64,
    /// Tasks waiting for a slot.
    pub queue_depth: i64,
    /// Tasks handed to the protocol engine since start.
    pub tasks_admitted_total: u64,
    /// Tasks placed on the wait list since start.
    pub tasks_queued_total: u64,
    /// Successful engine reconfigurations.
    pub reconfigurations_total: u64,
    /// Failed protocol engine construction attempts.
    pub rebuild_failures_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_tasks =
            IntGauge::with_opts(Opts::new("active_tasks", "Tasks holding an admission slot"))?;
        let queue_depth =
            IntGauge::with_opts(Opts::new("queue_depth", "Tasks waiting for admission"))?;
        let tasks_admitted_total = IntCounter::with_opts(Opts::new(
            "tasks_admitted_total",
            "Tasks handed to the protocol engine",
        ))?;
        let tasks_queued_total = IntCounter::with_opts(Opts::new(
            "tasks_queued_total",
            "Tasks placed on the wait list",
        ))?;
        let policy_actions_total = IntCounterVec::new(
            Opts::new(
                "policy_actions_total",
                "Governance policy actions dispatched by kind",
            ),
            &["action"],
        )?;
        let reconfigurations_total = IntCounter::with_opts(Opts::new(
            "engine_reconfigurations_total",
            "Successful protocol engine reconfigurations",
        ))?;
        let rebuild_failures_total = IntCounter::with_opts(Opts::new(
            "engine_rebuild_failures_total",
            "Failed protocol engine construction attempts",
        ))?;

        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(tasks_admitted_total.clone()))?;
        registry.register(Box::new(tasks_queued_total.clone()))?;
        registry.register(Box::new(policy_actions_total.clone()))?;
        registry.register(Box::new(reconfigurations_total.clone()))?;
        registry.register(Box::new(rebuild_failures_total.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                active_tasks,
                queue_depth,
                tasks_admitted_total,
                tasks_queued_total,
                policy_actions_total,
                reconfigurations_total,
                rebuild_failures_total,
            }),
        })
    }

    /// Set the active task gauge.
    pub fn set_active_tasks(&self, count: usize) {
        self.inner.active_tasks.set(saturating_i64(count));
    }

    /// Set the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.queue_depth.set(saturating_i64(depth));
    }

    /// Count a task handed to the protocol engine.
    pub fn inc_admitted(&self) {
        self.inner.tasks_admitted_total.inc();
    }

    /// Count a task placed on the wait list.
    pub fn inc_queued(&self) {
        self.inner.tasks_queued_total.inc();
    }

    /// Count a governance policy action (`auto_stop`, `auto_delete`).
    pub fn inc_policy_action(&self, action: &str) {
        self.inner
            .policy_actions_total
            .with_label_values(&[action])
            .inc();
    }

    /// Count a completed reconfiguration.
    pub fn inc_reconfiguration(&self) {
        self.inner.reconfigurations_total.inc();
    }

    /// Count a failed protocol engine construction attempt.
    pub fn inc_rebuild_failure(&self) {
        self.inner.rebuild_failures_total.inc();
    }

    /// Current count for a policy action label.
    #[must_use]
    pub fn policy_actions(&self, action: &str) -> u64 {
        self.inner
            .policy_actions_total
            .with_label_values(&[action])
            .get()
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("failed to encode Prometheus metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }

    /// Take a point-in-time snapshot of the gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_tasks: self.inner.active_tasks.get(),
            queue_depth: self.inner.queue_depth.get(),
            tasks_admitted_total: self.inner.tasks_admitted_total.get(),
            tasks_queued_total: self.inner.tasks_queued_total.get(),
            reconfigurations_total: self.inner.reconfigurations_total.get(),
            rebuild_failures_total: self.inner.rebuild_failures_total.get(),
        }
    }
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_updates() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.set_active_tasks(3);
        metrics.set_queue_depth(2);
        metrics.inc_admitted();
        metrics.inc_admitted();
        metrics.inc_queued();
        metrics.inc_policy_action("auto_stop");
        metrics.inc_reconfiguration();
        metrics.inc_rebuild_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_tasks, 3);
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.tasks_admitted_total, 2);
        assert_eq!(snapshot.tasks_queued_total, 1);
        assert_eq!(snapshot.reconfigurations_total, 1);
        assert_eq!(snapshot.rebuild_failures_total, 1);
        assert_eq!(metrics.policy_actions("auto_stop"), 1);
        assert_eq!(metrics.policy_actions("auto_delete"), 0);

        let rendered = metrics.render()?;
        assert!(rendered.contains("active_tasks 3"));
        assert!(rendered.contains("policy_actions_total"));
        assert!(rendered.contains("engine_rebuild_failures_total"));
        Ok(())
    }

    #[test]
    fn saturating_conversion_caps_large_values() {
        assert_eq!(saturating_i64(usize::MAX), i64::MAX);
        assert_eq!(saturating_i64(7), 7);
    }
}
