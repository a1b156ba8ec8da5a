// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-GVK Prometheus metrics.

use std::collections::HashMap;

use kube::api::GroupVersionKind;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

use crate::constants::METRICS_NAMESPACE;
use crate::error::Result;

/// Prometheus metrics for the lease controller, scoped to one GVK via
/// constant labels `{group, version, kind}`.
pub struct LeaseMetrics {
    /// Always 1; makes the metric family visible before any reconcile runs.
    pub info: IntGauge,
    pub leases_started: IntCounter,
    pub leases_expired: IntCounter,
    pub invalid_ttl: IntCounter,
    pub reconcile_errors: IntCounter,
    pub reconcile_duration: Histogram,
    pub cleanup_jobs_created: IntCounter,
    pub cleanup_jobs_completed: IntCounter,
    pub cleanup_jobs_failed: IntCounter,
    pub cleanup_job_duration: Histogram,
}

impl LeaseMetrics {
    pub fn new(gvk: &GroupVersionKind, registry: &Registry) -> Result<Self> {
        let labels = HashMap::from([
            ("group".to_string(), gvk.group.clone()),
            ("version".to_string(), gvk.version.clone()),
            ("kind".to_string(), gvk.kind.clone()),
        ]);

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(
                Opts::new(name, help)
                    .namespace(METRICS_NAMESPACE)
                    .const_labels(labels.clone()),
            )
        };
        let histogram = |name: &str, help: &str| {
            Histogram::with_opts(
                HistogramOpts::new(name, help)
                    .namespace(METRICS_NAMESPACE)
                    .const_labels(labels.clone()),
            )
        };

        let metrics = Self {
            info: IntGauge::with_opts(
                Opts::new(
                    "info",
                    "Always 1; indicates the controller is running for the given GVK",
                )
                .namespace(METRICS_NAMESPACE)
                .const_labels(labels.clone()),
            )?,
            leases_started: counter(
                "leases_started_total",
                "Number of leases started (lease-start set by the controller)",
            )?,
            leases_expired: counter("leases_expired_total", "Number of leases that expired")?,
            invalid_ttl: counter(
                "invalid_ttl_total",
                "Number of objects with an unparseable ttl annotation",
            )?,
            reconcile_errors: counter("reconcile_errors_total", "Number of reconcile errors")?,
            reconcile_duration: histogram(
                "reconcile_duration_seconds",
                "Duration of lease reconciles in seconds",
            )?,
            cleanup_jobs_created: counter(
                "cleanup_jobs_created_total",
                "Number of cleanup jobs submitted",
            )?,
            cleanup_jobs_completed: counter(
                "cleanup_jobs_completed_total",
                "Number of cleanup jobs that completed within their wait window",
            )?,
            cleanup_jobs_failed: counter(
                "cleanup_jobs_failed_total",
                "Number of cleanup jobs that failed, timed out or could not be submitted",
            )?,
            cleanup_job_duration: histogram(
                "cleanup_job_duration_seconds",
                "Duration of awaited cleanup jobs in seconds",
            )?,
        };

        registry.register(Box::new(metrics.info.clone()))?;
        registry.register(Box::new(metrics.leases_started.clone()))?;
        registry.register(Box::new(metrics.leases_expired.clone()))?;
        registry.register(Box::new(metrics.invalid_ttl.clone()))?;
        registry.register(Box::new(metrics.reconcile_errors.clone()))?;
        registry.register(Box::new(metrics.reconcile_duration.clone()))?;
        registry.register(Box::new(metrics.cleanup_jobs_created.clone()))?;
        registry.register(Box::new(metrics.cleanup_jobs_completed.clone()))?;
        registry.register(Box::new(metrics.cleanup_jobs_failed.clone()))?;
        registry.register(Box::new(metrics.cleanup_job_duration.clone()))?;

        metrics.info.set(1);
        Ok(metrics)
    }
}
