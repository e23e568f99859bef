// src/metrics/collector.rs
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use anyhow::Result;

pub struct HealthMetricsRegistry {
    registry: Registry,
    collector: Arc<HealthMetrics>,
}

impl HealthMetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(HealthMetrics::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<HealthMetrics> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct HealthMetrics {
    // Snapshot metrics
    pub healthy_endpoints: IntGaugeVec,
    pub monitored_endpoints: IntGaugeVec,
    pub snapshots_published_total: IntCounterVec,

    // Per-endpoint metrics
    pub endpoint_health_status: IntGaugeVec,
    pub health_updates_total: IntCounterVec,

    // Checker lifecycle metrics
    pub checkers_created_total: IntCounterVec,
    pub checker_failures_total: IntCounterVec,
}

impl HealthMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let healthy_endpoints = IntGaugeVec::new(
            Opts::new("hc_healthy_endpoints", "Number of healthy endpoints"),
            &["group"],
        )?;
        registry.register(Box::new(healthy_endpoints.clone()))?;

        let monitored_endpoints = IntGaugeVec::new(
            Opts::new(
                "hc_monitored_endpoints",
                "Number of endpoints with a live health checker",
            ),
            &["group"],
        )?;
        registry.register(Box::new(monitored_endpoints.clone()))?;

        let snapshots_published_total = IntCounterVec::new(
            Opts::new(
                "hc_snapshots_published_total",
                "Healthy endpoint snapshots published to listeners",
            ),
            &["group"],
        )?;
        registry.register(Box::new(snapshots_published_total.clone()))?;

        let endpoint_health_status = IntGaugeVec::new(
            Opts::new(
                "hc_endpoint_health_status",
                "Endpoint health status (1=healthy, 0=unhealthy)",
            ),
            &["group", "endpoint"],
        )?;
        registry.register(Box::new(endpoint_health_status.clone()))?;

        let health_updates_total = IntCounterVec::new(
            Opts::new("hc_health_updates_total", "Health updates applied"),
            &["group", "result"],
        )?;
        registry.register(Box::new(health_updates_total.clone()))?;

        let checkers_created_total = IntCounterVec::new(
            Opts::new("hc_checkers_created_total", "Health checkers created"),
            &["group"],
        )?;
        registry.register(Box::new(checkers_created_total.clone()))?;

        let checker_failures_total = IntCounterVec::new(
            Opts::new(
                "hc_checker_failures_total",
                "Health checker failures (stage=create|close)",
            ),
            &["group", "stage"],
        )?;
        registry.register(Box::new(checker_failures_total.clone()))?;

        Ok(Self {
            healthy_endpoints,
            monitored_endpoints,
            snapshots_published_total,
            endpoint_health_status,
            health_updates_total,
            checkers_created_total,
            checker_failures_total,
        })
    }

    pub fn record_snapshot(&self, group: &str, healthy: usize, monitored: usize) {
        self.healthy_endpoints
            .with_label_values(&[group])
            .set(healthy as i64);
        self.monitored_endpoints
            .with_label_values(&[group])
            .set(monitored as i64);
        self.snapshots_published_total
            .with_label_values(&[group])
            .inc();
    }

    pub fn record_health_update(&self, group: &str, endpoint: &str, healthy: bool) {
        let result = if healthy { "healthy" } else { "unhealthy" };
        self.health_updates_total
            .with_label_values(&[group, result])
            .inc();
        self.endpoint_health_status
            .with_label_values(&[group, endpoint])
            .set(if healthy { 1 } else { 0 });
    }

    pub fn record_checker_created(&self, group: &str) {
        self.checkers_created_total.with_label_values(&[group]).inc();
    }

    pub fn record_checker_failure(&self, group: &str, stage: &str) {
        self.checker_failures_total
            .with_label_values(&[group, stage])
            .inc();
    }

    pub fn forget_endpoint(&self, group: &str, endpoint: &str) {
        let _ = self
            .endpoint_health_status
            .remove_label_values(&[group, endpoint]);
    }

    pub fn update_monitored(&self, group: &str, monitored: usize) {
        self.monitored_endpoints
            .with_label_values(&[group])
            .set(monitored as i64);
    }
}
