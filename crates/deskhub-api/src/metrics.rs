use prometheus::{
    register_gauge_with_registry, register_int_counter_with_registry, Encoder, Gauge, IntCounter,
    Registry, TextEncoder,
};
use std::sync::Arc;

use crate::presence::DrainReport;

pub struct ApiMetrics {
    pub heartbeats: IntCounter,
    pub heartbeats_dropped: IntCounter,
    pub cached_peers: Gauge,
    pub presence_persisted: IntCounter,
    pub presence_retried: IntCounter,
    pub presence_superseded: IntCounter,
    pub login_failures: IntCounter,
    pub login_lockouts: IntCounter,
    pub limiter_windows: Gauge,
    pub registry: Arc<Registry>,
}

impl ApiMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let heartbeats = register_int_counter_with_registry!(
            "deskhub_heartbeats_total",
            "Heartbeats accepted into the presence cache",
            registry
        )?;

        let heartbeats_dropped = register_int_counter_with_registry!(
            "deskhub_heartbeats_dropped_total",
            "Heartbeats dropped (empty or unknown peer, store unreachable)",
            registry
        )?;

        let cached_peers = register_gauge_with_registry!(
            "deskhub_presence_cached_peers",
            "Peers with presence not yet written to the database",
            registry
        )?;

        let presence_persisted = register_int_counter_with_registry!(
            "deskhub_presence_persisted_total",
            "Presence records written to the database",
            registry
        )?;

        let presence_retried = register_int_counter_with_registry!(
            "deskhub_presence_retried_total",
            "Presence writes that failed and were re-queued",
            registry
        )?;

        let presence_superseded = register_int_counter_with_registry!(
            "deskhub_presence_superseded_total",
            "Failed presence writes replaced by a newer heartbeat",
            registry
        )?;

        let login_failures = register_int_counter_with_registry!(
            "deskhub_login_failures_total",
            "Failed login attempts",
            registry
        )?;

        let login_lockouts = register_int_counter_with_registry!(
            "deskhub_login_lockouts_total",
            "Login attempts rejected because the client is locked out",
            registry
        )?;

        let limiter_windows = register_gauge_with_registry!(
            "deskhub_login_limiter_windows",
            "Client IPs tracked by the login limiter",
            registry
        )?;

        Ok(Self {
            heartbeats,
            heartbeats_dropped,
            cached_peers,
            presence_persisted,
            presence_retried,
            presence_superseded,
            login_failures,
            login_lockouts,
            limiter_windows,
            registry,
        })
    }

    pub fn record_drain(&self, report: &DrainReport, cached: usize) {
        self.presence_persisted.inc_by(report.persisted as u64);
        self.presence_retried.inc_by(report.retried as u64);
        self.presence_superseded.inc_by(report.superseded as u64);
        self.cached_peers.set(cached as f64);
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
