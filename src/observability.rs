use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (booked, rescheduled,
/// skipped, conflict, no_alternative, lock_timeout).
pub const RESERVATIONS_TOTAL: &str = "slotwise_reservations_total";

/// Histogram: reserve latency in seconds.
pub const RESERVE_DURATION_SECONDS: &str = "slotwise_reserve_duration_seconds";

/// Counter: series created.
pub const SERIES_CREATED_TOTAL: &str = "slotwise_series_created_total";

/// Histogram: occurrences booked per series generation.
pub const SERIES_BATCH_SIZE: &str = "slotwise_series_batch_size";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotwise_tenants_active";

/// Counter: blackout reconciliation passes run.
pub const RECONCILE_RUNS_TOTAL: &str = "slotwise_reconcile_runs_total";

/// Counter: appointments auto-rescheduled by the reconciler.
pub const RECONCILE_MOVED_TOTAL: &str = "slotwise_reconcile_moved_total";

/// Counter: appointments flagged for manual review by the reconciler.
pub const RECONCILE_FLAGGED_TOTAL: &str = "slotwise_reconcile_flagged_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "slotwise_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "slotwise_journal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
