use std::net::SocketAddr;

// ── Lease outcomes ──────────────────────────────────────────────

/// Counter: Acquire calls. Labels: outcome (acquired, conflict, error).
pub const LEASE_ACQUIRE_TOTAL: &str = "slotlease_acquire_total";

/// Counter: Release calls. Labels: outcome (released, not_held, error).
pub const LEASE_RELEASE_TOTAL: &str = "slotlease_release_total";

/// Histogram: conditional update round trip in seconds. Labels: op.
pub const STORE_OP_DURATION_SECONDS: &str = "slotlease_store_op_duration_seconds";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "slotlease_journal_flush_duration_seconds";

/// Histogram: records per journal flush.
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "slotlease_journal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
