use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "freqd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "freqd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "freqd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "freqd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "freqd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "freqd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "freqd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "freqd_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "freqd_compactions_total";

// ── Allocation metrics ──────────────────────────────────────────

/// Counter: channels newly occupied by committed transactions.
pub const CHANNELS_ALLOCATED_TOTAL: &str = "freqd_channels_allocated_total";

/// Counter: channels released by committed transactions.
pub const CHANNELS_RELEASED_TOTAL: &str = "freqd_channels_released_total";

/// Counter: commits aborted because a value was taken concurrently.
pub const WRITE_CONFLICTS_TOTAL: &str = "freqd_write_conflicts_total";

/// Counter: requests refused for insufficient availability. Labels: policy.
pub const ALLOCATIONS_REJECTED_TOTAL: &str = "freqd_allocations_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBand { .. } => "insert_band",
        Command::DeleteBand { .. } => "delete_band",
        Command::SelectBands { .. } => "select_bands",
        Command::Allocate { request, .. } => match request.policy_name() {
            "all" => "allocate_all",
            _ => "allocate_first_n",
        },
        Command::PreviewSpaced { .. } => "preview_spaced",
        Command::Confirm { .. } => "confirm",
        Command::Deallocate { .. } => "deallocate",
        Command::Debar { .. } => "debar",
        Command::Allow { .. } => "allow",
        Command::ReleaseChannel { .. } => "release_channel",
        Command::ReleaseHolder { .. } => "release_holder",
        Command::SelectAvailable { .. } => "select_available",
        Command::SelectChannels { .. } => "select_channels",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectHistory { .. } => "select_history",
    }
}
