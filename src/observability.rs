use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, table, status.
pub const QUERIES_TOTAL: &str = "gatehouse_queries_total";

/// Histogram: query latency in seconds. Labels: command, table.
pub const QUERY_DURATION_SECONDS: &str = "gatehouse_query_duration_seconds";

/// Counter: events refused by the admission pipeline. Labels: check.
pub const ADMISSION_REJECTIONS_TOTAL: &str = "gatehouse_admission_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gatehouse_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gatehouse_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gatehouse_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gatehouse_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (changes per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gatehouse_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "gatehouse_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short verb label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPlace(_) | Command::InsertEvent(_) | Command::InsertChild { .. } => "insert",
        Command::UpdatePlace { .. } | Command::UpdateEvent { .. } | Command::UpdateChild { .. } => {
            "update"
        }
        Command::Delete { .. } => "delete",
        Command::Find { .. } => "find",
        Command::ListPlaces(_) | Command::ListEvents { .. } | Command::ListChildren { .. } => "list",
    }
}

/// The table a command targets, as a metrics label.
pub fn command_table(cmd: &Command) -> &'static str {
    cmd.table().name()
}
