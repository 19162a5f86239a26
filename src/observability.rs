use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "trialdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "trialdesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "trialdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "trialdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "trialdesk_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "trialdesk_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "trialdesk_auth_failures_total";

/// Counter: assignment retries after a lost reservation race.
pub const ASSIGN_RETRIES_TOTAL: &str = "trialdesk_assign_retries_total";

/// Counter: reschedules that failed compensation and left a record
/// needing manual reconciliation.
pub const RESCHEDULE_INCONSISTENT_TOTAL: &str = "trialdesk_reschedule_inconsistent_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "trialdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "trialdesk_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTeacher { .. } => "insert_teacher",
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertTrial(_) => "insert_trial",
        Command::InsertFamily(_) => "insert_family",
        Command::UpdateStatus { .. } => "update_status",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::InsertSession { .. } => "insert_session",
        Command::CompleteSession { .. } => "complete_session",
        Command::SelectTeachers => "select_teachers",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectHistory { .. } => "select_history",
    }
}
