use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "classroomd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "classroomd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "classroomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "classroomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "classroomd_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "classroomd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "classroomd_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "classroomd_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservation requests accepted as pending.
pub const RESERVATIONS_CREATED_TOTAL: &str = "classroomd_reservations_created_total";

/// Counter: creates and edits refused because the slot was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "classroomd_reservation_conflicts_total";

/// Counter: status changes. Labels: status (the new one).
pub const STATUS_TRANSITIONS_TOTAL: &str = "classroomd_status_transitions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertClassroom { .. } => "insert_classroom",
        Command::InsertReservation(_) => "insert_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::EditReservation { .. } => "edit_reservation",
        Command::SelectClassrooms => "select_classrooms",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOccupiedSlots { .. } => "select_occupied_slots",
        Command::SelectAvailableClassrooms { .. } => "select_available_classrooms",
        Command::SelectCanModify { .. } => "select_can_modify",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::SelectUnreadCount { .. } => "select_unread_count",
        Command::MarkNotificationRead { .. } => "mark_notification_read",
        Command::MarkAllNotificationsRead { .. } => "mark_all_notifications_read",
        Command::DeleteNotification { .. } => "delete_notification",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
