use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spotbook_query_duration_seconds";

// ── Allocation metrics ──────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "spotbook_bookings_confirmed_total";

/// Counter: book attempts that found the interval already taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "spotbook_booking_conflicts_total";

/// Counter: bookings cancelled.
pub const CANCELLATIONS_TOTAL: &str = "spotbook_cancellations_total";

/// Counter: notifications queued by the subscription matcher.
pub const NOTIFICATIONS_QUEUED_TOTAL: &str = "spotbook_notifications_queued_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spotbook_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "spotbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
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
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::InsertInterval { .. } => "insert_interval",
        Command::DeleteInterval { .. } => "delete_interval",
        Command::SelectIntervals { .. } => "select_intervals",
        Command::SelectFreeIntervals { .. } => "select_free_intervals",
        Command::SelectAvailableResources { .. } => "select_available_resources",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::UpdatePaymentStatus { .. } => "update_payment_status",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::DeleteSubscription { .. } => "delete_subscription",
        Command::SelectSubscriptions { .. } => "select_subscriptions",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::MarkNotificationsRead { .. } => "mark_notifications_read",
        Command::SelectQuote { .. } => "select_quote",
    }
}
