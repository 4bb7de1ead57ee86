use std::net::SocketAddr;

use crate::wire::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "tutorbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "tutorbook_request_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: availability checks. Labels: verdict.
pub const AVAILABILITY_CHECKS_TOTAL: &str = "tutorbook_availability_checks_total";

/// Counter: booking state changes. Labels: transition.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "tutorbook_booking_transitions_total";

/// Counter: mutations refused by a scheduling guard. Labels: action, reason.
pub const GUARD_REJECTIONS_TOTAL: &str = "tutorbook_guard_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tutorbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tutorbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tutorbook_connections_rejected_total";

/// Counter: failed password handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "tutorbook_auth_failures_total";

/// Counter: notifications handed to the delivery sink. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "tutorbook_notifications_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "tutorbook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "tutorbook_journal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn op_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Auth { .. } => "auth",
        Command::RegisterAccount { .. } => "register_account",
        Command::AddLocation { .. } => "add_location",
        Command::AddCourse { .. } => "add_course",
        Command::GetAccount { .. } => "get_account",
        Command::GetLocation { .. } => "get_location",
        Command::GetCourse { .. } => "get_course",
        Command::ListTutors => "list_tutors",
        Command::EnrollStudent { .. } => "enroll_student",
        Command::AssignTutor { .. } => "assign_tutor",
        Command::GetRoster { .. } => "get_roster",
        Command::TaughtCourses { .. } => "taught_courses",
        Command::EnrolledCourses { .. } => "enrolled_courses",
        Command::AddWindow { .. } => "add_window",
        Command::ToggleWindow { .. } => "toggle_window",
        Command::RemoveWindow { .. } => "remove_window",
        Command::ListWindows { .. } => "list_windows",
        Command::OpenSlots { .. } => "open_slots",
        Command::CheckAvailability { .. } => "check_availability",
        Command::CreateBooking { .. } => "create_booking",
        Command::CreateConfirmedBooking { .. } => "create_confirmed_booking",
        Command::AcceptBooking { .. } => "accept_booking",
        Command::RejectBooking { .. } => "reject_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::AddParticipant { .. } => "add_participant",
        Command::GetBooking { .. } => "get_booking",
        Command::ListBookings { .. } => "list_bookings",
        Command::Subscribe { .. } => "subscribe",
        Command::Unsubscribe => "unsubscribe",
    }
}
