use chrono::{DateTime, FixedOffset, Utc};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn validate_span(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Span, EngineError> {
    use crate::limits::MAX_BOOKING_HOURS;
    if start >= end {
        return Err(EngineError::InvalidRange);
    }
    let span = Span::new(start, end);
    if span.duration() > chrono::Duration::hours(MAX_BOOKING_HOURS) {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Why the resolver is being asked. Decides which checks run and
/// which booking, if any, is excluded from the double-booking scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Fresh student request: past-time, availability and conflict.
    Request,
    /// Admin-created confirmed booking: past-time and conflict.
    DirectConfirm,
    /// Pending → confirmed: conflict only.
    Accept(Ulid),
    /// Confirmed booking moves: past-time and conflict.
    Reschedule(Ulid),
}

impl Purpose {
    fn excluded(&self) -> Option<Ulid> {
        match self {
            Purpose::Accept(id) | Purpose::Reschedule(id) => Some(*id),
            Purpose::Request | Purpose::DirectConfirm => None,
        }
    }

    fn checks_past(&self) -> bool {
        !matches!(self, Purpose::Accept(_))
    }

    fn checks_availability(&self) -> bool {
        matches!(self, Purpose::Request)
    }
}

/// True if one active window of the candidate's local weekday wholly
/// contains it. Adjacent windows are not merged.
pub(crate) fn within_availability(ts: &TutorState, span: &Span, zone: FixedOffset) -> bool {
    let start = span.start.with_timezone(&zone);
    let end = span.end.with_timezone(&zone);
    if start.date_naive() != end.date_naive() {
        return false;
    }
    let day = chrono::Datelike::weekday(&start);
    let (start_time, end_time) = (start.time(), end.time());
    ts.windows_on(day)
        .any(|w| w.active && w.covers(start_time, end_time))
}

/// First confirmed booking overlapping `span`, skipping `exclude`.
pub(crate) fn find_conflict(ts: &TutorState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    ts.overlapping(span)
        .filter(|b| b.status == BookingStatus::Confirmed)
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

/// Run the guards for `purpose` in order: past-time, availability, conflict.
pub(crate) fn resolve(
    ts: &TutorState,
    span: &Span,
    purpose: Purpose,
    zone: FixedOffset,
    now: DateTime<Utc>,
) -> Verdict {
    if purpose.checks_past() && span.start <= now {
        return Verdict::PastTime;
    }
    if purpose.checks_availability() && !within_availability(ts, span, zone) {
        return Verdict::OutsideAvailability;
    }
    match find_conflict(ts, span, purpose.excluded()) {
        Some(booking_id) => Verdict::TimeConflict { booking_id },
        None => Verdict::Legal,
    }
}

impl Verdict {
    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            Verdict::Legal => Ok(()),
            Verdict::PastTime => Err(EngineError::PastTime),
            Verdict::OutsideAvailability => Err(EngineError::OutsideAvailability),
            Verdict::TimeConflict { booking_id } => Err(EngineError::TimeConflict(booking_id)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Legal => "legal",
            Verdict::PastTime => "past_time",
            Verdict::OutsideAvailability => "outside_availability",
            Verdict::TimeConflict { .. } => "time_conflict",
        }
    }
}
