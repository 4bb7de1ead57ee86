use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Start is not strictly before end.
    InvalidRange,
    /// Clashes with an active availability window of the same tutor and day.
    Overlap(Ulid),
    PastTime,
    OutsideAvailability,
    /// Clashes with a confirmed booking of the same tutor.
    TimeConflict(Ulid),
    NotFound(Ulid),
    InvalidState {
        id: Ulid,
        status: BookingStatus,
    },
    Forbidden(&'static str),
    Duplicate(&'static str),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    JournalError(String),
}

impl EngineError {
    /// Stable discriminant for callers that map errors to messages.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRange => "invalid_range",
            EngineError::Overlap(_) => "overlap",
            EngineError::PastTime => "past_time",
            EngineError::OutsideAvailability => "outside_availability",
            EngineError::TimeConflict(_) => "time_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Duplicate(_) => "duplicate",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::JournalError(_) => "journal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange => write!(f, "start must be before end"),
            EngineError::Overlap(id) => {
                write!(f, "overlaps active availability window: {id}")
            }
            EngineError::PastTime => write!(f, "start time is not in the future"),
            EngineError::OutsideAvailability => {
                write!(f, "requested time is outside the tutor's availability")
            }
            EngineError::TimeConflict(id) => write!(f, "conflict with confirmed booking: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} is {status}; transition not allowed")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Duplicate(field) => write!(f, "{field} already registered"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
