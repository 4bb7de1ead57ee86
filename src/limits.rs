//! Hard caps enforced by the engine and the wire layer.

pub const MAX_ACCOUNTS: usize = 100_000;
pub const MAX_LOCATIONS: usize = 10_000;
pub const MAX_COURSES: usize = 10_000;
pub const MAX_WINDOWS_PER_TUTOR: usize = 256;
pub const MAX_BOOKINGS_PER_TUTOR: usize = 100_000;
pub const MAX_STUDENTS_PER_BOOKING: usize = 32;
pub const MAX_ROSTER_SIZE: usize = 2_000;

pub const MAX_NAME_LEN: usize = 80;
pub const MAX_EMAIL_LEN: usize = 100;
pub const MAX_LOCATION_NAME_LEN: usize = 120;
pub const MAX_JOIN_LINK_LEN: usize = 250;
pub const MAX_COURSE_NUMBER_LEN: usize = 10;
pub const MAX_COURSE_TITLE_LEN: usize = 50;
pub const MAX_SEMESTER_LEN: usize = 20;
pub const MAX_TEXT_LEN: usize = 4096;
pub const NUID_LEN: usize = 8;

/// A single appointment may not run longer than this.
pub const MAX_BOOKING_HOURS: i64 = 12;
/// Query windows for listings and open slots.
pub const MAX_QUERY_DAYS: i64 = 366;

/// Longest accepted wire line, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
