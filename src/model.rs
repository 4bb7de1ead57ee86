use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` between two instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// Wire form of a weekday: 0 = Monday .. 6 = Sunday.
pub fn weekday_from_index(day: u8) -> Option<Weekday> {
    match day {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_monday() as u8
}

// ── Directory ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Tutor,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Student { major: String, class_year: i32 },
    Tutor { bio: String },
    Admin,
}

impl Profile {
    pub fn role(&self) -> Role {
        match self {
            Profile::Student { .. } => Role::Student,
            Profile::Tutor { .. } => Role::Tutor,
            Profile::Admin => Role::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub nuid: String,
    pub profile: Profile,
}

impl Account {
    pub fn role(&self) -> Role {
        self.profile.role()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Everything needed to register an account except its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDraft {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub nuid: String,
    pub profile: Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    InPerson,
    Online,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
    pub modality: Modality,
    pub join_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: Ulid,
    pub course_number: String,
    pub title: String,
    pub description: String,
    pub semester: String,
}

/// Who takes and who teaches a course.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRoster {
    pub students: Vec<Ulid>,
    pub tutors: Vec<Ulid>,
}

// ── Availability ─────────────────────────────────────────────────

/// A recurring weekly range in which a tutor accepts bookings.
/// Times are local to the engine's scheduling offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub active: bool,
}

impl AvailabilityWindow {
    /// Same-day overlap on the time-of-day axis.
    pub fn overlaps(&self, start: NaiveTime, end: NaiveTime) -> bool {
        start < self.end && end > self.start
    }

    pub fn covers(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start <= start && self.end >= end
    }

    fn sort_key(&self) -> (u32, NaiveTime) {
        (self.day.num_days_from_monday(), self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub day: Weekday,
    pub windows: Vec<AvailabilityWindow>,
}

/// A bookable stretch of time on a concrete date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSlot {
    pub window_id: Ulid,
    pub span: Span,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub students: Vec<Ulid>,
    pub course_id: Option<Ulid>,
    pub location_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub booked_at: DateTime<Utc>,
}

impl Booking {
    pub fn has_participant(&self, student_id: &Ulid) -> bool {
        self.students.contains(student_id)
    }
}

/// Caller-supplied fields of a new booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub tutor_id: Ulid,
    pub students: Vec<Ulid>,
    pub course_id: Option<Ulid>,
    pub location_id: Ulid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Every field narrows the result; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFilter {
    pub tutor_id: Option<Ulid>,
    pub student_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    pub within: Option<Span>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.tutor_id.is_none_or(|t| booking.tutor_id == t)
            && self.student_id.is_none_or(|s| booking.has_participant(&s))
            && self.status.is_none_or(|s| booking.status == s)
            && self.within.is_none_or(|w| w.overlaps(&booking.span))
    }
}

/// Outcome of the conflict resolver for a candidate span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Legal,
    PastTime,
    OutsideAvailability,
    TimeConflict { booking_id: Ulid },
}

// ── Per-tutor state ──────────────────────────────────────────────

/// One tutor's windows and bookings. Guarded as a unit so that
/// check-then-write sequences see a stable view.
#[derive(Debug, Clone)]
pub struct TutorState {
    pub id: Ulid,
    /// Sorted by `(day, start)`.
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl TutorState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            windows: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let key = window.sort_key();
        let pos = self.windows.partition_point(|w| w.sort_key() <= key);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn window_mut(&mut self, id: &Ulid) -> Option<&mut AvailabilityWindow> {
        self.windows.iter_mut().find(|w| w.id == *id)
    }

    pub fn windows_on(&self, day: Weekday) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter().filter(move |w| w.day == day)
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The journal record format. Flat, no nesting of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountRegistered {
        account: Account,
    },
    LocationAdded {
        location: Location,
    },
    CourseAdded {
        course: Course,
    },
    StudentEnrolled {
        course_id: Ulid,
        student_id: Ulid,
    },
    TutorAssigned {
        course_id: Ulid,
        tutor_id: Ulid,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowToggled {
        id: Ulid,
        tutor_id: Ulid,
        active: bool,
    },
    WindowRemoved {
        id: Ulid,
        tutor_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        tutor_id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        tutor_id: Ulid,
        span: Span,
    },
    ParticipantAdded {
        id: Ulid,
        tutor_id: Ulid,
        student_id: Ulid,
    },
}

impl Event {
    /// The tutor shard an event applies to, if any.
    pub fn tutor_id(&self) -> Option<Ulid> {
        match self {
            Event::WindowAdded { window } => Some(window.tutor_id),
            Event::BookingCreated { booking } => Some(booking.tutor_id),
            Event::WindowToggled { tutor_id, .. }
            | Event::WindowRemoved { tutor_id, .. }
            | Event::BookingStatusChanged { tutor_id, .. }
            | Event::BookingRescheduled { tutor_id, .. }
            | Event::ParticipantAdded { tutor_id, .. } => Some(*tutor_id),
            Event::AccountRegistered { .. }
            | Event::LocationAdded { .. }
            | Event::CourseAdded { .. }
            | Event::StudentEnrolled { .. }
            | Event::TutorAssigned { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2099, 1, 5, h, m, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn booking(start: DateTime<Utc>, end: DateTime<Utc>) -> Booking {
        Booking {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            students: vec![Ulid::new()],
            course_id: None,
            location_id: Ulid::new(),
            span: Span::new(start, end),
            status: BookingStatus::Pending,
            booked_at: at(0, 0),
        }
    }

    #[test]
    fn span_touching_does_not_overlap() {
        let a = Span::new(at(14, 0), at(15, 0));
        let b = Span::new(at(15, 0), at(16, 0));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn span_partial_overlap() {
        let a = Span::new(at(14, 0), at(15, 0));
        let b = Span::new(at(14, 30), at(15, 30));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn window_covers_is_inclusive_at_both_ends() {
        let w = AvailabilityWindow {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            day: Weekday::Mon,
            start: t(9, 0),
            end: t(12, 0),
            active: true,
        };
        assert!(w.covers(t(9, 0), t(12, 0)));
        assert!(w.covers(t(10, 0), t(11, 0)));
        assert!(!w.covers(t(11, 30), t(12, 30)));
        assert!(!w.covers(t(8, 59), t(10, 0)));
        assert!(w.overlaps(t(11, 0), t(13, 0)));
        assert!(!w.overlaps(t(12, 0), t(13, 0)));
    }

    #[test]
    fn weekday_index_roundtrip() {
        for i in 0..7u8 {
            let day = weekday_from_index(i).unwrap();
            assert_eq!(weekday_index(day), i);
        }
        assert_eq!(weekday_from_index(0), Some(Weekday::Mon));
        assert_eq!(weekday_from_index(7), None);
    }

    #[test]
    fn tutor_state_keeps_windows_sorted() {
        let tutor = Ulid::new();
        let mut ts = TutorState::new(tutor);
        for (day, start, end) in [
            (Weekday::Wed, t(9, 0), t(10, 0)),
            (Weekday::Mon, t(13, 0), t(14, 0)),
            (Weekday::Mon, t(8, 0), t(9, 0)),
        ] {
            ts.insert_window(AvailabilityWindow {
                id: Ulid::new(),
                tutor_id: tutor,
                day,
                start,
                end,
                active: true,
            });
        }
        let order: Vec<_> = ts.windows.iter().map(|w| (w.day, w.start)).collect();
        assert_eq!(
            order,
            vec![
                (Weekday::Mon, t(8, 0)),
                (Weekday::Mon, t(13, 0)),
                (Weekday::Wed, t(9, 0)),
            ]
        );
        assert_eq!(ts.windows_on(Weekday::Mon).count(), 2);
    }

    #[test]
    fn overlapping_skips_disjoint_bookings() {
        let mut ts = TutorState::new(Ulid::new());
        let early = booking(at(8, 0), at(9, 0));
        let mid = booking(at(10, 0), at(11, 0));
        let late = booking(at(12, 0), at(13, 0));
        let mid_id = mid.id;
        ts.insert_booking(late);
        ts.insert_booking(early);
        ts.insert_booking(mid);

        let hits: Vec<_> = ts
            .overlapping(&Span::new(at(9, 0), at(12, 0)))
            .map(|b| b.id)
            .collect();
        assert_eq!(hits, vec![mid_id]);
    }

    #[test]
    fn filter_matches_each_field() {
        let b = booking(at(10, 0), at(11, 0));
        let student = b.students[0];
        assert!(BookingFilter::default().matches(&b));
        assert!(
            BookingFilter {
                student_id: Some(student),
                status: Some(BookingStatus::Pending),
                ..Default::default()
            }
            .matches(&b)
        );
        assert!(
            !BookingFilter {
                status: Some(BookingStatus::Confirmed),
                ..Default::default()
            }
            .matches(&b)
        );
        assert!(
            !BookingFilter {
                within: Some(Span::new(at(11, 0), at(12, 0))),
                ..Default::default()
            }
            .matches(&b)
        );
    }
}
