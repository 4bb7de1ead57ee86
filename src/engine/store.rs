use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedTutorState = Arc<RwLock<TutorState>>;

/// In-memory record store: tutor shards, the directory, and reverse
/// indexes. Applies events; makes no decisions.
pub struct Store {
    tutors: DashMap<Ulid, SharedTutorState>,
    accounts: DashMap<Ulid, Account>,
    /// Lowercased email → account id.
    emails: DashMap<String, Ulid>,
    nuids: DashMap<String, Ulid>,
    locations: DashMap<Ulid, Location>,
    courses: DashMap<Ulid, Course>,
    /// Course id → enrolled students and assigned tutors.
    rosters: DashMap<Ulid, CourseRoster>,
    /// Reverse lookups: booking/window id → tutor id.
    booking_to_tutor: DashMap<Ulid, Ulid>,
    window_to_tutor: DashMap<Ulid, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            tutors: DashMap::new(),
            accounts: DashMap::new(),
            emails: DashMap::new(),
            nuids: DashMap::new(),
            locations: DashMap::new(),
            courses: DashMap::new(),
            rosters: DashMap::new(),
            booking_to_tutor: DashMap::new(),
            window_to_tutor: DashMap::new(),
        }
    }

    // ── Tutor shards ─────────────────────────────────────────

    pub fn tutor(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.tutors.get(id).map(|e| e.value().clone())
    }

    pub fn tutor_ids(&self) -> Vec<Ulid> {
        self.tutors.iter().map(|e| *e.key()).collect()
    }

    pub fn tutor_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_tutor.get(booking_id).map(|e| *e.value())
    }

    pub fn tutor_for_window(&self, window_id: &Ulid) -> Option<Ulid> {
        self.window_to_tutor.get(window_id).map(|e| *e.value())
    }

    // ── Directory ────────────────────────────────────────────

    pub fn account(&self, id: &Ulid) -> Option<Account> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn account_by_nuid(&self, nuid: &str) -> Option<Account> {
        let id = *self.nuids.get(nuid)?.value();
        self.account(&id)
    }

    pub fn email_taken(&self, email: &str) -> bool {
        self.emails.contains_key(&email.to_lowercase())
    }

    pub fn nuid_taken(&self, nuid: &str) -> bool {
        self.nuids.contains_key(nuid)
    }

    pub fn accounts_with_role(&self, role: Role) -> Vec<Account> {
        let mut found: Vec<Account> = self
            .accounts
            .iter()
            .filter(|e| e.value().role() == role)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| (&a.last_name, &a.first_name).cmp(&(&b.last_name, &b.first_name)));
        found
    }

    pub fn location(&self, id: &Ulid) -> Option<Location> {
        self.locations.get(id).map(|e| e.value().clone())
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn course(&self, id: &Ulid) -> Option<Course> {
        self.courses.get(id).map(|e| e.value().clone())
    }

    pub fn course_count(&self) -> usize {
        self.courses.len()
    }

    pub fn roster(&self, course_id: &Ulid) -> CourseRoster {
        self.rosters
            .get(course_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Courses whose roster matches, ordered by course number.
    pub fn courses_where(&self, pred: impl Fn(&CourseRoster) -> bool) -> Vec<Course> {
        let mut found: Vec<Course> = self
            .rosters
            .iter()
            .filter(|e| pred(e.value()))
            .filter_map(|e| self.course(e.key()))
            .collect();
        found.sort_by(|a, b| (&a.course_number, a.id).cmp(&(&b.course_number, b.id)));
        found
    }

    /// Snapshot of directory records, for compaction.
    pub fn directory_events(&self) -> Vec<Event> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        accounts.sort_by_key(|a| a.id);
        let mut locations: Vec<Location> = self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|l| l.id);
        let mut courses: Vec<Course> = self.courses.iter().map(|e| e.value().clone()).collect();
        courses.sort_by_key(|c| c.id);
        let mut rosters: Vec<(Ulid, CourseRoster)> =
            self.rosters.iter().map(|e| (*e.key(), e.value().clone())).collect();
        rosters.sort_by_key(|(course_id, _)| *course_id);

        // Enrollment order within a roster is kept.
        let enrollments = rosters.into_iter().flat_map(|(course_id, roster)| {
            let students = roster
                .students
                .into_iter()
                .map(move |student_id| Event::StudentEnrolled { course_id, student_id });
            let tutors = roster
                .tutors
                .into_iter()
                .map(move |tutor_id| Event::TutorAssigned { course_id, tutor_id });
            students.chain(tutors)
        });

        accounts
            .into_iter()
            .map(|account| Event::AccountRegistered { account })
            .chain(locations.into_iter().map(|location| Event::LocationAdded { location }))
            .chain(courses.into_iter().map(|course| Event::CourseAdded { course }))
            .chain(enrollments)
            .collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a directory event. Registering a tutor opens its shard.
    pub fn apply_directory(&self, event: &Event) {
        match event {
            Event::AccountRegistered { account } => {
                self.emails.insert(account.email.to_lowercase(), account.id);
                self.nuids.insert(account.nuid.clone(), account.id);
                if account.role() == Role::Tutor {
                    self.tutors
                        .entry(account.id)
                        .or_insert_with(|| Arc::new(RwLock::new(TutorState::new(account.id))));
                }
                self.accounts.insert(account.id, account.clone());
            }
            Event::LocationAdded { location } => {
                self.locations.insert(location.id, location.clone());
            }
            Event::CourseAdded { course } => {
                self.courses.insert(course.id, course.clone());
            }
            Event::StudentEnrolled { course_id, student_id } => {
                let mut roster = self.rosters.entry(*course_id).or_default();
                if !roster.students.contains(student_id) {
                    roster.students.push(*student_id);
                }
            }
            Event::TutorAssigned { course_id, tutor_id } => {
                let mut roster = self.rosters.entry(*course_id).or_default();
                if !roster.tutors.contains(tutor_id) {
                    roster.tutors.push(*tutor_id);
                }
            }
            _ => {}
        }
    }

    /// Apply a tutor event to its shard. The caller holds the write lock.
    pub fn apply_to_tutor(&self, ts: &mut TutorState, event: &Event) {
        match event {
            Event::WindowAdded { window } => {
                self.window_to_tutor.insert(window.id, window.tutor_id);
                ts.insert_window(window.clone());
            }
            Event::WindowToggled { id, active, .. } => {
                if let Some(window) = ts.window_mut(id) {
                    window.active = *active;
                }
            }
            Event::WindowRemoved { id, .. } => {
                ts.remove_window(*id);
                self.window_to_tutor.remove(id);
            }
            Event::BookingCreated { booking } => {
                self.booking_to_tutor.insert(booking.id, booking.tutor_id);
                ts.insert_booking(booking.clone());
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(booking) = ts.booking_mut(id) {
                    booking.status = *status;
                }
            }
            Event::BookingRescheduled { id, span, .. } => {
                // Re-insert to keep the shard ordered by start.
                if let Some(mut booking) = ts.remove_booking(*id) {
                    booking.span = *span;
                    ts.insert_booking(booking);
                }
            }
            Event::ParticipantAdded { id, student_id, .. } => {
                if let Some(booking) = ts.booking_mut(id)
                    && !booking.students.contains(student_id)
                {
                    booking.students.push(*student_id);
                }
            }
            Event::AccountRegistered { .. }
            | Event::LocationAdded { .. }
            | Event::CourseAdded { .. }
            | Event::StudentEnrolled { .. }
            | Event::TutorAssigned { .. } => {}
        }
    }
}
