use tracing::info;
use ulid::Ulid;

use crate::auth::{Capability, Principal};
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn check_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(what));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_account(draft: &AccountDraft) -> Result<(), EngineError> {
    check_text(&draft.first_name, MAX_NAME_LEN, "first name")?;
    check_text(&draft.last_name, MAX_NAME_LEN, "last name")?;
    check_text(&draft.email, MAX_EMAIL_LEN, "email")?;
    if !draft.email.contains('@') {
        return Err(EngineError::InvalidInput("email"));
    }
    if draft.nuid.len() != NUID_LEN || !draft.nuid.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::InvalidInput("nuid must be 8 digits"));
    }
    match &draft.profile {
        Profile::Student { major, .. } => check_text(major, MAX_NAME_LEN, "major"),
        Profile::Tutor { bio } if bio.len() > MAX_TEXT_LEN => Err(EngineError::LimitExceeded("bio")),
        Profile::Tutor { .. } | Profile::Admin => Ok(()),
    }
}

impl Engine {
    pub async fn register_account(&self, principal: &Principal, draft: AccountDraft) -> Result<Account, EngineError> {
        self.authorize(principal, Capability::ManageDirectory)?;
        self.insert_account(draft).await
    }

    /// Create the deployment's admin unless that NUID is already registered.
    pub async fn bootstrap_admin(&self, draft: AccountDraft) -> Result<Account, EngineError> {
        if draft.profile != Profile::Admin {
            return Err(EngineError::InvalidInput("bootstrap account must be an admin"));
        }
        match self.store.account_by_nuid(&draft.nuid) {
            Some(existing) if existing.role() == Role::Admin => Ok(existing),
            Some(_) => Err(EngineError::Duplicate("nuid")),
            None => self.insert_account(draft).await,
        }
    }

    async fn insert_account(&self, draft: AccountDraft) -> Result<Account, EngineError> {
        validate_account(&draft)?;
        let _gate = self.gate.read().await;
        let _directory = self.directory_lock.lock().await;
        if self.store.account_count() >= MAX_ACCOUNTS {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        if self.store.email_taken(&draft.email) {
            return Err(EngineError::Duplicate("email"));
        }
        if self.store.nuid_taken(&draft.nuid) {
            return Err(EngineError::Duplicate("nuid"));
        }

        let account = Account {
            id: Ulid::new(),
            first_name: draft.first_name,
            last_name: draft.last_name,
            email: draft.email,
            nuid: draft.nuid,
            profile: draft.profile,
        };
        self.persist_directory(&Event::AccountRegistered {
            account: account.clone(),
        })
        .await?;
        info!(account = %account.id, role = ?account.role(), "account registered");
        Ok(account)
    }

    pub async fn add_location(
        &self,
        principal: &Principal,
        name: String,
        modality: Modality,
        join_link: Option<String>,
    ) -> Result<Location, EngineError> {
        self.authorize(principal, Capability::ManageDirectory)?;
        check_text(&name, MAX_LOCATION_NAME_LEN, "location name")?;
        if let Some(link) = &join_link {
            check_text(link, MAX_JOIN_LINK_LEN, "join link")?;
        }

        let _gate = self.gate.read().await;
        let _directory = self.directory_lock.lock().await;
        if self.store.location_count() >= MAX_LOCATIONS {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        let location = Location {
            id: Ulid::new(),
            name,
            modality,
            join_link,
        };
        self.persist_directory(&Event::LocationAdded {
            location: location.clone(),
        })
        .await?;
        Ok(location)
    }

    pub async fn add_course(
        &self,
        principal: &Principal,
        course_number: String,
        title: String,
        description: String,
        semester: String,
    ) -> Result<Course, EngineError> {
        self.authorize(principal, Capability::ManageDirectory)?;
        check_text(&course_number, MAX_COURSE_NUMBER_LEN, "course number")?;
        check_text(&title, MAX_COURSE_TITLE_LEN, "course title")?;
        check_text(&semester, MAX_SEMESTER_LEN, "semester")?;
        if description.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("course description"));
        }

        let _gate = self.gate.read().await;
        let _directory = self.directory_lock.lock().await;
        if self.store.course_count() >= MAX_COURSES {
            return Err(EngineError::LimitExceeded("too many courses"));
        }
        let course = Course {
            id: Ulid::new(),
            course_number,
            title,
            description,
            semester,
        };
        self.persist_directory(&Event::CourseAdded { course: course.clone() })
            .await?;
        Ok(course)
    }

    /// Enroll a student in a course. Enrolling twice is a no-op.
    pub async fn enroll_student(
        &self,
        principal: &Principal,
        course_id: Ulid,
        student_id: Ulid,
    ) -> Result<CourseRoster, EngineError> {
        self.authorize(principal, Capability::ManageDirectory)?;
        let _gate = self.gate.read().await;
        let _directory = self.directory_lock.lock().await;
        self.course(&course_id)?;
        self.account_with_role(&student_id, Role::Student)?;

        let roster = self.store.roster(&course_id);
        if roster.students.contains(&student_id) {
            return Ok(roster);
        }
        if roster.students.len() >= MAX_ROSTER_SIZE {
            return Err(EngineError::LimitExceeded("too many students in course"));
        }
        self.persist_directory(&Event::StudentEnrolled { course_id, student_id })
            .await?;
        info!(course = %course_id, student = %student_id, "student enrolled");
        Ok(self.store.roster(&course_id))
    }

    /// Assign a tutor to a course. Assigning twice is a no-op.
    pub async fn assign_tutor(
        &self,
        principal: &Principal,
        course_id: Ulid,
        tutor_id: Ulid,
    ) -> Result<CourseRoster, EngineError> {
        self.authorize(principal, Capability::ManageDirectory)?;
        let _gate = self.gate.read().await;
        let _directory = self.directory_lock.lock().await;
        self.course(&course_id)?;
        self.account_with_role(&tutor_id, Role::Tutor)?;

        let roster = self.store.roster(&course_id);
        if roster.tutors.contains(&tutor_id) {
            return Ok(roster);
        }
        if roster.tutors.len() >= MAX_ROSTER_SIZE {
            return Err(EngineError::LimitExceeded("too many tutors in course"));
        }
        self.persist_directory(&Event::TutorAssigned { course_id, tutor_id })
            .await?;
        info!(course = %course_id, tutor = %tutor_id, "tutor assigned");
        Ok(self.store.roster(&course_id))
    }

    pub fn course_roster(&self, course_id: &Ulid) -> Result<CourseRoster, EngineError> {
        self.course(course_id)?;
        Ok(self.store.roster(course_id))
    }

    /// Courses a tutor is assigned to, ordered by course number.
    pub fn taught_courses(&self, tutor_id: &Ulid) -> Result<Vec<Course>, EngineError> {
        self.account_with_role(tutor_id, Role::Tutor)?;
        Ok(self.store.courses_where(|r| r.tutors.contains(tutor_id)))
    }

    pub fn enrolled_courses(&self, student_id: &Ulid) -> Result<Vec<Course>, EngineError> {
        self.account_with_role(student_id, Role::Student)?;
        Ok(self.store.courses_where(|r| r.students.contains(student_id)))
    }

    pub fn account(&self, id: &Ulid) -> Result<Account, EngineError> {
        self.store.account(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn location(&self, id: &Ulid) -> Result<Location, EngineError> {
        self.store.location(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn course(&self, id: &Ulid) -> Result<Course, EngineError> {
        self.store.course(id).ok_or(EngineError::NotFound(*id))
    }

    /// Tutors ordered by last name, then first name.
    pub fn list_tutors(&self) -> Vec<Account> {
        self.store.accounts_with_role(Role::Tutor)
    }

    /// The account behind `id`, which must hold `role`.
    pub(super) fn account_with_role(&self, id: &Ulid, role: Role) -> Result<Account, EngineError> {
        match self.store.account(id) {
            Some(account) if account.role() == role => Ok(account),
            _ => Err(EngineError::NotFound(*id)),
        }
    }
}
