use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::*;
use crate::model::*;
use crate::observability::AVAILABILITY_CHECKS_TOTAL;

use super::availability::{group_by_day, open_slots};
use super::conflict::{Purpose, now, resolve, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Verdict for a fresh request at `[start, end)`. Read-only.
    pub async fn check_availability(
        &self,
        tutor_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Verdict, EngineError> {
        let span = validate_span(start, end)?;
        let shard = self
            .store
            .tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = shard.read().await;
        let verdict = resolve(&guard, &span, Purpose::Request, self.zone, now());
        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "verdict" => verdict.label()).increment(1);
        Ok(verdict)
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let tutor_id = self
            .store
            .tutor_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let shard = self
            .store
            .tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = shard.read().await;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Bookings matching `filter`, ordered by start.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        if let Some(within) = &filter.within
            && within.duration() > chrono::Duration::days(MAX_QUERY_DAYS)
        {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let tutor_ids = match filter.tutor_id {
            Some(id) => vec![id],
            None => self.store.tutor_ids(),
        };

        let mut found = Vec::new();
        for tutor_id in tutor_ids {
            let Some(shard) = self.store.tutor(&tutor_id) else {
                continue;
            };
            let guard = shard.read().await;
            match &filter.within {
                Some(within) => found.extend(
                    guard
                        .overlapping(within)
                        .filter(|b| filter.matches(b))
                        .cloned(),
                ),
                None => found.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned()),
            }
        }
        found.sort_by_key(|b| (b.span.start, b.id));
        Ok(found)
    }

    /// `list_bookings` narrowed to what the principal may see: students
    /// their own bookings, tutors their own schedule, admins everything.
    pub async fn visible_bookings(
        &self,
        principal: &Principal,
        mut filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        match self.store.account(&principal.account) {
            Some(account) if account.role() == principal.role => {}
            _ => return Err(EngineError::Forbidden("unknown principal")),
        }
        match principal.role {
            Role::Student => filter.student_id = Some(principal.account),
            Role::Tutor => filter.tutor_id = Some(principal.account),
            Role::Admin => {}
        }
        self.list_bookings(&filter).await
    }

    /// A tutor's windows grouped by weekday, Monday first.
    pub async fn list_windows(&self, tutor_id: Ulid) -> Result<Vec<DaySchedule>, EngineError> {
        let shard = self
            .store
            .tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = shard.read().await;
        Ok(group_by_day(&guard.windows))
    }

    /// Bookable stretches on `date` (a local date in the scheduling offset).
    pub async fn open_slots(&self, tutor_id: Ulid, date: NaiveDate) -> Result<Vec<OpenSlot>, EngineError> {
        let shard = self
            .store
            .tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = shard.read().await;
        Ok(open_slots(&guard, date, self.zone, now()))
    }
}
