use chrono::{DateTime, NaiveTime, Utc, Weekday};
use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::{Capability, Principal};
use crate::limits::*;
use crate::model::*;
use crate::notify::{Contact, Notification, NotificationKind};
use crate::observability::{BOOKING_TRANSITIONS_TOTAL, GUARD_REJECTIONS_TOTAL};

use super::availability::check_window;
use super::conflict::{Purpose, now, resolve, validate_span};
use super::{Engine, EngineError};

/// Tutors act on their own schedule only; admins act on any.
fn ensure_owner(principal: &Principal, tutor_id: Ulid) -> Result<(), EngineError> {
    if principal.is_admin() || principal.account == tutor_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden("not this tutor's schedule"))
    }
}

/// Students act on bookings they take part in; admins on any.
fn ensure_participant(principal: &Principal, booking: &Booking) -> Result<(), EngineError> {
    if principal.is_admin() || booking.has_participant(&principal.account) {
        Ok(())
    } else {
        Err(EngineError::Forbidden("not a participant of this booking"))
    }
}

fn expect_status(booking: &Booking, expected: BookingStatus) -> Result<(), EngineError> {
    if booking.status == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidState {
            id: booking.id,
            status: booking.status,
        })
    }
}

fn refused(err: EngineError, tutor_id: Ulid, action: &'static str) -> EngineError {
    metrics::counter!(GUARD_REJECTIONS_TOTAL, "action" => action, "reason" => err.code()).increment(1);
    debug!(tutor = %tutor_id, reason = err.code(), "{action} refused: {err}");
    err
}

fn transitioned(booking: &Booking, transition: &'static str) {
    metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "transition" => transition).increment(1);
    info!(
        booking = %booking.id,
        tutor = %booking.tutor_id,
        status = %booking.status,
        "booking {transition}"
    );
}

impl Engine {
    // ── Availability windows ─────────────────────────────────

    pub async fn add_window(
        &self,
        principal: &Principal,
        tutor_id: Ulid,
        day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<AvailabilityWindow, EngineError> {
        self.authorize(principal, Capability::AuthorAvailability)?;
        ensure_owner(principal, tutor_id)?;

        let _gate = self.gate.read().await;
        let mut guard = self.tutor_write(&tutor_id).await?;
        if guard.windows.len() >= MAX_WINDOWS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        check_window(&guard, day, start, end).map_err(|e| refused(e, tutor_id, "add_window"))?;

        let window = AvailabilityWindow {
            id: Ulid::new(),
            tutor_id,
            day,
            start,
            end,
            active: true,
        };
        self.persist_and_apply(&mut guard, &Event::WindowAdded { window: window.clone() })
            .await?;
        info!(window = %window.id, tutor = %tutor_id, ?day, %start, %end, "availability window added");
        Ok(window)
    }

    /// Flip a window's active flag. Siblings are not re-checked.
    pub async fn toggle_window(&self, principal: &Principal, window_id: Ulid) -> Result<AvailabilityWindow, EngineError> {
        self.authorize(principal, Capability::AuthorAvailability)?;

        let _gate = self.gate.read().await;
        let mut guard = self.window_write(&window_id).await?;
        let tutor_id = guard.id;
        ensure_owner(principal, tutor_id)?;
        let active = guard
            .windows
            .iter()
            .find(|w| w.id == window_id)
            .map(|w| w.active)
            .ok_or(EngineError::NotFound(window_id))?;

        let event = Event::WindowToggled {
            id: window_id,
            tutor_id,
            active: !active,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(window = %window_id, tutor = %tutor_id, active = !active, "availability window toggled");
        guard
            .window_mut(&window_id)
            .cloned()
            .ok_or(EngineError::NotFound(window_id))
    }

    pub async fn remove_window(&self, principal: &Principal, window_id: Ulid) -> Result<(), EngineError> {
        self.authorize(principal, Capability::AuthorAvailability)?;

        let _gate = self.gate.read().await;
        let mut guard = self.window_write(&window_id).await?;
        let tutor_id = guard.id;
        ensure_owner(principal, tutor_id)?;

        let event = Event::WindowRemoved { id: window_id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(window = %window_id, tutor = %tutor_id, "availability window removed");
        Ok(())
    }

    // ── Booking creation ─────────────────────────────────────

    /// Student request: lands `pending` if the slot is inside an active
    /// window and clear of confirmed bookings.
    pub async fn create_booking(&self, principal: &Principal, draft: BookingDraft) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::RequestBooking)?;
        if !principal.is_admin() && !draft.students.contains(&principal.account) {
            return Err(EngineError::Forbidden("students may only book for themselves"));
        }
        self.create_with(draft, Purpose::Request).await
    }

    /// Admin path: lands `confirmed` directly. Availability windows are
    /// not consulted; confirmed bookings still are.
    pub async fn create_confirmed_booking(&self, principal: &Principal, draft: BookingDraft) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::ConfirmDirectly)?;
        self.create_with(draft, Purpose::DirectConfirm).await
    }

    async fn create_with(&self, draft: BookingDraft, purpose: Purpose) -> Result<Booking, EngineError> {
        let span = validate_span(draft.start, draft.end)?;
        let mut students = draft.students;
        let mut seen = std::collections::HashSet::new();
        students.retain(|s| seen.insert(*s));
        if students.is_empty() {
            return Err(EngineError::InvalidInput("a booking needs at least one student"));
        }
        if students.len() > MAX_STUDENTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many students"));
        }
        for student in &students {
            self.account_with_role(student, Role::Student)?;
        }
        self.account_with_role(&draft.tutor_id, Role::Tutor)?;
        self.location(&draft.location_id)?;
        if let Some(course_id) = &draft.course_id {
            self.course(course_id)?;
        }

        let _gate = self.gate.read().await;
        let mut guard = self.tutor_write(&draft.tutor_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many bookings for tutor"));
        }
        let at = now();
        resolve(&guard, &span, purpose, self.zone, at)
            .into_result()
            .map_err(|e| refused(e, draft.tutor_id, "create"))?;

        let (status, kind, label) = match purpose {
            Purpose::DirectConfirm => (BookingStatus::Confirmed, NotificationKind::Confirmed, "created confirmed"),
            _ => (BookingStatus::Pending, NotificationKind::Requested, "requested"),
        };
        let booking = Booking {
            id: Ulid::new(),
            tutor_id: draft.tutor_id,
            students,
            course_id: draft.course_id,
            location_id: draft.location_id,
            span,
            status,
            booked_at: at,
        };
        self.persist_and_apply(&mut guard, &Event::BookingCreated { booking: booking.clone() })
            .await?;
        drop(guard);

        transitioned(&booking, label);
        self.publish(kind, &booking);
        Ok(booking)
    }

    // ── Tutor decisions ──────────────────────────────────────

    /// `pending` → `confirmed`, unless another confirmed booking now
    /// occupies the slot. Clashing pending siblings are left alone.
    pub async fn accept_booking(&self, principal: &Principal, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::DecideBooking)?;

        let _gate = self.gate.read().await;
        let mut guard = self.booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_owner(principal, booking.tutor_id)?;
        expect_status(&booking, BookingStatus::Pending)?;
        resolve(&guard, &booking.span, Purpose::Accept(booking_id), self.zone, now())
            .into_result()
            .map_err(|e| refused(e, booking.tutor_id, "accept"))?;

        let updated = self
            .set_status(&mut guard, booking, BookingStatus::Confirmed)
            .await?;
        drop(guard);

        transitioned(&updated, "accepted");
        self.publish(NotificationKind::Confirmed, &updated);
        Ok(updated)
    }

    pub async fn reject_booking(&self, principal: &Principal, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::DecideBooking)?;

        let _gate = self.gate.read().await;
        let mut guard = self.booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_owner(principal, booking.tutor_id)?;
        expect_status(&booking, BookingStatus::Pending)?;

        let updated = self
            .set_status(&mut guard, booking, BookingStatus::Rejected)
            .await?;
        transitioned(&updated, "rejected");
        Ok(updated)
    }

    /// Add another student to a live booking. Adding someone already
    /// listed changes nothing.
    pub async fn add_participant(
        &self,
        principal: &Principal,
        booking_id: Ulid,
        student_id: Ulid,
    ) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::DecideBooking)?;
        self.account_with_role(&student_id, Role::Student)?;

        let _gate = self.gate.read().await;
        let mut guard = self.booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_owner(principal, booking.tutor_id)?;
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: booking.status,
            });
        }
        if booking.has_participant(&student_id) {
            return Ok(booking);
        }
        if booking.students.len() >= MAX_STUDENTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many students"));
        }

        let event = Event::ParticipantAdded {
            id: booking_id,
            tutor_id: booking.tutor_id,
            student_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %booking_id, student = %student_id, "participant added");
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    // ── Student changes ──────────────────────────────────────

    /// `confirmed` → `cancelled`, only before the appointment starts.
    pub async fn cancel_booking(&self, principal: &Principal, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::ManageOwnBooking)?;

        let _gate = self.gate.read().await;
        let mut guard = self.booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_participant(principal, &booking)?;
        expect_status(&booking, BookingStatus::Confirmed)?;
        if booking.span.start <= now() {
            return Err(refused(EngineError::PastTime, booking.tutor_id, "cancel"));
        }

        let updated = self
            .set_status(&mut guard, booking, BookingStatus::Cancelled)
            .await?;
        transitioned(&updated, "cancelled");
        Ok(updated)
    }

    /// Move a confirmed booking in place. Availability windows are not
    /// re-checked; other confirmed bookings are.
    pub async fn reschedule_booking(
        &self,
        principal: &Principal,
        booking_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        self.authorize(principal, Capability::ManageOwnBooking)?;
        let span = validate_span(start, end)?;

        let _gate = self.gate.read().await;
        let mut guard = self.booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_participant(principal, &booking)?;
        expect_status(&booking, BookingStatus::Confirmed)?;
        resolve(&guard, &span, Purpose::Reschedule(booking_id), self.zone, now())
            .into_result()
            .map_err(|e| refused(e, booking.tutor_id, "reschedule"))?;

        let event = Event::BookingRescheduled {
            id: booking_id,
            tutor_id: booking.tutor_id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = Booking { span, ..booking };
        transitioned(&updated, "rescheduled");
        Ok(updated)
    }

    // ── Helpers ──────────────────────────────────────────────

    async fn set_status(
        &self,
        ts: &mut TutorState,
        booking: Booking,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let event = Event::BookingStatusChanged {
            id: booking.id,
            tutor_id: booking.tutor_id,
            status,
        };
        self.persist_and_apply(ts, &event).await?;
        Ok(Booking { status, ..booking })
    }

    fn publish(&self, kind: NotificationKind, booking: &Booking) {
        let Some(tutor) = self.store.account(&booking.tutor_id) else {
            return;
        };
        let students = booking
            .students
            .iter()
            .filter_map(|id| self.store.account(id))
            .map(|a| Contact::from(&a))
            .collect();
        self.notify.send(Notification {
            kind,
            booking: booking.clone(),
            tutor: Contact::from(&tutor),
            students,
            location: self.store.location(&booking.location_id),
        });
    }
}
