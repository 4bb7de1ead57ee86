use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::Role;

/// The authenticated caller. Passed into every mutating engine call;
/// the engine keeps no session of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub account: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn student(account: Ulid) -> Self {
        Self {
            account,
            role: Role::Student,
        }
    }

    pub fn tutor(account: Ulid) -> Self {
        Self {
            account,
            role: Role::Tutor,
        }
    }

    pub fn admin(account: Ulid) -> Self {
        Self {
            account,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Role-level check. Ownership is checked by the operation itself.
    pub fn can(&self, capability: Capability) -> bool {
        capability.granted_to().contains(&self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Request a booking with a tutor.
    RequestBooking,
    /// Create a booking directly in the confirmed state.
    ConfirmDirectly,
    /// Accept, reject, or add participants to a tutor's booking.
    DecideBooking,
    /// Cancel or reschedule a booking one takes part in.
    ManageOwnBooking,
    /// Add, toggle, or remove availability windows.
    AuthorAvailability,
    /// Register accounts, locations, and courses.
    ManageDirectory,
}

impl Capability {
    pub fn granted_to(&self) -> &'static [Role] {
        match self {
            Capability::RequestBooking => &[Role::Student, Role::Admin],
            Capability::ConfirmDirectly => &[Role::Admin],
            Capability::DecideBooking => &[Role::Tutor, Role::Admin],
            Capability::ManageOwnBooking => &[Role::Student, Role::Admin],
            Capability::AuthorAvailability => &[Role::Tutor, Role::Admin],
            Capability::ManageDirectory => &[Role::Admin],
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Capability::RequestBooking => "only students may request bookings",
            Capability::ConfirmDirectly => "only admins may create confirmed bookings",
            Capability::DecideBooking => "only tutors may decide on bookings",
            Capability::ManageOwnBooking => "only students may manage their bookings",
            Capability::AuthorAvailability => "only tutors may edit availability",
            Capability::ManageDirectory => "only admins may manage accounts",
        }
    }
}
