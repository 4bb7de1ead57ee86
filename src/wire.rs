//! Newline-delimited JSON over TCP. One request object per line, one
//! reply object per line, in order. Notifications for a subscribed
//! connection are interleaved as `{"notification": ...}` lines.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{self, AUTH_FAILURES_TOTAL, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Auth {
        password: String,
    },

    // ── Directory ────────────────────────────────────────
    RegisterAccount {
        principal: Principal,
        account: AccountDraft,
    },
    AddLocation {
        principal: Principal,
        name: String,
        modality: Modality,
        #[serde(default)]
        join_link: Option<String>,
    },
    AddCourse {
        principal: Principal,
        course_number: String,
        title: String,
        #[serde(default)]
        description: String,
        semester: String,
    },
    GetAccount {
        id: Ulid,
    },
    GetLocation {
        id: Ulid,
    },
    GetCourse {
        id: Ulid,
    },
    ListTutors,
    EnrollStudent {
        principal: Principal,
        course_id: Ulid,
        student_id: Ulid,
    },
    AssignTutor {
        principal: Principal,
        course_id: Ulid,
        tutor_id: Ulid,
    },
    GetRoster {
        course_id: Ulid,
    },
    TaughtCourses {
        tutor_id: Ulid,
    },
    EnrolledCourses {
        student_id: Ulid,
    },

    // ── Availability ─────────────────────────────────────
    AddWindow {
        principal: Principal,
        tutor_id: Ulid,
        /// 0 = Monday .. 6 = Sunday.
        day: u8,
        start: NaiveTime,
        end: NaiveTime,
    },
    ToggleWindow {
        principal: Principal,
        window_id: Ulid,
    },
    RemoveWindow {
        principal: Principal,
        window_id: Ulid,
    },
    ListWindows {
        tutor_id: Ulid,
    },
    OpenSlots {
        tutor_id: Ulid,
        date: NaiveDate,
    },
    CheckAvailability {
        tutor_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    // ── Bookings ─────────────────────────────────────────
    CreateBooking {
        principal: Principal,
        booking: BookingDraft,
    },
    CreateConfirmedBooking {
        principal: Principal,
        booking: BookingDraft,
    },
    AcceptBooking {
        principal: Principal,
        booking_id: Ulid,
    },
    RejectBooking {
        principal: Principal,
        booking_id: Ulid,
    },
    CancelBooking {
        principal: Principal,
        booking_id: Ulid,
    },
    RescheduleBooking {
        principal: Principal,
        booking_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    AddParticipant {
        principal: Principal,
        booking_id: Ulid,
        student_id: Ulid,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ListBookings {
        principal: Principal,
        #[serde(default)]
        filter: BookingFilter,
    },

    // ── Notifications ────────────────────────────────────
    Subscribe {
        principal: Principal,
    },
    Unsubscribe,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl Reply {
    fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(failure: Failure) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: failure.code,
                message: failure.message,
            }),
        }
    }
}

#[derive(Serialize)]
struct Pushed<'a> {
    notification: &'a Notification,
}

/// A request that did not produce data.
#[derive(Debug)]
struct Failure {
    code: &'static str,
    message: String,
}

impl Failure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Self::new("internal", e.to_string())
    }
}

fn data<T: Serialize>(value: T) -> Result<Value, Failure> {
    Ok(serde_json::to_value(value)?)
}

fn weekday(day: u8) -> Result<chrono::Weekday, Failure> {
    weekday_from_index(day).ok_or_else(|| Failure::new("invalid_input", "day must be 0 (Monday) through 6 (Sunday)"))
}

/// Run one request against the engine.
async fn execute(engine: &Engine, cmd: Command) -> Result<Value, Failure> {
    match cmd {
        Command::Auth { .. } => Err(Failure::new("bad_request", "already authenticated")),

        Command::RegisterAccount { principal, account } => data(engine.register_account(&principal, account).await?),
        Command::AddLocation {
            principal,
            name,
            modality,
            join_link,
        } => data(engine.add_location(&principal, name, modality, join_link).await?),
        Command::AddCourse {
            principal,
            course_number,
            title,
            description,
            semester,
        } => data(
            engine
                .add_course(&principal, course_number, title, description, semester)
                .await?,
        ),
        Command::GetAccount { id } => data(engine.account(&id)?),
        Command::GetLocation { id } => data(engine.location(&id)?),
        Command::GetCourse { id } => data(engine.course(&id)?),
        Command::ListTutors => data(engine.list_tutors()),
        Command::EnrollStudent {
            principal,
            course_id,
            student_id,
        } => data(engine.enroll_student(&principal, course_id, student_id).await?),
        Command::AssignTutor {
            principal,
            course_id,
            tutor_id,
        } => data(engine.assign_tutor(&principal, course_id, tutor_id).await?),
        Command::GetRoster { course_id } => data(engine.course_roster(&course_id)?),
        Command::TaughtCourses { tutor_id } => data(engine.taught_courses(&tutor_id)?),
        Command::EnrolledCourses { student_id } => data(engine.enrolled_courses(&student_id)?),

        Command::AddWindow {
            principal,
            tutor_id,
            day,
            start,
            end,
        } => data(
            engine
                .add_window(&principal, tutor_id, weekday(day)?, start, end)
                .await?,
        ),
        Command::ToggleWindow { principal, window_id } => data(engine.toggle_window(&principal, window_id).await?),
        Command::RemoveWindow { principal, window_id } => {
            engine.remove_window(&principal, window_id).await?;
            Ok(Value::Null)
        }
        Command::ListWindows { tutor_id } => data(engine.list_windows(tutor_id).await?),
        Command::OpenSlots { tutor_id, date } => data(engine.open_slots(tutor_id, date).await?),
        Command::CheckAvailability { tutor_id, start, end } => {
            data(engine.check_availability(tutor_id, start, end).await?)
        }

        Command::CreateBooking { principal, booking } => data(engine.create_booking(&principal, booking).await?),
        Command::CreateConfirmedBooking { principal, booking } => {
            data(engine.create_confirmed_booking(&principal, booking).await?)
        }
        Command::AcceptBooking { principal, booking_id } => data(engine.accept_booking(&principal, booking_id).await?),
        Command::RejectBooking { principal, booking_id } => data(engine.reject_booking(&principal, booking_id).await?),
        Command::CancelBooking { principal, booking_id } => data(engine.cancel_booking(&principal, booking_id).await?),
        Command::RescheduleBooking {
            principal,
            booking_id,
            start,
            end,
        } => data(
            engine
                .reschedule_booking(&principal, booking_id, start, end)
                .await?,
        ),
        Command::AddParticipant {
            principal,
            booking_id,
            student_id,
        } => data(
            engine
                .add_participant(&principal, booking_id, student_id)
                .await?,
        ),
        Command::GetBooking { booking_id } => data(engine.get_booking(booking_id).await?),
        Command::ListBookings { principal, filter } => data(engine.visible_bookings(&principal, filter).await?),

        // Connection state; handled by the session loop.
        Command::Subscribe { .. } | Command::Unsubscribe => Err(Failure::new("bad_request", "not valid here")),
    }
}

/// Subscription for a notification feed: tutors get their own, admins
/// get everything. Students have no feed.
fn subscribe(engine: &Engine, principal: &Principal) -> Result<broadcast::Receiver<Notification>, Failure> {
    let account = engine
        .account(&principal.account)
        .map_err(|_| Failure::from(EngineError::Forbidden("unknown principal")))?;
    if account.role() != principal.role {
        return Err(EngineError::Forbidden("unknown principal").into());
    }
    match principal.role {
        Role::Admin => Ok(engine.notify.subscribe_all()),
        Role::Tutor => Ok(engine.notify.subscribe(principal.account)),
        Role::Student => Err(EngineError::Forbidden("students have no notification feed").into()),
    }
}

async fn next_notification(feed: &mut Option<broadcast::Receiver<Notification>>) -> Option<Notification> {
    let rx = feed.as_mut()?;
    loop {
        match rx.recv().await {
            Ok(n) => return Some(n),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("subscriber lagged, {skipped} notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn send_reply(framed: &mut Framed<TcpStream, LinesCodec>, reply: &Reply) -> Result<(), LinesCodecError> {
    let line = serde_json::to_string(reply).map_err(|e| LinesCodecError::Io(std::io::Error::other(e)))?;
    framed.send(line).await
}

/// Serve one client until it disconnects. The first line must be a
/// successful `auth`; a wrong password closes the connection.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: Arc<str>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut authenticated = false;
    let mut feed: Option<broadcast::Receiver<Notification>> = None;

    loop {
        let line = tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let failure = Failure::new("limit_exceeded", format!("line longer than {MAX_LINE_LEN} bytes"));
                    send_reply(&mut framed, &Reply::err(failure)).await?;
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            Some(notification) = next_notification(&mut feed) => {
                let line = serde_json::to_string(&Pushed { notification: &notification })
                    .map_err(|e| LinesCodecError::Io(std::io::Error::other(e)))?;
                framed.send(line).await?;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let cmd: Command = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                send_reply(&mut framed, &Reply::err(Failure::new("bad_request", e.to_string()))).await?;
                continue;
            }
        };

        if !authenticated {
            match cmd {
                Command::Auth { password: given } if *given == *password => {
                    authenticated = true;
                    send_reply(&mut framed, &Reply::ok(Value::Null)).await?;
                }
                Command::Auth { .. } => {
                    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                    send_reply(&mut framed, &Reply::err(Failure::new("auth_failed", "wrong password"))).await?;
                    return Ok(());
                }
                _ => {
                    let failure = Failure::new("unauthenticated", "first request must be auth");
                    send_reply(&mut framed, &Reply::err(failure)).await?;
                }
            }
            continue;
        }

        let op = observability::op_label(&cmd);
        let started = Instant::now();
        let result = match cmd {
            Command::Subscribe { principal } => subscribe(&engine, &principal).map(|rx| {
                feed = Some(rx);
                Value::Null
            }),
            Command::Unsubscribe => {
                feed = None;
                Ok(Value::Null)
            }
            cmd => execute(&engine, cmd).await,
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

        let reply = match result {
            Ok(value) => Reply::ok(value),
            Err(failure) => {
                debug!(op, code = failure.code, "request failed: {}", failure.message);
                Reply::err(failure)
            }
        };
        send_reply(&mut framed, &reply).await?;
    }
}
