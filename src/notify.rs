use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Account, Booking, Location};
use crate::observability::NOTIFICATIONS_TOTAL;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A student asked for an appointment; goes to the student and the tutor.
    Requested,
    /// A booking became confirmed; goes to the tutor and every student.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub account: Ulid,
    pub name: String,
    pub email: String,
}

impl From<&Account> for Contact {
    fn from(account: &Account) -> Self {
        Self {
            account: account.id,
            name: account.full_name(),
            email: account.email.clone(),
        }
    }
}

/// Everything a delivery channel needs to tell participants about a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub booking: Booking,
    pub tutor: Contact,
    pub students: Vec<Contact>,
    pub location: Option<Location>,
}

impl Notification {
    pub fn recipients(&self) -> impl Iterator<Item = &Contact> {
        std::iter::once(&self.tutor).chain(self.students.iter())
    }
}

/// Broadcast hub for booking notifications: one firehose plus one
/// channel per tutor.
pub struct NotifyHub {
    all: broadcast::Sender<Notification>,
    tutors: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            tutors: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Subscribe to one tutor's notifications. Creates the channel if needed.
    pub fn subscribe(&self, tutor_id: Ulid) -> broadcast::Receiver<Notification> {
        self.tutors
            .entry(tutor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op for channels nobody listens on.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.tutors.get(&notification.booking.tutor_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification);
    }
}

/// Where notifications end up: email, chat, a log line.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

/// Writes each notification to the log. Default sink of the binary.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        let booking = &notification.booking;
        for contact in notification.recipients() {
            info!(
                kind = ?notification.kind,
                booking = %booking.id,
                to = %contact.email,
                start = %booking.span.start,
                "notification"
            );
        }
        Ok(())
    }
}

/// Drain a subscription into a sink until the hub is dropped.
pub async fn run_delivery(mut rx: broadcast::Receiver<Notification>, sink: Arc<dyn NotificationSink>) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                let kind = match notification.kind {
                    NotificationKind::Requested => "requested",
                    NotificationKind::Confirmed => "confirmed",
                };
                metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind).increment(1);
                if let Err(e) = sink.deliver(&notification).await {
                    warn!(booking = %notification.booking.id, "notification delivery failed: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("notification delivery lagged, {skipped} dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Span};
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn notification(tutor_id: Ulid) -> Notification {
        let start = Utc.with_ymd_and_hms(2099, 1, 5, 10, 0, 0).unwrap();
        let student = Ulid::new();
        Notification {
            kind: NotificationKind::Requested,
            booking: Booking {
                id: Ulid::new(),
                tutor_id,
                students: vec![student],
                course_id: None,
                location_id: Ulid::new(),
                span: Span::new(start, start + chrono::Duration::hours(1)),
                status: BookingStatus::Pending,
                booked_at: start,
            },
            tutor: Contact {
                account: tutor_id,
                name: "Tara Tutor".into(),
                email: "tara@example.edu".into(),
            },
            students: vec![Contact {
                account: student,
                name: "Sam Student".into(),
                email: "sam@example.edu".into(),
            }],
            location: None,
        }
    }

    #[tokio::test]
    async fn tutor_subscriber_only_sees_own_bookings() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);
        let all = hub.subscribe_all();

        hub.send(notification(Ulid::new()));
        let n = notification(mine);
        hub.send(n.clone());

        assert_eq!(rx.recv().await.unwrap(), n);
        assert!(rx.try_recv().is_err());
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(notification(Ulid::new()));
    }

    #[test]
    fn recipients_start_with_tutor() {
        let n = notification(Ulid::new());
        let emails: Vec<_> = n.recipients().map(|c| c.email.as_str()).collect();
        assert_eq!(emails, vec!["tara@example.edu", "sam@example.edu"]);
    }

    struct Recording(Mutex<Vec<Ulid>>);

    #[async_trait]
    impl NotificationSink for Recording {
        async fn deliver(&self, notification: &Notification) -> Result<(), String> {
            self.0.lock().unwrap().push(notification.booking.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_drains_until_hub_dropped() {
        let hub = NotifyHub::new();
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let task = tokio::spawn(run_delivery(hub.subscribe_all(), sink.clone()));

        let n = notification(Ulid::new());
        hub.send(n.clone());
        drop(hub);
        task.await.unwrap();

        assert_eq!(*sink.0.lock().unwrap(), vec![n.booking.id]);
    }
}
