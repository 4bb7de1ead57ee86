mod availability;
mod conflict;
mod directory;
mod error;
mod lifecycle;
mod queries;
mod store;

pub use availability::{group_by_day, merge_overlapping, open_slots, subtract_intervals};
pub use error::EngineError;
pub use store::{SharedTutorState, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::error;
use ulid::Ulid;

use crate::auth::{Capability, Principal};
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches appends:
/// block for one append, drain whatever else is queued, fsync once,
/// answer every sender.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_maintenance(&mut journal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                JournalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut journal, &batch);
        metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            error!("journal flush failed: {e}");
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_maintenance(&mut journal, cmd);
        }
    }
}

fn flush_batch(journal: &mut Journal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't ride along
    // with the next batch.
    let synced = journal.sync();
    appended.and(synced)
}

fn handle_maintenance(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_snapshot(journal.path(), &events)
                .and_then(|()| journal.install_snapshot());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => {}
    }
}

/// The scheduling core. Tutor state is sharded behind one `RwLock`
/// per tutor; every check-then-write runs under that tutor's write lock.
pub struct Engine {
    pub(super) store: Store,
    journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Offset in which weekdays and window times are read.
    zone: FixedOffset,
    /// Mutations hold it shared, compaction exclusively. Always taken
    /// before any tutor lock.
    gate: RwLock<()>,
    /// Serializes directory writes so uniqueness checks hold.
    directory_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(journal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_zone(journal_path, notify, Utc.fix())
    }

    pub fn with_zone(journal_path: PathBuf, notify: Arc<NotifyHub>, zone: FixedOffset) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let store = Store::new();
        // Sole owner of every shard here, so try_write never contends.
        // Never block: this may run inside the runtime.
        for event in &events {
            match event.tutor_id() {
                None => store.apply_directory(event),
                Some(tutor_id) => {
                    let Some(shard) = store.tutor(&tutor_id) else {
                        continue;
                    };
                    let mut guard = shard
                        .try_write()
                        .map_err(|_| io::Error::other("replay: tutor shard busy"))?;
                    store.apply_to_tutor(&mut guard, event);
                }
            }
        }

        Ok(Self {
            store,
            journal_tx,
            notify,
            zone,
            gate: RwLock::new(()),
            directory_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    /// Journal first, then memory. Nothing changes if the append fails.
    pub(super) async fn persist_and_apply(&self, ts: &mut TutorState, event: &Event) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        self.store.apply_to_tutor(ts, event);
        Ok(())
    }

    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        self.store.apply_directory(event);
        Ok(())
    }

    /// Role check plus proof that the principal names a real account
    /// holding that role.
    pub(super) fn authorize(&self, principal: &Principal, capability: Capability) -> Result<Account, EngineError> {
        if !principal.can(capability) {
            return Err(EngineError::Forbidden(capability.describe()));
        }
        match self.store.account(&principal.account) {
            Some(account) if account.role() == principal.role => Ok(account),
            _ => Err(EngineError::Forbidden("unknown principal")),
        }
    }

    pub(super) async fn tutor_write(&self, tutor_id: &Ulid) -> Result<OwnedRwLockWriteGuard<TutorState>, EngineError> {
        let shard = self
            .store
            .tutor(tutor_id)
            .ok_or(EngineError::NotFound(*tutor_id))?;
        Ok(shard.write_owned().await)
    }

    /// Lookup booking → tutor, then lock that tutor for writing.
    pub(super) async fn booking_write(&self, booking_id: &Ulid) -> Result<OwnedRwLockWriteGuard<TutorState>, EngineError> {
        let tutor_id = self
            .store
            .tutor_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        self.tutor_write(&tutor_id).await
    }

    pub(super) async fn window_write(&self, window_id: &Ulid) -> Result<OwnedRwLockWriteGuard<TutorState>, EngineError> {
        let tutor_id = self
            .store
            .tutor_for_window(window_id)
            .ok_or(EngineError::NotFound(*window_id))?;
        self.tutor_write(&tutor_id).await
    }

    /// Rewrite the journal as the minimal event set for the current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let mut events = self.store.directory_events();
        let mut tutor_ids = self.store.tutor_ids();
        tutor_ids.sort();
        for tutor_id in tutor_ids {
            let Some(shard) = self.store.tutor(&tutor_id) else {
                continue;
            };
            let guard = shard.read().await;
            events.extend(
                guard
                    .windows
                    .iter()
                    .map(|w| Event::WindowAdded { window: w.clone() }),
            );
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
