mod availability;
mod conflict;
mod error;
mod inbox;
mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{find_conflict, is_available, occupied_slots};
pub(crate) use conflict::now_local;
pub use error::EngineError;
pub use inbox::{ADMIN_INBOX, Inbox};
pub use lifecycle::{due_transitions, next_status};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedClassroomState = Arc<RwLock<ClassroomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Owns the WAL file. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Compaction must see every append queued ahead of it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never ride
    // along with the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// One reservation book: every classroom of a tenant with its reservations.
///
/// Each classroom sits behind its own `RwLock`. Anything that can change
/// whether a slot is occupied runs its check and its write under that
/// classroom's write lock.
pub struct Engine {
    pub state: DashMap<Ulid, SharedClassroomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reservation id → classroom id. An id is claimed here before its
    /// creation is logged.
    pub(super) reservation_to_classroom: DashMap<Ulid, Ulid>,
    pub(super) inbox: RwLock<Inbox>,
    /// Held while a classroom is created and while the WAL is compacted.
    pub(super) catalog: Mutex<()>,
}

/// Apply a reservation event to its classroom. The caller holds the lock.
/// `ClassroomCreated` is handled at the map level.
fn apply_to_classroom(cs: &mut ClassroomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.classroom_id);
            cs.insert_reservation(reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = cs.get_mut(*id) {
                r.status = *status;
            }
        }
        Event::ReservationEdited {
            id,
            date,
            slot,
            purpose,
            ..
        } => {
            // Date or start may move, so reinsert to keep the ordering.
            if let Some(mut r) = cs.remove_reservation(*id) {
                r.date = *date;
                r.slot = *slot;
                r.purpose = purpose.clone();
                r.status = ReservationStatus::Pending;
                cs.insert_reservation(r);
            }
        }
        Event::ClassroomCreated { .. }
        | Event::NotificationCreated { .. }
        | Event::NotificationsRead { .. }
        | Event::NotificationDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_to_classroom = DashMap::new();
        let mut inbox = Inbox::default();
        let mut classrooms: HashMap<Ulid, ClassroomState> = HashMap::new();
        for event in &events {
            match event {
                Event::ClassroomCreated {
                    id,
                    room_name,
                    building,
                    capacity,
                } => {
                    classrooms.entry(*id).or_insert_with(|| {
                        ClassroomState::new(*id, room_name.clone(), building.clone(), *capacity)
                    });
                }
                other => match other.classroom_id() {
                    None => inbox.apply(other),
                    Some(id) => match classrooms.get_mut(&id) {
                        Some(cs) => apply_to_classroom(cs, other, &reservation_to_classroom),
                        None => tracing::warn!("WAL replay: event for unknown classroom {id}"),
                    },
                },
            }
        }

        let state = DashMap::new();
        for (id, cs) in classrooms {
            state.insert(id, Arc::new(RwLock::new(cs)));
        }
        tracing::debug!(
            "replayed {} events into {} classrooms from {}",
            events.len(),
            state.len(),
            wal_path.display()
        );

        Ok(Self {
            state,
            wal_tx,
            notify,
            reservation_to_classroom,
            inbox: RwLock::new(inbox),
            catalog: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_classroom(&self, id: &Ulid) -> Option<SharedClassroomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn classroom_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_classroom
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// Snapshot of the classroom handles, so no DashMap shard stays locked
    /// across an `.await`.
    pub(super) fn classroom_handles(&self) -> Vec<SharedClassroomState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    /// Durably log `event`, then apply it to the locked classroom.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut ClassroomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_classroom(cs, event, &self.reservation_to_classroom);
        Ok(())
    }

    /// Reservation id → its classroom, write-locked.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ClassroomState>, EngineError> {
        let classroom_id = self
            .classroom_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let cs = self
            .get_classroom(&classroom_id)
            .ok_or(EngineError::NotFound(classroom_id))?;
        Ok(cs.write_owned().await)
    }
}
