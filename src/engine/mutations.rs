use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability;

use super::conflict::{
    check_no_conflict, check_transition, now_local, validate_request_text, validate_slot,
};
use super::inbox::{ADMIN_INBOX, decision_message, new_request_message};
use super::lifecycle::due_transitions;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_classroom(
        &self,
        id: Ulid,
        room_name: String,
        building: Option<String>,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_CLASSROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many classrooms"));
        }
        if room_name.trim().is_empty() {
            return Err(EngineError::LimitExceeded("room_name must not be empty"));
        }
        if room_name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::LimitExceeded("room_name too long"));
        }
        if let Some(ref b) = building
            && b.len() > MAX_BUILDING_LEN
        {
            return Err(EngineError::LimitExceeded("building too long"));
        }

        // Exclusive: the duplicate check and the insert must not interleave
        // with another creation or a compaction snapshot.
        let _catalog = self.catalog.lock().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ClassroomCreated {
            id,
            room_name: room_name.clone(),
            building: building.clone(),
            capacity,
        };
        self.wal_append(&event).await?;
        let cs = ClassroomState::new(id, room_name, building, capacity);
        self.state.insert(id, Arc::new(RwLock::new(cs)));
        tracing::info!("classroom {id} created");
        Ok(())
    }

    /// Submit a reservation request. It starts out pending.
    ///
    /// The conflict check and the insert happen under the classroom's write
    /// lock, so of two overlapping concurrent requests exactly one lands.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Ulid, EngineError> {
        let slot = validate_slot(req.start, req.end)?;
        validate_request_text(&req.user_id, &req.purpose)?;
        let id = req.id.unwrap_or_else(Ulid::new);

        let cs = self
            .get_classroom(&req.classroom_id)
            .ok_or(EngineError::NotFound(req.classroom_id))?;
        let mut guard = cs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_CLASSROOM {
            return Err(EngineError::LimitExceeded("too many reservations on classroom"));
        }
        if let Err(e) = check_no_conflict(&guard, req.date, &slot, None) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let reservation = Reservation {
            id,
            classroom_id: req.classroom_id,
            user_id: req.user_id,
            date: req.date,
            slot,
            purpose: req.purpose,
            status: ReservationStatus::Pending,
            created_at: now_local(),
        };
        let notice = Notice::new_reservation(&reservation, &guard.room_name);
        let event = Event::ReservationCreated { reservation };

        // Claim the id across every classroom before logging anything.
        match self.reservation_to_classroom.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(req.classroom_id);
            }
        }
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.reservation_to_classroom.remove(&id);
            return Err(e);
        }
        drop(guard);

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        self.notify.publish(&notice);
        self.deliver(ADMIN_INBOX, new_request_message(&notice.payload.room_name), id)
            .await;
        Ok(id)
    }

    pub async fn approve_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        self.decide(id, ReservationStatus::Approved).await
    }

    pub async fn reject_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        self.decide(id, ReservationStatus::Rejected).await
    }

    async fn decide(&self, id: Ulid, to: ReservationStatus) -> Result<(), EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let reservation = guard.get(id).ok_or(EngineError::NotFound(id))?;
        check_transition(reservation, to)?;

        let approved = to == ReservationStatus::Approved;
        let mut decided = reservation.clone();
        decided.status = to;
        let notice = Notice::decided(&decided, &guard.room_name, approved);

        let event = Event::ReservationStatusChanged {
            id,
            classroom_id: guard.id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "status" => to.as_str())
            .increment(1);
        self.notify.publish(&notice);
        let message = decision_message(&notice.payload.room_name, to);
        self.deliver(&notice.payload.user_id, message, id).await;
        Ok(())
    }

    /// Replace date, times and purpose. The request goes back to pending and
    /// must fit around every other occupying reservation.
    ///
    /// With `acting_user`, the caller must own the reservation and it must
    /// still be modifiable.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        edit: ReservationEdit,
        acting_user: Option<&str>,
    ) -> Result<(), EngineError> {
        let slot = validate_slot(edit.start, edit.end)?;
        if edit.purpose.as_ref().is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
            return Err(EngineError::LimitExceeded("purpose too long"));
        }

        let mut guard = self.resolve_reservation_write(&id).await?;
        let reservation = guard.get(id).ok_or(EngineError::NotFound(id))?;
        check_owner(reservation, acting_user)?;
        check_transition(reservation, ReservationStatus::Pending)?;
        if let Err(e) = check_no_conflict(&guard, edit.date, &slot, Some(id)) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let purpose = edit.purpose.unwrap_or_else(|| reservation.purpose.clone());
        let event = Event::ReservationEdited {
            id,
            classroom_id: guard.id,
            date: edit.date,
            slot,
            purpose,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "status" => "pending")
            .increment(1);
        Ok(())
    }

    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        acting_user: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let reservation = guard.get(id).ok_or(EngineError::NotFound(id))?;
        check_owner(reservation, acting_user)?;
        check_transition(reservation, ReservationStatus::Cancelled)?;

        let event = Event::ReservationStatusChanged {
            id,
            classroom_id: guard.id,
            status: ReservationStatus::Cancelled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "status" => "cancelled")
            .increment(1);
        Ok(())
    }

    /// Apply every time-driven transition due at `now`. Returns how many
    /// reservations moved. Running it again with the same `now` moves none.
    pub async fn advance_statuses(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let mut applied = 0;
        for cs in self.classroom_handles() {
            let mut guard = cs.write().await;
            for (id, status) in due_transitions(&guard, now) {
                let event = Event::ReservationStatusChanged {
                    id,
                    classroom_id: guard.id,
                    status,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "status" => status.as_str())
                    .increment(1);
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Rewrite the WAL with one event per classroom, reservation (carrying its
    /// current status) and stored notification. The catalog, classroom and
    /// inbox locks are held until the swap so no write can land in the old
    /// file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let catalog = self.catalog.lock().await;
        let mut events = Vec::new();
        let mut guards = Vec::new();
        for cs in self.classroom_handles() {
            let guard = cs.read_owned().await;
            events.push(Event::ClassroomCreated {
                id: guard.id,
                room_name: guard.room_name.clone(),
                building: guard.building.clone(),
                capacity: guard.capacity,
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
            guards.push(guard);
        }
        let inbox = self.inbox.read().await;
        events.extend(inbox.snapshot_events());

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(inbox);
        drop(guards);
        drop(catalog);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_owner(reservation: &Reservation, acting_user: Option<&str>) -> Result<(), EngineError> {
    match acting_user {
        Some(user) if !can_modify(reservation, user) => Err(EngineError::NotOwner(reservation.id)),
        _ => Ok(()),
    }
}

/// Owner of the request, and the request is still pending or approved.
pub(super) fn can_modify(reservation: &Reservation, user_id: &str) -> bool {
    reservation.user_id == user_id && reservation.status.is_modifiable()
}
