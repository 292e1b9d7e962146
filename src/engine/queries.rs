use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::availability;
use super::conflict::validate_slot;
use super::mutations::can_modify;
use super::{Engine, EngineError};

impl Engine {
    /// Whether `[start, end)` on `date` is free in the classroom, ignoring
    /// `exclude` (the reservation being edited, if any).
    pub async fn is_available(
        &self,
        classroom_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let slot = validate_slot(start, end)?;
        let cs = self
            .get_classroom(&classroom_id)
            .ok_or(EngineError::NotFound(classroom_id))?;
        let guard = cs.read().await;
        Ok(availability::is_available(&guard, date, &slot, exclude))
    }

    /// False for unknown reservations.
    pub async fn can_modify(&self, id: Ulid, user_id: &str) -> bool {
        match self.get_reservation(id).await {
            Some(r) => can_modify(&r, user_id),
            None => false,
        }
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let classroom_id = self.classroom_for_reservation(&id)?;
        let cs = self.get_classroom(&classroom_id)?;
        let guard = cs.read().await;
        guard.get(id).cloned()
    }

    /// Sorted by room name.
    pub async fn list_classrooms(&self) -> Vec<ClassroomInfo> {
        let mut out = Vec::with_capacity(self.state.len());
        for cs in self.classroom_handles() {
            out.push(cs.read().await.info());
        }
        out.sort_by(|a, b| a.room_name.cmp(&b.room_name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn classroom_reservations(
        &self,
        classroom_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let cs = self
            .get_classroom(&classroom_id)
            .ok_or(EngineError::NotFound(classroom_id))?;
        let guard = cs.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn user_reservations(&self, user_id: &str) -> Vec<Reservation> {
        self.collect_reservations(|r| r.user_id == user_id).await
    }

    pub async fn all_reservations(&self) -> Vec<Reservation> {
        self.collect_reservations(|_| true).await
    }

    pub async fn reservations_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        self.collect_reservations(|r| r.status == status).await
    }

    /// Occupying reservations of one classroom on `date`, by start time.
    pub async fn occupied_slots(
        &self,
        classroom_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let cs = self
            .get_classroom(&classroom_id)
            .ok_or(EngineError::NotFound(classroom_id))?;
        let guard = cs.read().await;
        Ok(availability::occupied_slots(&guard, date)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Classrooms with nothing occupying any part of `[start, end)` on `date`.
    pub async fn available_classrooms(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Vec<ClassroomInfo>, EngineError> {
        let slot = validate_slot(start, end)?;
        let mut out = Vec::new();
        for cs in self.classroom_handles() {
            let guard = cs.read().await;
            if availability::is_available(&guard, date, &slot, None) {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.room_name.cmp(&b.room_name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Matching reservations across all classrooms, by date, start, then id.
    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for cs in self.classroom_handles() {
            let guard = cs.read().await;
            out.extend(guard.reservations.iter().filter(|r| keep(r)).cloned());
        }
        out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()).then(a.id.cmp(&b.id)));
        out
    }
}
