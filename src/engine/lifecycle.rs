use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

// ── Status sweep ──────────────────────────────────────────────────

/// Status a reservation should move to at wall-clock `now`, if any.
///
/// 1. approved, today, `start <= now < end`           → ongoing
/// 2. ongoing, dated before today or ended today      → done
/// 3. approved, dated before today                    → done
///
/// Rules 1 and 3 match approved rows, rule 2 ongoing rows, so at most one
/// fires per reservation per sweep.
pub fn next_status(reservation: &Reservation, now: NaiveDateTime) -> Option<ReservationStatus> {
    let today = now.date();
    let time = now.time();
    match reservation.status {
        ReservationStatus::Approved
            if reservation.date == today && reservation.slot.contains_time(time) =>
        {
            Some(ReservationStatus::Ongoing)
        }
        ReservationStatus::Ongoing
            if reservation.date < today
                || (reservation.date == today && reservation.slot.end <= time) =>
        {
            Some(ReservationStatus::Done)
        }
        ReservationStatus::Approved if reservation.date < today => Some(ReservationStatus::Done),
        _ => None,
    }
}

/// Every transition due in one classroom at `now`.
pub fn due_transitions(
    classroom: &ClassroomState,
    now: NaiveDateTime,
) -> Vec<(Ulid, ReservationStatus)> {
    classroom
        .reservations
        .iter()
        .filter_map(|r| next_status(r, now).map(|next| (r.id, next)))
        .collect()
}
