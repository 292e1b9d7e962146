use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Availability ──────────────────────────────────────────────────

/// First occupying reservation on `date` whose slot overlaps `slot`.
///
/// Only pending/approved/ongoing reservations occupy a slot. `exclude` lets an
/// edited reservation ignore its own current row. The date's reservations are
/// start-ordered, so the scan stops at the first one starting at or after
/// `slot.end`.
pub fn find_conflict<'a>(
    classroom: &'a ClassroomState,
    date: NaiveDate,
    slot: &TimeSlot,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    classroom
        .on_date(date)
        .iter()
        .take_while(|r| r.slot.start < slot.end)
        .find(|r| r.status.is_occupying() && Some(r.id) != exclude && r.slot.overlaps(slot))
}

pub fn is_available(
    classroom: &ClassroomState,
    date: NaiveDate,
    slot: &TimeSlot,
    exclude: Option<Ulid>,
) -> bool {
    find_conflict(classroom, date, slot, exclude).is_none()
}

/// Occupying reservations on `date`, in start order.
pub fn occupied_slots(classroom: &ClassroomState, date: NaiveDate) -> Vec<&Reservation> {
    classroom
        .on_date(date)
        .iter()
        .filter(|r| r.status.is_occupying())
        .collect()
}
