use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::availability::find_conflict;

/// Server wall clock. Reservation dates and times are local, like the
/// schedule printed on the classroom door.
pub(crate) fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub(crate) fn validate_slot(start: NaiveTime, end: NaiveTime) -> Result<TimeSlot, EngineError> {
    TimeSlot::checked(start, end).ok_or(EngineError::InvalidTimeRange)
}

pub(crate) fn validate_request_text(user_id: &str, purpose: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(EngineError::LimitExceeded("user_id must not be empty"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user_id too long"));
    }
    if purpose.len() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(())
}

pub(crate) fn check_no_conflict(
    classroom: &ClassroomState,
    date: NaiveDate,
    slot: &TimeSlot,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(classroom, date, slot, exclude) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn check_transition(
    reservation: &Reservation,
    to: ReservationStatus,
) -> Result<(), EngineError> {
    if reservation.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            id: reservation.id,
            from: reservation.status,
            to,
        })
    }
}
