use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day range `[start, end)` within a single calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeSlot start must be before end");
        Self { start, end }
    }

    /// Build a slot, returning `None` for zero-length or inverted ranges.
    pub fn checked(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_time(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Ongoing,
    Done,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 6] = [
        ReservationStatus::Pending,
        ReservationStatus::Approved,
        ReservationStatus::Ongoing,
        ReservationStatus::Done,
        ReservationStatus::Rejected,
        ReservationStatus::Cancelled,
    ];

    /// Occupying statuses count toward slot conflicts.
    pub fn is_occupying(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Approved | ReservationStatus::Ongoing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Done | ReservationStatus::Rejected | ReservationStatus::Cancelled
        )
    }

    /// Owners may edit or cancel only while the request is still open.
    pub fn is_modifiable(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Approved)
    }

    /// The single place transition preconditions live.
    ///
    /// `Pending -> Pending` and `Approved -> Pending` are edits, which reset
    /// the request for re-approval.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Pending, Pending)
                | (Approved, Ongoing)
                | (Approved, Done)
                | (Approved, Cancelled)
                | (Approved, Pending)
                | (Ongoing, Done)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Ongoing => "ongoing",
            ReservationStatus::Done => "done",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub classroom_id: Ulid,
    pub user_id: String,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub purpose: String,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
}

impl Reservation {
    /// Sort key inside a classroom: by date, then start time.
    pub fn sort_key(&self) -> (NaiveDate, NaiveTime) {
        (self.date, self.slot.start)
    }
}

/// Live state of one classroom: its descriptor plus every reservation ever
/// made for it, ordered by `(date, start)`.
#[derive(Debug, Clone)]
pub struct ClassroomState {
    pub id: Ulid,
    pub room_name: String,
    pub building: Option<String>,
    pub capacity: u32,
    pub reservations: Vec<Reservation>,
}

impl ClassroomState {
    pub fn new(id: Ulid, room_name: String, building: Option<String>, capacity: u32) -> Self {
        Self {
            id,
            room_name,
            building,
            capacity,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining `(date, start)` order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = reservation.sort_key();
        let pos = self
            .reservations
            .partition_point(|r| r.sort_key() <= key);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// All reservations on `date`, in start-time order.
    /// Binary search narrows to the date's contiguous run.
    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        let lo = self.reservations.partition_point(|r| r.date < date);
        let hi = self.reservations.partition_point(|r| r.date <= date);
        &self.reservations[lo..hi]
    }

    pub fn info(&self) -> ClassroomInfo {
        ClassroomInfo {
            id: self.id,
            room_name: self.room_name.clone(),
            building: self.building.clone(),
            capacity: self.capacity,
        }
    }
}

/// One entry in a user's notification inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: String,
    pub message: String,
    pub reservation_id: Option<Ulid>,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassroomCreated {
        id: Ulid,
        room_name: String,
        building: Option<String>,
        capacity: u32,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        classroom_id: Ulid,
        status: ReservationStatus,
    },
    /// Edit of the request fields; always resets status to pending.
    ReservationEdited {
        id: Ulid,
        classroom_id: Ulid,
        date: NaiveDate,
        slot: TimeSlot,
        purpose: String,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationsRead {
        ids: Vec<Ulid>,
    },
    NotificationDeleted {
        id: Ulid,
    },
}

impl Event {
    /// Classroom the event belongs to. `None` for inbox events.
    pub fn classroom_id(&self) -> Option<Ulid> {
        match self {
            Event::ClassroomCreated { id, .. } => Some(*id),
            Event::ReservationCreated { reservation } => Some(reservation.classroom_id),
            Event::ReservationStatusChanged { classroom_id, .. }
            | Event::ReservationEdited { classroom_id, .. } => Some(*classroom_id),
            Event::NotificationCreated { .. }
            | Event::NotificationsRead { .. }
            | Event::NotificationDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassroomInfo {
    pub id: Ulid,
    pub room_name: String,
    pub building: Option<String>,
    pub capacity: u32,
}

/// Input for creating a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Option<Ulid>,
    pub classroom_id: Ulid,
    pub user_id: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub purpose: String,
}

/// Replacement values for an edit. `purpose: None` keeps the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationEdit {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub purpose: Option<String>,
}
