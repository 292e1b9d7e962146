use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Reservation;

const CHANNEL_CAPACITY: usize = 256;

/// Channel every reservation notice is published on.
pub const RESERVATIONS_CHANNEL: &str = "reservations";

/// Per-classroom channel name. Channel names are case-insensitive.
pub fn classroom_channel(classroom_id: Ulid) -> String {
    normalize_channel(&format!("classroom_{classroom_id}"))
}

pub fn normalize_channel(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    NewReservation,
    ReservationApproved,
    ReservationRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoticePayload {
    pub reservation_id: Ulid,
    pub classroom_id: Ulid,
    pub user_id: String,
    pub room_name: String,
    pub message: String,
}

/// `{"type": ..., "payload": {...}}` as pushed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub payload: NoticePayload,
}

impl Notice {
    pub fn new_reservation(reservation: &Reservation, room_name: &str) -> Self {
        let message = format!(
            "New reservation for {room_name} on {}",
            reservation.date.format("%B %-d, %Y")
        );
        Self::build(NoticeKind::NewReservation, reservation, room_name, message)
    }

    pub fn decided(reservation: &Reservation, room_name: &str, approved: bool) -> Self {
        let (kind, verdict) = if approved {
            (NoticeKind::ReservationApproved, "approved")
        } else {
            (NoticeKind::ReservationRejected, "rejected")
        };
        let message = format!(
            "Your reservation for {room_name} on {} has been {verdict}",
            reservation.date.format("%B %-d, %Y")
        );
        Self::build(kind, reservation, room_name, message)
    }

    fn build(kind: NoticeKind, r: &Reservation, room_name: &str, message: String) -> Self {
        Self {
            kind,
            payload: NoticePayload {
                reservation_id: r.id,
                classroom_id: r.classroom_id,
                user_id: r.user_id.clone(),
                room_name: room_name.to_string(),
                message,
            },
        }
    }

    pub fn channels(&self) -> [String; 2] {
        [
            RESERVATIONS_CHANNEL.to_string(),
            classroom_channel(self.payload.classroom_id),
        ]
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub for LISTEN/NOTIFY, keyed by channel name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(normalize_channel(channel))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a raw payload. No-op if nobody is listening.
    pub fn send(&self, channel: &str, payload: &str) {
        if let Some(sender) = self.channels.get(&normalize_channel(channel)) {
            let _ = sender.send(payload.to_string());
        }
    }

    /// Serialize a notice once and fan it out to all of its channels.
    pub fn publish(&self, notice: &Notice) {
        let payload = match notice.to_json() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("dropping notice for {}: {e}", notice.payload.reservation_id);
                return;
            }
        };
        for channel in notice.channels() {
            self.send(&channel, &payload);
        }
    }

    /// Drop a channel once its last subscriber has gone.
    pub fn remove_if_idle(&self, channel: &str) {
        self.channels
            .remove_if(&normalize_channel(channel), |_, tx| tx.receiver_count() == 0);
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
