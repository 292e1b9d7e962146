use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::conflict::now_local;
use super::{Engine, EngineError};

/// Inbox that receives a copy of every new request for review.
pub const ADMIN_INBOX: &str = "admin";

/// Stored notifications of one tenant, keyed by id.
#[derive(Debug, Default)]
pub struct Inbox {
    by_id: HashMap<Ulid, Notification>,
}

impl Inbox {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::NotificationCreated { notification } => {
                self.by_id.insert(notification.id, notification.clone());
            }
            Event::NotificationsRead { ids } => {
                for id in ids {
                    if let Some(n) = self.by_id.get_mut(id) {
                        n.is_read = true;
                    }
                }
            }
            Event::NotificationDeleted { id } => {
                self.by_id.remove(id);
            }
            _ => {}
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&Notification> {
        self.by_id.get(&id)
    }

    /// Newest first.
    pub fn for_user(&self, user_id: &str, unread_only: bool, limit: Option<usize>) -> Vec<Notification> {
        let mut out: Vec<Notification> = self
            .by_id
            .values()
            .filter(|n| n.user_id == user_id && (!unread_only || !n.is_read))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub fn unread_ids(&self, user_id: &str) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .by_id
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }

    /// One `NotificationCreated` per entry, read flag included.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut all: Vec<&Notification> = self.by_id.values().collect();
        all.sort_by_key(|n| n.id);
        all.into_iter()
            .map(|n| Event::NotificationCreated {
                notification: n.clone(),
            })
            .collect()
    }
}

impl Engine {
    /// Store a notification for `user_id`. The triggering change is already
    /// durable, so a failed append is logged rather than returned.
    pub(super) async fn deliver(&self, user_id: &str, message: String, reservation_id: Ulid) {
        let notification = Notification {
            id: Ulid::new(),
            user_id: user_id.to_string(),
            message,
            reservation_id: Some(reservation_id),
            is_read: false,
            created_at: now_local(),
        };
        let event = Event::NotificationCreated { notification };
        let mut inbox = self.inbox.write().await;
        match self.wal_append(&event).await {
            Ok(()) => inbox.apply(&event),
            Err(e) => tracing::warn!("notification for {user_id} on {reservation_id} not stored: {e}"),
        }
    }

    /// A user's notifications, newest first.
    pub async fn user_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: Option<usize>,
    ) -> Vec<Notification> {
        self.inbox.read().await.for_user(user_id, unread_only, limit)
    }

    pub async fn unread_count(&self, user_id: &str) -> usize {
        self.inbox.read().await.unread_ids(user_id).len()
    }

    /// Marking an already read notification is a no-op.
    pub async fn mark_notification_read(&self, id: Ulid) -> Result<(), EngineError> {
        let mut inbox = self.inbox.write().await;
        let notification = inbox.get(id).ok_or(EngineError::NotFound(id))?;
        if notification.is_read {
            return Ok(());
        }
        let event = Event::NotificationsRead { ids: vec![id] };
        self.wal_append(&event).await?;
        inbox.apply(&event);
        Ok(())
    }

    /// Returns how many notifications changed.
    pub async fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize, EngineError> {
        let mut inbox = self.inbox.write().await;
        let ids = inbox.unread_ids(user_id);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let event = Event::NotificationsRead { ids };
        self.wal_append(&event).await?;
        inbox.apply(&event);
        Ok(count)
    }

    pub async fn delete_notification(&self, id: Ulid) -> Result<(), EngineError> {
        let mut inbox = self.inbox.write().await;
        if inbox.get(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::NotificationDeleted { id };
        self.wal_append(&event).await?;
        inbox.apply(&event);
        Ok(())
    }
}

pub(super) fn new_request_message(room_name: &str) -> String {
    format!("New Reservation for {room_name}")
}

pub(super) fn decision_message(room_name: &str, status: ReservationStatus) -> String {
    format!("Reservation for {room_name} {status}")
}
