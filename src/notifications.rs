//! Notification inbox.
//!
//! Keeps the signed-in user's notifications and unread count, fed by the
//! `Notification` push topic and by bulk loads from the API. User actions
//! are applied locally first and rolled back if the server rejects them.
//!
//! The inbox lives in a `watch` channel so a badge or list view can follow
//! it without polling.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;

use crate::events::{EventBus, NotificationRecord, PushEvent, SubscriptionId};
use crate::http::{ApiClient, ApiError, ApiRequest};

/// Default page size for [`NotificationStore::load`].
pub const DEFAULT_LOAD_LIMIT: u32 = 50;

/// Current inbox contents, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inbox {
    /// Notifications, newest first.
    pub items: Vec<NotificationRecord>,
    /// Unread count. May exceed the unread items held locally after
    /// [`NotificationStore::load_unread_count`].
    pub unread: u32,
}

impl Inbox {
    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|n| n.id == id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    unread_count: u32,
}

/// Client-side notification inbox.
#[derive(Debug, Clone)]
pub struct NotificationStore {
    api: ApiClient,
    inbox: Arc<watch::Sender<Inbox>>,
}

impl NotificationStore {
    /// Empty inbox backed by `api`.
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            inbox: Arc::new(watch::Sender::new(Inbox::default())),
        }
    }

    /// Feed live notifications from `bus` into this inbox.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
        let store = self.clone();
        bus.on(NotificationRecord::TOPIC, move |payload| {
            match serde_json::from_value::<NotificationRecord>(payload.clone()) {
                Ok(record) => {
                    log::info!("[Inbox] {}: {}", record.title, record.message);
                    store.ingest(record);
                }
                Err(e) => log::warn!("[Inbox] Dropping malformed notification: {e}"),
            }
        })
    }

    /// Add a live notification. Returns `false` if it was already present.
    pub fn ingest(&self, record: NotificationRecord) -> bool {
        self.inbox.send_if_modified(|inbox| {
            if inbox.position(&record.id).is_some() {
                return false;
            }
            if !record.is_read {
                inbox.unread = inbox.unread.saturating_add(1);
            }
            inbox.items.insert(0, record);
            true
        })
    }

    /// Replace the inbox with the newest `limit` notifications.
    pub async fn load(&self, limit: u32) -> Result<(), ApiError> {
        let items: Vec<NotificationRecord> = self
            .api
            .json(ApiRequest::get("/notifications").query("limit", limit))
            .await?;
        let unread = u32::try_from(items.iter().filter(|n| !n.is_read).count()).unwrap_or(u32::MAX);
        log::debug!("[Inbox] Loaded {} notifications ({} unread)", items.len(), unread);
        self.inbox.send_replace(Inbox { items, unread });
        Ok(())
    }

    /// Refresh the unread count from the server.
    pub async fn load_unread_count(&self) -> Result<u32, ApiError> {
        let response: UnreadCountResponse = self
            .api
            .json(ApiRequest::get("/notifications/unread-count"))
            .await?;
        self.inbox.send_if_modified(|inbox| {
            let changed = inbox.unread != response.unread_count;
            inbox.unread = response.unread_count;
            changed
        });
        Ok(response.unread_count)
    }

    /// Mark one notification read.
    pub async fn mark_as_read(&self, id: &str) -> Result<(), ApiError> {
        let mut was_unread = false;
        self.inbox.send_if_modified(|inbox| {
            let Some(index) = inbox.position(id) else {
                return false;
            };
            let record = &mut inbox.items[index];
            if record.is_read {
                return false;
            }
            record.is_read = true;
            record.read_at = Some(Utc::now());
            inbox.unread = inbox.unread.saturating_sub(1);
            was_unread = true;
            true
        });

        let result = self
            .api
            .execute(ApiRequest::post(format!("/notifications/{id}/read")).json(serde_json::json!({})))
            .await;

        if let Err(e) = result {
            if was_unread {
                log::warn!("[Inbox] Mark-as-read failed, restoring {id}: {e}");
                self.restore_unread(&[id.to_string()]);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Mark every notification read.
    pub async fn mark_all_as_read(&self) -> Result<(), ApiError> {
        let mut flipped: Vec<String> = Vec::new();
        let mut previous_unread = 0;
        self.inbox.send_if_modified(|inbox| {
            previous_unread = inbox.unread;
            let now = Utc::now();
            for record in inbox.items.iter_mut().filter(|n| !n.is_read) {
                record.is_read = true;
                record.read_at = Some(now);
                flipped.push(record.id.clone());
            }
            let changed = !flipped.is_empty() || inbox.unread != 0;
            inbox.unread = 0;
            changed
        });

        let result = self
            .api
            .execute(ApiRequest::post("/notifications/mark-all-read").json(serde_json::json!({})))
            .await;

        if let Err(e) = result {
            log::warn!("[Inbox] Mark-all-read failed, restoring {} notifications: {e}", flipped.len());
            self.restore_unread(&flipped);
            self.inbox.send_if_modified(|inbox| {
                let changed = inbox.unread != previous_unread;
                inbox.unread = inbox.unread.max(previous_unread);
                changed
            });
            return Err(e);
        }
        Ok(())
    }

    /// Delete one notification.
    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let mut removed: Option<(usize, NotificationRecord)> = None;
        self.inbox.send_if_modified(|inbox| {
            let Some(index) = inbox.position(id) else {
                return false;
            };
            let record = inbox.items.remove(index);
            if !record.is_read {
                inbox.unread = inbox.unread.saturating_sub(1);
            }
            removed = Some((index, record));
            true
        });

        let result = self
            .api
            .execute(ApiRequest::delete(format!("/notifications/{id}")))
            .await;

        if let Err(e) = result {
            if let Some((index, record)) = removed {
                log::warn!("[Inbox] Delete failed, restoring {id}: {e}");
                self.inbox.send_if_modified(|inbox| {
                    if inbox.position(&record.id).is_some() {
                        return false;
                    }
                    if !record.is_read {
                        inbox.unread = inbox.unread.saturating_add(1);
                    }
                    let index = index.min(inbox.items.len());
                    inbox.items.insert(index, record);
                    true
                });
            }
            return Err(e);
        }
        Ok(())
    }

    /// Delete every notification.
    pub async fn clear_all(&self) -> Result<(), ApiError> {
        let previous = self.inbox.send_replace(Inbox::default());

        let result = self
            .api
            .execute(ApiRequest::delete("/notifications/clear-all"))
            .await;

        if let Err(e) = result {
            log::warn!("[Inbox] Clear-all failed, restoring {} notifications: {e}", previous.items.len());
            self.inbox.send_modify(|inbox| {
                // Anything pushed while the call was in flight stays on top
                for record in previous.items {
                    if inbox.position(&record.id).is_none() {
                        inbox.items.push(record);
                    }
                }
                inbox.unread = inbox.unread.saturating_add(previous.unread);
            });
            return Err(e);
        }
        Ok(())
    }

    /// Forget everything (on sign-out).
    pub fn reset(&self) {
        self.inbox.send_if_modified(|inbox| {
            let changed = *inbox != Inbox::default();
            *inbox = Inbox::default();
            changed
        });
    }

    /// Snapshot of the inbox.
    pub fn snapshot(&self) -> Inbox {
        self.inbox.borrow().clone()
    }

    /// Notifications, newest first.
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.inbox.borrow().items.clone()
    }

    /// Unread count.
    pub fn unread_count(&self) -> u32 {
        self.inbox.borrow().unread
    }

    /// Watch inbox changes.
    pub fn subscribe(&self) -> watch::Receiver<Inbox> {
        self.inbox.subscribe()
    }

    fn restore_unread(&self, ids: &[String]) {
        self.inbox.send_if_modified(|inbox| {
            let mut restored = 0u32;
            for record in inbox.items.iter_mut().filter(|n| ids.contains(&n.id)) {
                if record.is_read {
                    record.is_read = false;
                    record.read_at = None;
                    restored += 1;
                }
            }
            inbox.unread = inbox.unread.saturating_add(restored);
            restored > 0
        });
    }
}
