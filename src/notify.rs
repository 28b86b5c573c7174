use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Notification, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub handing queued notifications to a delivery collaborator.
///
/// The queue in the engine stays the source of truth; a listener that lags or
/// connects late still finds everything through `pending_notifications`.
pub struct NotifyHub {
    users: DashMap<UserId, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Receive notifications for one user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Notification> {
        let sender = self
            .users
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Receive every notification, e.g. for a messaging gateway.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Fan a notification out. No-op if nobody is listening. A user channel
    /// whose receivers are all gone is dropped here.
    pub fn send(&self, notification: &Notification) {
        let orphaned = self
            .users
            .get(&notification.user_id)
            .is_some_and(|sender| sender.send(notification.clone()).is_err());
        if orphaned {
            self.prune(&notification.user_id);
        }
        let _ = self.all.send(notification.clone());
    }

    /// Drop a user's channel once its last receiver is gone.
    pub fn prune(&self, user_id: &UserId) {
        self.users
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }

    /// Users with an open channel.
    pub fn user_channels(&self) -> usize {
        self.users.len()
    }
}
