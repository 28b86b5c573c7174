use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info};

use crate::limits::MAX_SUBSCRIPTIONS_PER_USER;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::store::Sequence;
use super::{Engine, EngineError, Entity};

/// Subscriptions plus the notification queue they feed.
///
/// The lock is held only to plan and to apply, never across a WAL write.
/// In between, `claimed` keeps a subscription from being fired by two cancels
/// and `reserved` counts subscribes still waiting on the log.
#[derive(Debug, Default)]
pub struct Inbox {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    notifications: HashMap<UserId, Vec<Notification>>,
    claimed: HashSet<SubscriptionId>,
    reserved: HashMap<UserId, usize>,
}

impl Inbox {
    pub(super) fn insert_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.insert(subscription.id, subscription);
    }

    /// Returns whether the subscription was active.
    pub(super) fn deactivate(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.get_mut(&id) {
            Some(s) if s.active => {
                s.active = false;
                true
            }
            _ => false,
        }
    }

    pub(super) fn push_notification(&mut self, notification: Notification) {
        let queue = self.notifications.entry(notification.user_id).or_default();
        let pos = queue.partition_point(|n| n.id < notification.id);
        queue.insert(pos, notification);
    }

    /// Mark the listed notifications of `user_id` read. Returns how many
    /// were still unread.
    pub(super) fn mark_read(&mut self, user_id: UserId, ids: &[NotificationId]) -> usize {
        let Some(queue) = self.notifications.get_mut(&user_id) else {
            return 0;
        };
        let mut marked = 0;
        for n in queue.iter_mut().filter(|n| !n.read && ids.contains(&n.id)) {
            n.read = true;
            marked += 1;
        }
        marked
    }

    /// Hold the fired subscriptions while their cancel is being logged.
    pub(super) fn claim(&mut self, fired: &[Notification]) {
        self.claimed.extend(fired.iter().map(|n| n.subscription_id));
    }

    pub(super) fn release(&mut self, fired: &[Notification]) {
        for n in fired {
            self.claimed.remove(&n.subscription_id);
        }
    }

    /// Take one of the user's subscription slots for a subscribe in flight.
    /// `false` once active plus in-flight subscriptions reach the limit.
    pub(super) fn reserve_slot(&mut self, user_id: UserId) -> bool {
        let in_flight = self.reserved.get(&user_id).copied().unwrap_or(0);
        if self.active_count_for_user(user_id) + in_flight >= MAX_SUBSCRIPTIONS_PER_USER {
            return false;
        }
        *self.reserved.entry(user_id).or_default() += 1;
        true
    }

    pub(super) fn release_slot(&mut self, user_id: UserId) {
        if let Some(n) = self.reserved.get_mut(&user_id) {
            *n -= 1;
            if *n == 0 {
                self.reserved.remove(&user_id);
            }
        }
    }

    /// Deactivate the fired subscriptions and queue their notifications.
    pub(super) fn apply_fired(&mut self, fired: &[Notification]) {
        for n in fired {
            self.deactivate(n.subscription_id);
            self.push_notification(n.clone());
        }
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn subscriptions_for_user(&self, user_id: UserId) -> Vec<Subscription> {
        self.subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    fn active_count_for_user(&self, user_id: UserId) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.active)
            .count()
    }

    /// Unread notifications for a user, oldest first.
    pub fn pending(&self, user_id: UserId) -> Vec<Notification> {
        self.notifications
            .get(&user_id)
            .map(|q| q.iter().filter(|n| !n.read).cloned().collect())
            .unwrap_or_default()
    }

    pub(super) fn all_subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Every notification, in id order.
    pub(super) fn all_notifications(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.notifications.values().flatten().cloned().collect();
        all.sort_unstable_by_key(|n| n.id);
        all
    }

    /// Decide what freeing `window` on `resource` fires: one notification per
    /// matching active subscription not already claimed. Nothing is applied
    /// here; the caller commits the result together with the release.
    pub(super) fn plan_matches(
        &self,
        resource: &Resource,
        window: Span,
        now: Ms,
        ids: &Sequence,
    ) -> Vec<Notification> {
        self.subscriptions
            .values()
            .filter(|s| s.matches(resource.id, &window) && !self.claimed.contains(&s.id))
            .map(|s| Notification {
                id: ids.next(),
                user_id: s.user_id,
                subscription_id: s.id,
                resource_id: resource.id,
                window,
                text: notification_text(resource, &window),
                read: false,
                created_at: now,
            })
            .collect()
    }
}

fn notification_text(resource: &Resource, window: &Span) -> String {
    format!(
        "parking spot \"{}\" (#{}) is free for [{}, {})",
        resource.label, resource.id, window.start, window.end
    )
}

impl Engine {
    /// Match a freed window against active subscriptions. Runs inside the
    /// cancel transaction with the inbox locked for planning.
    pub(super) fn on_interval_freed(
        &self,
        inbox: &Inbox,
        resource: &Resource,
        window: Span,
    ) -> Vec<Notification> {
        let fired = inbox.plan_matches(resource, window, now_ms(), &self.store.notification_ids);
        if !fired.is_empty() {
            debug!(
                "freed [{}, {}) on resource {} matches {} subscriptions",
                window.start,
                window.end,
                resource.id,
                fired.len()
            );
        }
        fired
    }

    pub async fn subscribe(
        &self,
        user_id: UserId,
        resource_id: Option<ResourceId>,
        start: Ms,
        end: Ms,
    ) -> Result<SubscriptionId, EngineError> {
        let span = validate_span(start, end)?;
        if let Some(rid) = resource_id
            && self.store.get_resource(&rid).is_none()
        {
            return Err(EngineError::NotFound(Entity::Resource, rid));
        }

        let _gate = self.commit_gate.read().await;
        if !self.inbox.lock().await.reserve_slot(user_id) {
            return Err(EngineError::LimitExceeded("too many subscriptions for user"));
        }

        let subscription = Subscription {
            id: self.store.subscription_ids.next(),
            user_id,
            resource_id,
            span,
            active: true,
        };
        let id = subscription.id;
        let event = Event::SubscriptionCreated {
            subscription: subscription.clone(),
        };
        let persisted = self.persist(&event).await;
        let mut inbox = self.inbox.lock().await;
        inbox.release_slot(user_id);
        persisted?;
        inbox.insert_subscription(subscription);
        drop(inbox);
        info!("user {user_id} subscribed ({id}) to [{start}, {end}) on {resource_id:?}");
        Ok(id)
    }

    /// Deactivate a subscription. `Ok(false)` if it was already inactive.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let active = self
            .inbox
            .lock()
            .await
            .subscription(&id)
            .map(|s| s.active)
            .ok_or(EngineError::NotFound(Entity::Subscription, id))?;
        if !active {
            return Ok(false);
        }
        self.persist(&Event::SubscriptionDeactivated { id }).await?;
        // A racing cancel may have fired it meanwhile; both orders replay the same.
        Ok(self.inbox.lock().await.deactivate(id))
    }

    pub async fn get_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.inbox.lock().await.subscription(&id).cloned()
    }

    pub async fn subscriptions_for_user(&self, user_id: UserId) -> Vec<Subscription> {
        self.inbox.lock().await.subscriptions_for_user(user_id)
    }

    pub async fn pending_notifications(&self, user_id: UserId) -> Vec<Notification> {
        self.inbox.lock().await.pending(user_id)
    }

    /// Mark everything pending for `user_id` read. Returns how many were marked.
    pub async fn mark_read(&self, user_id: UserId) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let ids: Vec<NotificationId> = self
            .inbox
            .lock()
            .await
            .pending(user_id)
            .iter()
            .map(|n| n.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.persist(&Event::NotificationsRead {
            user_id,
            ids: ids.clone(),
        })
        .await?;
        Ok(self.inbox.lock().await.mark_read(user_id, &ids))
    }
}
