use tokio::sync::oneshot;
use tracing::info;

use crate::limits::*;
use crate::model::*;
use crate::pricing::valid_rate;

use super::conflict::{check_no_overlap, validate_span};
use super::{Engine, EngineError, Entity, WalCommand};

impl Engine {
    pub async fn create_resource(
        &self,
        owner_id: UserId,
        label: String,
        rate_hour: f64,
        rate_day: f64,
    ) -> Result<ResourceId, EngineError> {
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("resource label too long"));
        }
        if !valid_rate(rate_hour) || !valid_rate(rate_day) {
            return Err(EngineError::InvalidRate);
        }

        let _gate = self.commit_gate.read().await;
        let id = self.store.resource_ids.next();
        let event = Event::ResourceCreated {
            id,
            owner_id,
            label: label.clone(),
            rate_hour,
            rate_day,
        };
        self.persist(&event).await?;
        self.store.insert_resource(Resource {
            id,
            owner_id,
            label,
            rate_hour,
            rate_day,
            active: true,
        });
        info!("resource {id} created for owner {owner_id}");
        Ok(id)
    }

    /// New rates price bookings committed from now on; existing bookings keep theirs.
    pub async fn update_rates(
        &self,
        id: ResourceId,
        rate_hour: f64,
        rate_day: f64,
    ) -> Result<(), EngineError> {
        if !valid_rate(rate_hour) || !valid_rate(rate_day) {
            return Err(EngineError::InvalidRate);
        }
        let _gate = self.commit_gate.read().await;
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(Entity::Resource, id))?;
        let mut guard = rs.write().await;
        self.persist(&Event::RatesUpdated {
            id,
            rate_hour,
            rate_day,
        })
        .await?;
        guard.resource.rate_hour = rate_hour;
        guard.resource.rate_day = rate_day;
        Ok(())
    }

    /// Soft (de)activation. Returns whether the flag changed.
    pub async fn set_resource_active(&self, id: ResourceId, active: bool) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(Entity::Resource, id))?;
        let mut guard = rs.write().await;
        if guard.resource.active == active {
            return Ok(false);
        }
        self.persist(&Event::ResourceActiveSet { id, active }).await?;
        guard.resource.active = active;
        info!("resource {id} {}", if active { "activated" } else { "deactivated" });
        Ok(true)
    }

    /// Publish a free window on a resource.
    pub async fn add_interval(
        &self,
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    ) -> Result<IntervalId, EngineError> {
        let span = validate_span(start, end)?;
        let _gate = self.commit_gate.read().await;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))?;
        let mut guard = rs.write().await;
        if guard.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        check_no_overlap(&guard, &span)?;

        let id = self.store.interval_ids.next();
        self.persist(&Event::IntervalAdded {
            id,
            resource_id,
            span,
        })
        .await?;
        self.store
            .insert_interval(&mut guard, Interval::new(id, resource_id, span));
        Ok(id)
    }

    /// Withdraw a published window. Only intervals no booking ever touched
    /// can go; anything else stays for the bookings that reference it.
    pub async fn remove_interval(&self, id: IntervalId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let resource_id = self
            .store
            .get_interval(id)
            .await
            .map(|i| i.resource_id)
            .ok_or(EngineError::NotFound(Entity::Interval, id))?;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))?;
        let mut index = rs.write().await;
        let row = self
            .store
            .get_interval_row(&id)
            .ok_or(EngineError::NotFound(Entity::Interval, id))?;
        let row_guard = row.lock().await;
        if row_guard.booked || self.store.interval_has_bookings(&id) {
            return Err(EngineError::InUse(id));
        }

        self.persist(&Event::IntervalRemoved { id, resource_id })
            .await?;
        self.store.remove_interval(&mut index, id);
        drop(row_guard);
        Ok(())
    }

    /// Record a status reported by the payment collaborator.
    pub async fn set_payment_status(
        &self,
        id: BookingId,
        status: PaymentStatus,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.store.get_booking(&id).is_none() {
            return Err(EngineError::NotFound(Entity::Booking, id));
        }
        self.persist(&Event::PaymentStatusSet { id, status }).await?;
        self.store.set_payment_status(&id, status);
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. History survives: cancelled bookings, spent
    /// subscriptions and read notifications are all kept.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No commit may land between the snapshot and the swap.
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        for rid in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            let r = &guard.resource;
            events.push(Event::ResourceCreated {
                id: r.id,
                owner_id: r.owner_id,
                label: r.label.clone(),
                rate_hour: r.rate_hour,
                rate_day: r.rate_day,
            });
            if !r.active {
                events.push(Event::ResourceActiveSet {
                    id: r.id,
                    active: false,
                });
            }
            for (span, id) in &guard.intervals {
                events.push(Event::IntervalAdded {
                    id: *id,
                    resource_id: r.id,
                    span: *span,
                });
            }
        }

        // Replayed in id order, each interval goes booked → free → booked … as it did live.
        for booking in self.store.all_bookings() {
            let cancelled = !booking.is_active();
            let (id, interval_id) = (booking.id, booking.interval_id);
            events.push(Event::BookingConfirmed {
                booking: Booking {
                    status: BookingStatus::Active,
                    ..booking
                },
            });
            if cancelled {
                events.push(Event::BookingCancelled {
                    id,
                    interval_id,
                    fired: Vec::new(),
                });
            }
        }

        let inbox = self.inbox.lock().await;
        for subscription in inbox.all_subscriptions() {
            events.push(Event::SubscriptionCreated {
                subscription: subscription.clone(),
            });
        }
        for notification in inbox.all_notifications() {
            events.push(Event::NotificationRestored { notification });
        }
        drop(inbox);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
