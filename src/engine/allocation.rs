use tracing::{debug, info};

use crate::model::*;
use crate::pricing;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Convert a free interval into a confirmed booking.
    ///
    /// Everything happens under the interval's row lock: re-fetch, check it
    /// is still free, check the span still fits, price, then commit one WAL
    /// record and apply it. The resource stays read-locked throughout, so a
    /// deactivation or rate change orders entirely before or after. Callers
    /// that get `Conflict` lost a race and should re-run the availability
    /// query rather than retry.
    pub async fn book(
        &self,
        user_id: UserId,
        resource_id: ResourceId,
        interval_id: IntervalId,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        let _gate = self.commit_gate.read().await;

        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))?;
        let state = rs.read().await;
        let resource = &state.resource;
        if !resource.active {
            return Err(EngineError::Inactive(resource_id));
        }

        let row = self
            .store
            .get_interval_row(&interval_id)
            .ok_or(EngineError::NotFound(Entity::Interval, interval_id))?;
        let mut guard = row.lock().await;

        // The row may have been withdrawn while we waited for the lock.
        if !self.store.contains_interval(&interval_id) || guard.resource_id != resource_id {
            return Err(EngineError::NotFound(Entity::Interval, interval_id));
        }
        if guard.booked {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!("user {user_id} lost interval {interval_id}: already booked");
            return Err(EngineError::Conflict(interval_id));
        }
        if !guard.span.contains_span(&span) {
            return Err(EngineError::InvalidRange { start, end });
        }

        let quote = pricing::price(resource.rate_hour, resource.rate_day, &span);
        let booking = Booking {
            id: self.store.booking_ids.next(),
            user_id,
            resource_id,
            interval_id,
            span,
            total_price: quote.amount,
            duration_hours: quote.duration_hours,
            status: BookingStatus::Active,
            payment_status: PaymentStatus::Pending,
            created_at: now_ms(),
        };
        self.persist(&Event::BookingConfirmed {
            booking: booking.clone(),
        })
        .await?;
        self.store.confirm_booking(&mut guard, booking.clone());
        drop(guard);
        drop(state);

        metrics::counter!(crate::observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!(
            "booking {} confirmed: user {user_id}, interval {interval_id}, [{start}, {end}), price {}",
            booking.id, booking.total_price
        );
        Ok(booking)
    }

    /// Cancel an active booking, release its interval and fire matching
    /// subscriptions, all in one WAL record.
    ///
    /// `Ok(false)` if the booking was already cancelled.
    pub async fn cancel(&self, booking_id: BookingId) -> Result<bool, EngineError> {
        let booking = self
            .store
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(Entity::Booking, booking_id))?;
        let _gate = self.commit_gate.read().await;

        // Snapshot before taking the row lock; the resource index lock ranks above it.
        let resource = self.resource_snapshot(booking.resource_id).await?;
        let row = self
            .store
            .get_interval_row(&booking.interval_id)
            .ok_or(EngineError::NotFound(Entity::Interval, booking.interval_id))?;
        let mut guard = row.lock().await;

        // Booking status only changes under this lock, so this read is authoritative.
        let is_active = self
            .store
            .get_booking(&booking_id)
            .is_some_and(|b| b.is_active());
        if !is_active {
            return Ok(false);
        }

        let window = guard.span;
        let fired = {
            let mut inbox = self.inbox.lock().await;
            let fired = self.on_interval_freed(&inbox, &resource, window);
            inbox.claim(&fired);
            fired
        };
        let persisted = self
            .persist(&Event::BookingCancelled {
                id: booking_id,
                interval_id: booking.interval_id,
                fired: fired.clone(),
            })
            .await;
        let mut inbox = self.inbox.lock().await;
        inbox.release(&fired);
        persisted?;
        self.store.release_booking(&mut guard, booking_id);
        inbox.apply_fired(&fired);
        drop(inbox);
        drop(guard);

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        metrics::counter!(crate::observability::NOTIFICATIONS_QUEUED_TOTAL)
            .increment(fired.len() as u64);
        info!(
            "booking {booking_id} cancelled: interval {} free again, {} notifications queued",
            booking.interval_id,
            fired.len()
        );
        for notification in &fired {
            self.notify.send(notification);
        }
        Ok(true)
    }
}
