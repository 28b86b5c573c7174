use crate::model::*;
use crate::pricing;

use super::conflict::validate_span;
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Free intervals of one resource that fully contain `[start, end)`,
    /// earliest start first. Adjacent free intervals are never stitched
    /// together; a request must fit one published window. Inactive resources
    /// have no free intervals.
    pub async fn find_free_intervals_containing(
        &self,
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Interval>, EngineError> {
        let query = validate_span(start, end)?;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))?;
        let guard = rs.read().await;
        if !guard.resource.active {
            return Ok(Vec::new());
        }

        let mut free = Vec::new();
        for (_, id) in guard.containing(&query) {
            if let Some(interval) = self.store.get_interval(*id).await
                && interval.is_free()
            {
                free.push(interval);
            }
        }
        Ok(free)
    }

    /// Active resources with at least one free interval containing
    /// `[start, end)`, ordered by label then id.
    pub async fn find_resources_available(
        &self,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Resource>, EngineError> {
        let query = validate_span(start, end)?;
        let mut available = Vec::new();
        for rid in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.resource.active {
                continue;
            }
            for (_, id) in guard.containing(&query) {
                if let Some(interval) = self.store.get_interval(*id).await
                    && interval.is_free()
                {
                    available.push(guard.resource.clone());
                    break;
                }
            }
        }
        available.sort_by(|a, b| a.label.cmp(&b.label).then(a.id.cmp(&b.id)));
        Ok(available)
    }

    pub async fn get_resource(&self, id: ResourceId) -> Option<Resource> {
        self.resource_snapshot(id).await.ok()
    }

    /// Every resource, active or not, in id order.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let mut out = Vec::new();
        for rid in self.store.resource_ids() {
            if let Some(resource) = self.get_resource(rid).await {
                out.push(resource);
            }
        }
        out
    }

    pub async fn get_interval(&self, id: IntervalId) -> Option<Interval> {
        self.store.get_interval(id).await
    }

    /// A resource's intervals (free and booked) in start order, optionally
    /// narrowed to those overlapping `range`.
    pub async fn intervals_for_resource(
        &self,
        resource_id: ResourceId,
        range: Option<(Ms, Ms)>,
    ) -> Result<Vec<Interval>, EngineError> {
        let range = match range {
            Some((start, end)) => Some(validate_span(start, end)?),
            None => None,
        };
        self.store
            .intervals_for_resource(resource_id, range)
            .await
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))
    }

    pub fn get_booking(&self, id: BookingId) -> Option<Booking> {
        self.store.get_booking(&id)
    }

    pub fn bookings_for_user(&self, user_id: UserId) -> Vec<Booking> {
        self.store.bookings_for_user(&user_id)
    }

    /// Bookings of every status for a resource, in interval start order and
    /// then booking order.
    pub async fn bookings_for_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .intervals
            .iter()
            .flat_map(|(_, id)| self.store.bookings_for_interval(id))
            .collect())
    }

    /// Price preview at the resource's current rates.
    pub async fn quote(
        &self,
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    ) -> Result<Quote, EngineError> {
        let span = validate_span(start, end)?;
        let resource = self.resource_snapshot(resource_id).await?;
        Ok(pricing::price(resource.rate_hour, resource.rate_day, &span))
    }
}
