use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
/// Each interval row has its own lock; holding it is what makes a booking
/// transition exclusive for that interval and nothing else.
pub type SharedInterval = Arc<Mutex<Interval>>;

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Every interval on the resource as `(span, id)`, sorted by `span.start`.
    pub intervals: Vec<(Span, IntervalId)>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            intervals: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_interval(&mut self, span: Span, id: IntervalId) {
        let pos = self
            .intervals
            .binary_search_by_key(&span.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, (span, id));
    }

    pub fn remove_interval(&mut self, id: IntervalId) -> Option<Span> {
        let pos = self.intervals.iter().position(|(_, i)| *i == id)?;
        Some(self.intervals.remove(pos).0)
    }

    /// Intervals whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &(Span, IntervalId)> {
        let right_bound = self
            .intervals
            .partition_point(|(s, _)| s.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
    }

    /// Intervals whose span fully contains `query`, in start order.
    pub fn containing(&self, query: &Span) -> impl Iterator<Item = &(Span, IntervalId)> {
        let right_bound = self
            .intervals
            .partition_point(|(s, _)| s.start <= query.start);
        self.intervals[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end >= query.end)
    }
}

/// Monotonic id source. Ids start at 1 and are never reused, even when the
/// transaction that drew one fails.
#[derive(Debug)]
pub struct Sequence(AtomicU64);

impl Default for Sequence {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl Sequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure a replayed id is never handed out again.
    pub fn observe(&self, id: u64) {
        self.0.fetch_max(id + 1, Ordering::Relaxed);
    }
}

/// Id-indexed tables. Cross references are plain ids resolved through here.
#[derive(Default)]
pub struct Store {
    resources: DashMap<ResourceId, SharedResourceState>,
    intervals: DashMap<IntervalId, SharedInterval>,
    bookings: DashMap<BookingId, Booking>,
    /// Interval → every booking that has ever referenced it, oldest first.
    interval_bookings: DashMap<IntervalId, Vec<BookingId>>,
    user_bookings: DashMap<UserId, Vec<BookingId>>,
    pub resource_ids: Sequence,
    pub interval_ids: Sequence,
    pub booking_ids: Sequence,
    pub subscription_ids: Sequence,
    pub notification_ids: Sequence,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Resource ids in ascending order.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub(super) fn insert_resource(&self, resource: Resource) {
        self.resource_ids.observe(resource.id);
        self.resources
            .insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource))));
    }

    // ── Intervals ────────────────────────────────────────────

    pub(super) fn get_interval_row(&self, id: &IntervalId) -> Option<SharedInterval> {
        self.intervals.get(id).map(|e| e.value().clone())
    }

    pub fn contains_interval(&self, id: &IntervalId) -> bool {
        self.intervals.contains_key(id)
    }

    /// Snapshot of one interval row.
    pub async fn get_interval(&self, id: IntervalId) -> Option<Interval> {
        let row = self.get_interval_row(&id)?;
        let guard = row.lock().await;
        Some(guard.clone())
    }

    /// Snapshots of a resource's intervals in start order, optionally only
    /// those overlapping `range`. `None` if the resource does not exist.
    pub async fn intervals_for_resource(
        &self,
        resource_id: ResourceId,
        range: Option<Span>,
    ) -> Option<Vec<Interval>> {
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        let ids: Vec<IntervalId> = match range {
            Some(r) => guard.overlapping(&r).map(|(_, id)| *id).collect(),
            None => guard.intervals.iter().map(|(_, id)| *id).collect(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(interval) = self.get_interval(id).await {
                out.push(interval);
            }
        }
        Some(out)
    }

    pub(super) fn insert_interval(&self, rs: &mut ResourceState, interval: Interval) {
        self.interval_ids.observe(interval.id);
        rs.insert_interval(interval.span, interval.id);
        self.intervals
            .insert(interval.id, Arc::new(Mutex::new(interval)));
    }

    pub(super) fn remove_interval(&self, rs: &mut ResourceState, id: IntervalId) {
        rs.remove_interval(id);
        self.intervals.remove(&id);
        self.interval_bookings.remove(&id);
    }

    pub fn interval_has_bookings(&self, id: &IntervalId) -> bool {
        self.interval_bookings
            .get(id)
            .is_some_and(|b| !b.is_empty())
    }

    /// The single mutation path for an interval's booked flag. Callers hold
    /// the row lock inside an allocation transaction. Returns whether the
    /// state changed.
    pub(super) fn set_booked_state(
        row: &mut Interval,
        booked: bool,
        booked_by: Option<UserId>,
        at: Option<Ms>,
    ) -> bool {
        if row.booked == booked && row.booked_by == booked_by {
            return false;
        }
        row.booked = booked;
        row.booked_by = if booked { booked_by } else { None };
        row.booked_at = if booked { at } else { None };
        true
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn get_booking(&self, id: &BookingId) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn bookings_for_user(&self, user_id: &UserId) -> Vec<Booking> {
        let ids = self
            .user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_booking(id)).collect()
    }

    pub fn bookings_for_interval(&self, interval_id: &IntervalId) -> Vec<Booking> {
        let ids = self
            .interval_bookings
            .get(interval_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_booking(id)).collect()
    }

    /// All bookings in id order. Used by compaction.
    pub(super) fn all_bookings(&self) -> Vec<Booking> {
        let mut all: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        all.sort_unstable_by_key(|b| b.id);
        all
    }

    /// Apply a committed booking: flip the held row and insert the booking.
    pub(super) fn confirm_booking(&self, row: &mut Interval, booking: Booking) {
        Self::set_booked_state(row, true, Some(booking.user_id), Some(booking.created_at));
        self.booking_ids.observe(booking.id);
        self.interval_bookings
            .entry(booking.interval_id)
            .or_default()
            .push(booking.id);
        self.user_bookings
            .entry(booking.user_id)
            .or_default()
            .push(booking.id);
        self.bookings.insert(booking.id, booking);
    }

    /// Apply a committed cancellation: mark the booking cancelled and release the held row.
    pub(super) fn release_booking(&self, row: &mut Interval, booking_id: BookingId) {
        if let Some(mut booking) = self.bookings.get_mut(&booking_id) {
            booking.status = BookingStatus::Cancelled;
        }
        Self::set_booked_state(row, false, None, None);
    }

    pub(super) fn set_payment_status(&self, id: &BookingId, status: PaymentStatus) -> bool {
        match self.bookings.get_mut(id) {
            Some(mut booking) => {
                booking.payment_status = status;
                true
            }
            None => false,
        }
    }
}
