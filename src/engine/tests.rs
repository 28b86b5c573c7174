use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

const T0: Ms = 1_704_103_200_000; // 2024-01-01T10:00Z
const H: Ms = 3_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("spotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap()
}

fn fresh(name: &str) -> Engine {
    open(&test_wal_path(name))
}

/// A resource at 100/h, 1800/day with one interval `[T0, T0 + 4h)`.
async fn spot_with_interval(engine: &Engine, label: &str) -> (ResourceId, IntervalId) {
    let rid = engine
        .create_resource(1, label.into(), 100.0, 1800.0)
        .await
        .unwrap();
    let iid = engine.add_interval(rid, T0, T0 + 4 * H).await.unwrap();
    (rid, iid)
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn book_prices_and_consumes_interval() {
    let engine = fresh("book_basic.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;

    let booking = assert_ok!(engine.book(10, rid, iid, T0, T0 + 2 * H).await);
    assert_eq!(booking.total_price, 200.0);
    assert_eq!(booking.duration_hours, 2.0);
    assert_eq!(booking.status, BookingStatus::Active);
    assert_eq!(booking.payment_status, PaymentStatus::Pending);
    assert_eq!(booking.span, Span::new(T0, T0 + 2 * H));

    let interval = engine.get_interval(iid).await.unwrap();
    assert!(interval.booked);
    assert_eq!(interval.booked_by, Some(10));
    assert_eq!(interval.booked_at, Some(booking.created_at));

    // The same interval cannot be booked again, even for the untouched remainder.
    let err = assert_err!(engine.book(11, rid, iid, T0 + 2 * H, T0 + 4 * H).await);
    assert_eq!(err, EngineError::Conflict(iid));
    assert!(
        engine
            .find_free_intervals_containing(rid, T0 + 2 * H, T0 + 3 * H)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn book_outside_interval_is_invalid_range() {
    let engine = fresh("book_outside.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;

    let err = assert_err!(engine.book(10, rid, iid, T0 + 3 * H, T0 + 5 * H).await);
    assert!(matches!(err, EngineError::InvalidRange { .. }));
    assert!(engine.get_interval(iid).await.unwrap().is_free());
    assert!(engine.bookings_for_user(10).is_empty());
}

#[tokio::test]
async fn book_rejects_bad_bounds() {
    let engine = fresh("book_bounds.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;

    let err = assert_err!(engine.book(10, rid, iid, T0 + H, T0 + H).await);
    assert_eq!(err, EngineError::InvalidRange { start: T0 + H, end: T0 + H });
    let err = assert_err!(engine.book(10, rid, iid, T0 + 2 * H, T0 + H).await);
    assert!(matches!(err, EngineError::InvalidRange { .. }));
    let err = assert_err!(engine.book(10, rid, iid, 1_000, 2_000).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn book_unknown_or_mismatched_interval() {
    let engine = fresh("book_unknown.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let (other, _) = spot_with_interval(&engine, "B1").await;

    let err = assert_err!(engine.book(10, rid, 999, T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Interval, 999));
    let err = assert_err!(engine.book(10, other, iid, T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Interval, iid));
    let err = assert_err!(engine.book(10, 999, iid, T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Resource, 999));
}

#[tokio::test]
async fn inactive_resource_is_not_bookable_or_listed() {
    let engine = fresh("inactive.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;

    assert!(assert_ok!(engine.set_resource_active(rid, false).await));
    assert!(!assert_ok!(engine.set_resource_active(rid, false).await));

    let err = assert_err!(engine.book(10, rid, iid, T0, T0 + H).await);
    assert_eq!(err, EngineError::Inactive(rid));
    assert!(
        engine
            .find_free_intervals_containing(rid, T0, T0 + H)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(engine.find_resources_available(T0, T0 + H).await.unwrap().is_empty());

    // Reactivating brings the interval back.
    assert_ok!(engine.set_resource_active(rid, true).await);
    assert_ok!(engine.book(10, rid, iid, T0, T0 + H).await);
}

#[tokio::test]
async fn rates_apply_to_later_bookings_only() {
    let engine = fresh("rates.wal");
    let (rid, first) = spot_with_interval(&engine, "A1").await;
    let second = engine.add_interval(rid, T0 + 4 * H, T0 + 8 * H).await.unwrap();

    let old = engine.book(10, rid, first, T0, T0 + H).await.unwrap();
    assert_ok!(engine.update_rates(rid, 50.0, 900.0).await);
    let new = engine.book(10, rid, second, T0 + 4 * H, T0 + 5 * H).await.unwrap();

    assert_eq!(engine.get_booking(old.id).unwrap().total_price, 100.0);
    assert_eq!(new.total_price, 50.0);

    let err = assert_err!(engine.update_rates(rid, -1.0, 900.0).await);
    assert_eq!(err, EngineError::InvalidRate);
    let err = assert_err!(engine.update_rates(rid, f64::NAN, 900.0).await);
    assert_eq!(err, EngineError::InvalidRate);
}

#[tokio::test]
async fn create_resource_validates_input() {
    let engine = fresh("create_validate.wal");
    let err = assert_err!(engine.create_resource(1, "A".into(), f64::INFINITY, 1.0).await);
    assert_eq!(err, EngineError::InvalidRate);
    let long = "x".repeat(crate::limits::MAX_LABEL_LEN + 1);
    let err = assert_err!(engine.create_resource(1, long, 1.0, 1.0).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert!(engine.list_resources().await.is_empty());
}

#[tokio::test]
async fn quote_uses_current_rates() {
    let engine = fresh("quote.wal");
    let (rid, _) = spot_with_interval(&engine, "A1").await;

    let q = engine.quote(rid, T0, T0 + 26 * H).await.unwrap();
    assert_eq!(q.amount, 1800.0 + 200.0);
    assert_eq!(q.duration_hours, 26.0);

    let err = assert_err!(engine.quote(999, T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Resource, 999));
}

#[tokio::test]
async fn payment_status_is_recorded() {
    let engine = fresh("payment.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();

    assert_ok!(engine.set_payment_status(booking.id, PaymentStatus::Paid).await);
    assert_eq!(
        engine.get_booking(booking.id).unwrap().payment_status,
        PaymentStatus::Paid
    );
    let err = assert_err!(engine.set_payment_status(999, PaymentStatus::Paid).await);
    assert_eq!(err, EngineError::NotFound(Entity::Booking, 999));
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn book_then_cancel_restores_free_state() {
    let engine = fresh("round_trip.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let before = engine.get_interval(iid).await.unwrap();
    let free_before = engine
        .find_free_intervals_containing(rid, T0, T0 + H)
        .await
        .unwrap();

    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    assert!(assert_ok!(engine.cancel(booking.id).await));

    assert_eq!(engine.get_interval(iid).await.unwrap(), before);
    assert_eq!(
        engine
            .find_free_intervals_containing(rid, T0, T0 + H)
            .await
            .unwrap(),
        free_before
    );
    assert_eq!(
        engine.get_booking(booking.id).unwrap().status,
        BookingStatus::Cancelled
    );

    // Second cancel is a no-op.
    assert!(!assert_ok!(engine.cancel(booking.id).await));
    // The interval can be booked again.
    assert_ok!(engine.book(11, rid, iid, T0 + H, T0 + 3 * H).await);
}

#[tokio::test]
async fn cancel_unknown_booking() {
    let engine = fresh("cancel_unknown.wal");
    let err = assert_err!(engine.cancel(42).await);
    assert_eq!(err, EngineError::NotFound(Entity::Booking, 42));
}

#[tokio::test]
async fn bookings_listed_by_user_and_resource() {
    let engine = fresh("listings.wal");
    let (rid, first) = spot_with_interval(&engine, "A1").await;
    let second = engine.add_interval(rid, T0 + 4 * H, T0 + 6 * H).await.unwrap();

    let b1 = engine.book(10, rid, second, T0 + 4 * H, T0 + 5 * H).await.unwrap();
    engine.cancel(b1.id).await.unwrap();
    let b2 = engine.book(11, rid, first, T0, T0 + H).await.unwrap();
    let b3 = engine.book(10, rid, second, T0 + 5 * H, T0 + 6 * H).await.unwrap();

    let mine: Vec<BookingId> = engine.bookings_for_user(10).iter().map(|b| b.id).collect();
    assert_eq!(mine, vec![b1.id, b3.id]);

    // Interval start order, then booking order; cancelled bookings included.
    let on_spot: Vec<BookingId> = engine
        .bookings_for_resource(rid)
        .await
        .unwrap()
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(on_spot, vec![b2.id, b1.id, b3.id]);
    assert!(engine.bookings_for_resource(999).await.is_err());
}

// ── Subscriptions ────────────────────────────────────────

#[tokio::test]
async fn cancellation_notifies_subscriber_once() {
    let engine = fresh("notify_once.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let booking = engine.book(10, rid, iid, T0, T0 + 4 * H).await.unwrap();

    let sid = engine.subscribe(42, Some(rid), T0 + H, T0 + 2 * H).await.unwrap();
    assert!(engine.pending_notifications(42).await.is_empty());

    assert!(engine.cancel(booking.id).await.unwrap());

    let pending = engine.pending_notifications(42).await;
    assert_eq!(pending.len(), 1);
    let n = &pending[0];
    assert_eq!(n.subscription_id, sid);
    assert_eq!(n.resource_id, rid);
    assert_eq!(n.window, Span::new(T0, T0 + 4 * H));
    assert!(n.text.contains("A1"));
    assert!(!engine.get_subscription(sid).await.unwrap().active);

    // Spent subscriptions do not fire again.
    let again = engine.book(11, rid, iid, T0, T0 + H).await.unwrap();
    engine.cancel(again.id).await.unwrap();
    assert_eq!(engine.pending_notifications(42).await.len(), 1);
}

#[tokio::test]
async fn matching_respects_resource_and_window() {
    let engine = fresh("notify_match.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let (other, _) = spot_with_interval(&engine, "B1").await;
    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();

    engine.subscribe(40, None, T0 + 3 * H, T0 + 5 * H).await.unwrap(); // any resource
    engine.subscribe(41, Some(rid), T0 + 4 * H, T0 + 5 * H).await.unwrap(); // adjacent only
    engine.subscribe(42, Some(other), T0, T0 + H).await.unwrap(); // other resource
    engine.subscribe(43, Some(rid), T0, T0 + H).await.unwrap();

    engine.cancel(booking.id).await.unwrap();

    assert_eq!(engine.pending_notifications(40).await.len(), 1);
    assert!(engine.pending_notifications(41).await.is_empty());
    assert!(engine.pending_notifications(42).await.is_empty());
    assert_eq!(engine.pending_notifications(43).await.len(), 1);
}

#[tokio::test]
async fn cancellation_broadcasts_to_listeners() {
    let engine = fresh("notify_hub.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    engine.subscribe(42, Some(rid), T0, T0 + H).await.unwrap();

    let mut rx = engine.notify.subscribe(42);
    engine.cancel(booking.id).await.unwrap();

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered, engine.pending_notifications(42).await[0]);
}

#[tokio::test]
async fn unsubscribe_stops_matching() {
    let engine = fresh("unsubscribe.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    let sid = engine.subscribe(42, Some(rid), T0, T0 + H).await.unwrap();

    assert!(assert_ok!(engine.unsubscribe(sid).await));
    assert!(!assert_ok!(engine.unsubscribe(sid).await));
    let err = assert_err!(engine.unsubscribe(999).await);
    assert_eq!(err, EngineError::NotFound(Entity::Subscription, 999));

    engine.cancel(booking.id).await.unwrap();
    assert!(engine.pending_notifications(42).await.is_empty());
    assert_eq!(engine.subscriptions_for_user(42).await.len(), 1);
}

#[tokio::test]
async fn subscribe_validates_input() {
    let engine = fresh("subscribe_validate.wal");
    let err = assert_err!(engine.subscribe(42, Some(7), T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Resource, 7));
    let err = assert_err!(engine.subscribe(42, None, T0 + H, T0).await);
    assert!(matches!(err, EngineError::InvalidRange { .. }));
}

#[tokio::test]
async fn mark_read_clears_pending() {
    let engine = fresh("mark_read.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    for user in [42, 43] {
        engine.subscribe(user, Some(rid), T0, T0 + H).await.unwrap();
    }
    engine.subscribe(42, None, T0, T0 + H).await.unwrap();
    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    engine.cancel(booking.id).await.unwrap();

    assert_eq!(engine.pending_notifications(42).await.len(), 2);
    assert_eq!(assert_ok!(engine.mark_read(42).await), 2);
    assert!(engine.pending_notifications(42).await.is_empty());
    assert_eq!(assert_ok!(engine.mark_read(42).await), 0);
    // Other users are untouched.
    assert_eq!(engine.pending_notifications(43).await.len(), 1);
}

// ── Intervals and queries ────────────────────────────────

#[tokio::test]
async fn add_interval_rejects_overlap() {
    let engine = fresh("overlap.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;

    let err = assert_err!(engine.add_interval(rid, T0 + 3 * H, T0 + 5 * H).await);
    assert_eq!(err, EngineError::Overlapping(iid));
    let err = assert_err!(engine.add_interval(rid, T0 + H, T0 + 2 * H).await);
    assert_eq!(err, EngineError::Overlapping(iid));
    // Touching bounds are fine.
    assert_ok!(engine.add_interval(rid, T0 + 4 * H, T0 + 5 * H).await);
    assert_ok!(engine.add_interval(rid, T0 - H, T0).await);

    let err = assert_err!(engine.add_interval(999, T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Resource, 999));
}

#[tokio::test]
async fn remove_interval_only_when_untouched() {
    let engine = fresh("remove_interval.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let spare = engine.add_interval(rid, T0 + 4 * H, T0 + 5 * H).await.unwrap();

    assert_ok!(engine.remove_interval(spare).await);
    assert!(engine.get_interval(spare).await.is_none());
    assert_eq!(engine.intervals_for_resource(rid, None).await.unwrap().len(), 1);

    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    assert_eq!(assert_err!(engine.remove_interval(iid).await), EngineError::InUse(iid));
    engine.cancel(booking.id).await.unwrap();
    // Still referenced by the cancelled booking.
    assert_eq!(assert_err!(engine.remove_interval(iid).await), EngineError::InUse(iid));

    let err = assert_err!(engine.remove_interval(spare).await);
    assert_eq!(err, EngineError::NotFound(Entity::Interval, spare));
    let err = assert_err!(engine.book(10, rid, spare, T0 + 4 * H, T0 + 5 * H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Interval, spare));
}

#[tokio::test]
async fn free_query_returns_containing_free_intervals() {
    let engine = fresh("free_query.wal");
    let rid = engine.create_resource(1, "A1".into(), 1.0, 10.0).await.unwrap();
    let late = engine.add_interval(rid, T0 + 10 * H, T0 + 20 * H).await.unwrap();
    let early = engine.add_interval(rid, T0, T0 + 2 * H).await.unwrap();
    let short = engine.add_interval(rid, T0 + 2 * H, T0 + 3 * H).await.unwrap();
    let taken = engine.add_interval(rid, T0 + 5 * H, T0 + 9 * H).await.unwrap();
    engine.book(10, rid, taken, T0 + 5 * H, T0 + 6 * H).await.unwrap();

    let ids = |v: Vec<Interval>| v.iter().map(|i| i.id).collect::<Vec<_>>();
    assert_eq!(
        ids(engine.find_free_intervals_containing(rid, T0 + H, T0 + 2 * H).await.unwrap()),
        vec![early]
    );
    assert_eq!(
        ids(engine.find_free_intervals_containing(rid, T0 + 12 * H, T0 + 13 * H).await.unwrap()),
        vec![late]
    );
    // No stitching across adjacent free intervals.
    assert!(
        engine
            .find_free_intervals_containing(rid, T0 + H, T0 + 3 * H)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        engine
            .find_free_intervals_containing(rid, T0 + 6 * H, T0 + 7 * H)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        ids(engine.intervals_for_resource(rid, None).await.unwrap()),
        vec![early, short, taken, late]
    );
    assert_eq!(
        ids(engine
            .intervals_for_resource(rid, Some((T0 + H, T0 + 6 * H)))
            .await
            .unwrap()),
        vec![early, short, taken]
    );

    let err = assert_err!(engine.find_free_intervals_containing(999, T0, T0 + H).await);
    assert_eq!(err, EngineError::NotFound(Entity::Resource, 999));
    let err = assert_err!(engine.find_free_intervals_containing(rid, T0 + H, T0).await);
    assert!(matches!(err, EngineError::InvalidRange { .. }));
}

#[tokio::test]
async fn available_resources_sorted_by_label() {
    let engine = fresh("available.wal");
    let (c, _) = spot_with_interval(&engine, "C").await;
    let (a, _) = spot_with_interval(&engine, "A").await;
    let (b, b_interval) = spot_with_interval(&engine, "B").await;
    let (d, _) = spot_with_interval(&engine, "D").await;
    engine.set_resource_active(d, false).await.unwrap();

    let ids = |v: Vec<Resource>| v.iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(
        ids(engine.find_resources_available(T0, T0 + H).await.unwrap()),
        vec![a, b, c]
    );

    engine.book(10, b, b_interval, T0, T0 + H).await.unwrap();
    assert_eq!(
        ids(engine.find_resources_available(T0, T0 + H).await.unwrap()),
        vec![a, c]
    );
    assert!(
        engine
            .find_resources_available(T0 + 3 * H, T0 + 5 * H)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(engine.list_resources().await.len(), 4);
}

// ── Persistence ──────────────────────────────────────────

async fn populate(engine: &Engine) -> (ResourceId, IntervalId, BookingId, BookingId) {
    let (rid, iid) = spot_with_interval(engine, "A1").await;
    let (other, _) = spot_with_interval(engine, "B1").await;
    engine.update_rates(other, 3.0, 30.0).await.unwrap();
    engine.set_resource_active(other, false).await.unwrap();
    let spare = engine.add_interval(rid, T0 + 4 * H, T0 + 5 * H).await.unwrap();
    engine.remove_interval(spare).await.unwrap();

    engine.subscribe(42, Some(rid), T0, T0 + H).await.unwrap();
    engine.subscribe(43, None, T0 + 2 * H, T0 + 3 * H).await.unwrap();
    let cancelled = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    engine
        .set_payment_status(cancelled.id, PaymentStatus::Refunded)
        .await
        .unwrap();
    engine.cancel(cancelled.id).await.unwrap();
    let active = engine.book(11, rid, iid, T0, T0 + 2 * H).await.unwrap();
    engine.mark_read(42).await.unwrap();
    (rid, iid, cancelled.id, active.id)
}

async fn assert_populated(engine: &Engine, ids: (ResourceId, IntervalId, BookingId, BookingId)) {
    let (rid, iid, cancelled, active) = ids;
    let resources = engine.list_resources().await;
    assert_eq!(resources.len(), 2);
    assert!(resources[0].active);
    assert!(!resources[1].active);
    assert_eq!(resources[1].rate_hour, 3.0);

    assert_eq!(engine.intervals_for_resource(rid, None).await.unwrap().len(), 1);
    let interval = engine.get_interval(iid).await.unwrap();
    assert!(interval.booked);
    assert_eq!(interval.booked_by, Some(11));

    let c = engine.get_booking(cancelled).unwrap();
    assert_eq!(c.status, BookingStatus::Cancelled);
    assert_eq!(c.payment_status, PaymentStatus::Refunded);
    assert!(engine.get_booking(active).unwrap().is_active());

    assert!(!engine.subscriptions_for_user(42).await[0].active);
    assert!(!engine.subscriptions_for_user(43).await[0].active);
    assert!(engine.pending_notifications(42).await.is_empty());
    assert_eq!(engine.pending_notifications(43).await.len(), 1);
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let ids = {
        let engine = open(&path);
        let ids = populate(&engine).await;
        engine.shutdown().await.unwrap();
        ids
    };

    let engine = open(&path);
    assert_populated(&engine, ids).await;

    // Sequences resume past every replayed id.
    let rid = engine.create_resource(1, "C1".into(), 1.0, 1.0).await.unwrap();
    assert!(rid > ids.0 + 1);
    let sid = engine.subscribe(44, None, T0, T0 + H).await.unwrap();
    assert!(sid > 2);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let ids = {
        let engine = open(&path);
        let ids = populate(&engine).await;
        let before = engine.wal_appends_since_compact().await;
        assert_ok!(engine.compact_wal().await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        engine.shutdown().await.unwrap();
        assert!((Wal::replay(&path).unwrap().len() as u64) < before);
        ids
    };

    let engine = open(&path);
    assert_populated(&engine, ids).await;
}

#[tokio::test]
async fn writes_after_shutdown_fail_retryably() {
    let engine = fresh("after_shutdown.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    engine.shutdown().await.unwrap();

    let err = assert_err!(engine.book(10, rid, iid, T0, T0 + H).await);
    assert!(matches!(err, EngineError::WalError(_)));
    assert!(err.is_retryable());
    // Nothing was applied.
    assert!(engine.get_interval(iid).await.unwrap().is_free());
    assert!(engine.bookings_for_user(10).is_empty());
}

fn booking_on_first_interval(id: BookingId, user_id: UserId) -> Event {
    Event::BookingConfirmed {
        booking: Booking {
            id,
            user_id,
            resource_id: 1,
            interval_id: 1,
            span: Span::new(T0, T0 + H),
            total_price: 100.0,
            duration_hours: 1.0,
            status: BookingStatus::Active,
            payment_status: PaymentStatus::Pending,
            created_at: T0,
        },
    }
}

fn write_log(path: &PathBuf, events: &[Event]) {
    let mut wal = Wal::open(path).unwrap();
    for event in events {
        wal.buffer(event).unwrap();
    }
    wal.sync().unwrap();
}

fn spot_log() -> Vec<Event> {
    vec![
        Event::ResourceCreated {
            id: 1,
            owner_id: 1,
            label: "A1".into(),
            rate_hour: 100.0,
            rate_day: 1800.0,
        },
        Event::IntervalAdded {
            id: 1,
            resource_id: 1,
            span: Span::new(T0, T0 + 4 * H),
        },
    ]
}

#[tokio::test]
async fn replay_keeps_only_the_first_booking_of_an_interval() {
    let path = test_wal_path("replay_double_book.wal");
    let mut log = spot_log();
    log.push(booking_on_first_interval(1, 10));
    log.push(booking_on_first_interval(2, 11));
    write_log(&path, &log);

    let engine = open(&path);
    let on_interval: Vec<UserId> = engine
        .bookings_for_resource(1)
        .await
        .unwrap()
        .iter()
        .filter(|b| b.is_active())
        .map(|b| b.user_id)
        .collect();
    assert_eq!(on_interval, vec![10]);
    assert!(engine.get_booking(2).is_none());
    assert_eq!(engine.get_interval(1).await.unwrap().booked_by, Some(10));
}

#[tokio::test]
async fn replay_ignores_cancel_of_inactive_booking() {
    let path = test_wal_path("replay_double_cancel.wal");
    let stale = Notification {
        id: 1,
        user_id: 42,
        subscription_id: 1,
        resource_id: 1,
        window: Span::new(T0, T0 + 4 * H),
        text: "free".into(),
        read: false,
        created_at: T0,
    };
    let mut log = spot_log();
    log.push(booking_on_first_interval(1, 10));
    log.push(Event::BookingCancelled {
        id: 1,
        interval_id: 1,
        fired: vec![],
    });
    log.push(Event::BookingCancelled {
        id: 1,
        interval_id: 1,
        fired: vec![stale],
    });
    log.push(Event::BookingCancelled {
        id: 7,
        interval_id: 1,
        fired: vec![],
    });
    write_log(&path, &log);

    let engine = open(&path);
    assert_eq!(engine.get_booking(1).unwrap().status, BookingStatus::Cancelled);
    assert!(engine.get_interval(1).await.unwrap().is_free());
    assert!(engine.pending_notifications(42).await.is_empty());
}

#[tokio::test]
async fn restart_appends_past_a_torn_tail() {
    let path = test_wal_path("replay_torn_tail.wal");
    write_log(&path, &spot_log());
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
    }

    let engine = open(&path);
    let booking = engine.book(10, 1, 1, T0, T0 + H).await.unwrap();
    engine.shutdown().await.unwrap();
    drop(engine);

    let engine = open(&path);
    assert!(engine.get_booking(booking.id).unwrap().is_active());
}

#[tokio::test]
async fn cancel_drops_channels_nobody_listens_on() {
    let engine = fresh("notify_prune.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
    engine.subscribe(42, Some(rid), T0, T0 + H).await.unwrap();

    drop(engine.notify.subscribe(42));
    assert_eq!(engine.notify.user_channels(), 1);
    engine.cancel(booking.id).await.unwrap();

    assert_eq!(engine.notify.user_channels(), 0);
    assert_eq!(engine.pending_notifications(42).await.len(), 1);
}

// ── Concurrency ──────────────────────────────────────────

async fn random_yields() {
    let spins = rand::rng().random_range(0..4);
    for _ in 0..spins {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_bookings_have_one_winner() {
    const TRIALS: i64 = 1000;
    const RACERS: u64 = 4;

    let engine = Arc::new(fresh("race.wal"));
    let rid = engine.create_resource(1, "A1".into(), 1.0, 10.0).await.unwrap();

    for trial in 0..TRIALS {
        let start = T0 + trial * H;
        let iid = engine.add_interval(rid, start, start + H).await.unwrap();

        let handles: Vec<_> = (0..RACERS)
            .map(|user| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    random_yields().await;
                    engine.book(user, rid, iid, start, start + H).await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert_eq!(e, EngineError::Conflict(iid)),
            }
        }
        assert_eq!(winners, 1, "trial {trial}");
        assert_eq!(engine.bookings_for_resource(rid).await.unwrap().len() as i64, trial + 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_cancels_fire_once() {
    let engine = Arc::new(fresh("race_cancel.wal"));
    let (rid, iid) = spot_with_interval(&engine, "A1").await;

    for round in 0..50u64 {
        let user = 100 + round;
        let booking = engine.book(10, rid, iid, T0, T0 + H).await.unwrap();
        engine.subscribe(user, Some(rid), T0, T0 + H).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    random_yields().await;
                    engine.cancel(booking.id).await
                })
            })
            .collect();
        let mut cancelled = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 1);
        assert_eq!(engine.pending_notifications(user).await.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_intervals_book_in_parallel() {
    let engine = Arc::new(fresh("parallel.wal"));
    let rid = engine.create_resource(1, "A1".into(), 1.0, 10.0).await.unwrap();
    let mut intervals = Vec::new();
    for i in 0..32 {
        let start = T0 + i * H;
        intervals.push((engine.add_interval(rid, start, start + H).await.unwrap(), start));
    }

    let handles: Vec<_> = intervals
        .into_iter()
        .enumerate()
        .map(|(user, (iid, start))| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.book(user as u64, rid, iid, start, start + H).await })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }
    assert!(
        engine
            .intervals_for_resource(rid, None)
            .await
            .unwrap()
            .iter()
            .all(|i| i.booked)
    );
}

#[tokio::test]
async fn deactivation_waits_for_a_booking_in_flight() {
    use std::pin::pin;

    let engine = fresh("deactivate_during_book.wal");
    let (rid, iid) = spot_with_interval(&engine, "A1").await;
    let row = engine.store.get_interval_row(&iid).unwrap();
    let held = row.lock().await;

    // The booking has passed its active check and waits on the row.
    let mut book = pin!(engine.book(10, rid, iid, T0, T0 + H));
    assert!(futures::poll!(book.as_mut()).is_pending());
    let mut deactivate = pin!(engine.set_resource_active(rid, false));
    assert!(futures::poll!(deactivate.as_mut()).is_pending());

    drop(held);
    let booking = assert_ok!(book.await);
    assert!(assert_ok!(deactivate.await));

    assert!(engine.get_booking(booking.id).unwrap().is_active());
    assert!(!engine.get_resource(rid).await.unwrap().active);
    let other = engine.add_interval(rid, T0 + 4 * H, T0 + 5 * H).await.unwrap();
    let err = assert_err!(engine.book(11, rid, other, T0 + 4 * H, T0 + 5 * H).await);
    assert_eq!(err, EngineError::Inactive(rid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancels_on_two_spots_fire_a_shared_subscription_once() {
    let path = test_wal_path("race_shared_sub.wal");
    let engine = Arc::new(open(&path));
    let (a, a_iid) = spot_with_interval(&engine, "A1").await;
    let (b, b_iid) = spot_with_interval(&engine, "B1").await;

    for round in 0..50u64 {
        let user = 100 + round;
        let on_a = engine.book(10, a, a_iid, T0, T0 + H).await.unwrap();
        let on_b = engine.book(11, b, b_iid, T0, T0 + H).await.unwrap();
        let sid = engine.subscribe(user, None, T0, T0 + H).await.unwrap();

        let handles: Vec<_> = [on_a.id, on_b.id]
            .into_iter()
            .map(|id| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    random_yields().await;
                    engine.cancel(id).await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(engine.pending_notifications(user).await.len(), 1, "round {round}");
        assert!(!engine.get_subscription(sid).await.unwrap().active);
    }

    engine.shutdown().await.unwrap();
    let reopened = open(&path);
    for round in 0..50u64 {
        assert_eq!(reopened.pending_notifications(100 + round).await.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_racing_cancels_replay_identically() {
    let path = test_wal_path("race_mark_read.wal");
    let engine = Arc::new(open(&path));
    let mut spots = Vec::new();
    for label in ["A1", "A2", "A3", "A4"] {
        spots.push(spot_with_interval(&engine, label).await);
    }

    for _ in 0..25 {
        let mut bookings = Vec::new();
        for (rid, iid) in &spots {
            bookings.push(engine.book(10, *rid, *iid, T0, T0 + H).await.unwrap().id);
            engine.subscribe(42, Some(*rid), T0, T0 + H).await.unwrap();
        }

        let mut handles: Vec<_> = bookings
            .into_iter()
            .map(|id| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    random_yields().await;
                    engine.cancel(id).await.map(|_| 0)
                })
            })
            .collect();
        for _ in 0..2 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                random_yields().await;
                engine.mark_read(42).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    let pending = engine.pending_notifications(42).await;
    engine.shutdown().await.unwrap();
    let reopened = open(&path);
    assert_eq!(reopened.pending_notifications(42).await, pending);
}
