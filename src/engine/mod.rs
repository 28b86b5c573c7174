mod allocation;
mod conflict;
mod error;
mod matcher;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use error::{EngineError, Entity};
pub use matcher::Inbox;
pub use store::{ResourceState, SharedInterval, SharedResourceState, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. One `sync` for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending: Option<WalCommand> = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break, // drained, flush what we have
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending
                    && !handle_non_append(&mut wal, other)
                {
                    break;
                }
            }
            other => {
                if !handle_non_append(&mut wal, other) {
                    break;
                }
            }
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// On failure the whole batch is rolled back off the log, so a caller that
/// saw an error never finds its record again after a restart.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.buffer(event))
        .and_then(|()| wal.sync());
    if result.is_err() {
        roll_back(wal);
    }
    result
}

fn roll_back(wal: &mut Wal) {
    if let Err(e) = wal.rollback() {
        tracing::error!("WAL rollback failed, retrying before the next write: {e}");
    }
}

/// Returns false once the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = wal.install_snapshot(&events);
            if result.is_err() {
                roll_back(wal);
            }
            let _ = response.send(result);
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.sync());
            false
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
            true
        }
    }
}

/// The availability and booking engine for one tenant.
///
/// Lock order, outermost first: `commit_gate` (shared by every mutation,
/// exclusive for compaction), a resource's interval index, one interval row,
/// the inbox.
pub struct Engine {
    pub store: Store,
    pub(super) inbox: Mutex<Inbox>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

/// Rebuild state from one WAL record. Nothing else holds these locks during
/// replay, so every `try_*` succeeds immediately.
fn replay_event(store: &Store, inbox: &mut Inbox, event: &Event) {
    match event {
        Event::ResourceCreated {
            id,
            owner_id,
            label,
            rate_hour,
            rate_day,
        } => store.insert_resource(Resource {
            id: *id,
            owner_id: *owner_id,
            label: label.clone(),
            rate_hour: *rate_hour,
            rate_day: *rate_day,
            active: true,
        }),
        Event::RatesUpdated {
            id,
            rate_hour,
            rate_day,
        } => {
            if let Some(rs) = store.get_resource(id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                guard.resource.rate_hour = *rate_hour;
                guard.resource.rate_day = *rate_day;
            }
        }
        Event::ResourceActiveSet { id, active } => {
            if let Some(rs) = store.get_resource(id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                guard.resource.active = *active;
            }
        }
        Event::IntervalAdded {
            id,
            resource_id,
            span,
        } => {
            if let Some(rs) = store.get_resource(resource_id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                store.insert_interval(&mut guard, Interval::new(*id, *resource_id, *span));
            }
        }
        Event::IntervalRemoved { id, resource_id } => {
            if let Some(rs) = store.get_resource(resource_id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                store.remove_interval(&mut guard, *id);
            }
        }
        Event::BookingConfirmed { booking } => {
            if let Some(row) = store.get_interval_row(&booking.interval_id) {
                let mut guard = row.try_lock().expect("replay: uncontended lock");
                if guard.booked || store.get_booking(&booking.id).is_some() {
                    warn!(
                        "replay: skipping booking {} on interval {}, already taken",
                        booking.id, booking.interval_id
                    );
                    return;
                }
                store.confirm_booking(&mut guard, booking.clone());
            }
        }
        Event::BookingCancelled {
            id,
            interval_id,
            fired,
        } => {
            if store.get_booking(id).is_none_or(|b| b.status != BookingStatus::Active) {
                warn!("replay: skipping cancel of booking {id}, not active");
                return;
            }
            if let Some(row) = store.get_interval_row(interval_id) {
                let mut guard = row.try_lock().expect("replay: uncontended lock");
                store.release_booking(&mut guard, *id);
            }
            for n in fired {
                store.notification_ids.observe(n.id);
            }
            inbox.apply_fired(fired);
        }
        Event::PaymentStatusSet { id, status } => {
            store.set_payment_status(id, *status);
        }
        Event::SubscriptionCreated { subscription } => {
            store.subscription_ids.observe(subscription.id);
            inbox.insert_subscription(subscription.clone());
        }
        Event::SubscriptionDeactivated { id } => {
            inbox.deactivate(*id);
        }
        Event::NotificationRestored { notification } => {
            store.notification_ids.observe(notification.id);
            inbox.push_notification(notification.clone());
        }
        Event::NotificationsRead { user_id, ids } => {
            inbox.mark_read(*user_id, ids);
        }
    }
}

impl Engine {
    /// Open the store: replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;

        let store = Store::new();
        let mut inbox = Inbox::default();
        for event in &events {
            replay_event(&store, &mut inbox, event);
        }
        if !events.is_empty() {
            info!(
                "replayed {} events from {}: {} resources",
                events.len(),
                wal_path.display(),
                store.resource_count()
            );
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            store,
            inbox: Mutex::new(inbox),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        })
    }

    /// Write event to WAL via the background group-commit writer. Returns once
    /// the record is durable.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Copy of a resource's current row.
    pub(super) async fn resource_snapshot(&self, id: ResourceId) -> Result<Resource, EngineError> {
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(Entity::Resource, id))?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    /// Close the store: wait for in-flight commits, flush, and stop the WAL
    /// writer. Every later mutation fails with `WalError`.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
