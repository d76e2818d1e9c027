use std::sync::Arc;
use std::time::Duration;

use courier_storage::{DynNotificationStore, NotificationStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, now_ts};

/// Periodic reaper for scheduled notifications.
///
/// Each tick scans for due PENDING records, claims each one with a
/// conditional PENDING → ACTIVE update, and delivers the claimed ones. The
/// claim is first-write-wins, so replicas scanning the same due set never
/// process a record twice.
pub struct SchedulerWorker {
    store: DynNotificationStore,
    coordinator: Arc<Coordinator>,
    tick: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SchedulerWorker {
    pub fn new(
        store: DynNotificationStore,
        coordinator: Arc<Coordinator>,
        tick: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            coordinator,
            tick,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first scan should wait a full tick
        ticker.tick().await;

        info!(tick_secs = self.tick.as_secs(), "Scheduler worker started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.reap_once(now_ts()).await;
                }
            }
        }
        info!("Scheduler worker stopped");
    }

    /// One scan: claim and deliver every record due at `now`. Records are
    /// handled sequentially to bound memory.
    pub async fn reap_once(&self, now: i64) {
        let due = match self.store.get_pending_scheduled(now).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "Failed to scan scheduled notifications");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        info!(count = due.len(), "Processing scheduled notifications");
        for record in due {
            let id = record.id;
            match self.store.claim(id).await {
                Ok(true) => {}
                Ok(false) => {
                    // another replica holds the claim
                    debug!(id, "Scheduled record already claimed");
                    continue;
                }
                Err(err) => {
                    error!(id, error = %err, "Claim failed");
                    continue;
                }
            }

            if let Err(err) = self.coordinator.process_stored(record).await {
                warn!(id, error = %err, "Scheduled notification failed");
            }
        }
    }
}
