use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use courier_core::{BatchConfig, NotificationKind, NotificationRequest};
use courier_storage::{DynPartnerConfigStore, PartnerConfigStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::{Buffer, BufferReady};
use crate::coordinator::{Coordinator, now_ts};
use crate::error::DispatchError;

type BufferKey = (i64, NotificationKind);

/// Routes inbound requests into per-(tenant, channel) buffers, or straight
/// to the coordinator when buffering does not apply.
///
/// One drain task exists per active buffer, created together with the
/// buffer. Anything that cannot be buffered — scheduled requests, disabled
/// batching, a full buffer, a config that cannot be read — takes the
/// immediate path instead; requests are never dropped.
pub struct BatchingDispatcher {
    coordinator: Arc<Coordinator>,
    config_store: DynPartnerConfigStore,
    buffers: RwLock<HashMap<BufferKey, Buffer<NotificationRequest>>>,
    drain_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Receiver<bool>,
}

impl BatchingDispatcher {
    pub fn new(
        coordinator: Arc<Coordinator>,
        config_store: DynPartnerConfigStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coordinator,
            config_store,
            buffers: RwLock::new(HashMap::new()),
            drain_tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Ingress entry point: buffer or deliver a request.
    pub async fn process(&self, request: NotificationRequest) -> Result<(), DispatchError> {
        // scheduled requests only need persisting; the scheduler owns them
        if request.is_scheduled_after(now_ts()) {
            return self.coordinator.process(request).await;
        }

        let config = match self.config_store.get_by_tenant(request.tenant_id).await {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    tenant_id = request.tenant_id,
                    error = %err,
                    "Partner config unavailable, processing immediately"
                );
                return self.coordinator.process(request).await;
            }
        };

        if !config.batch_config.enabled {
            return self.coordinator.process(request).await;
        }

        let buffer = self.buffer_for(request.tenant_id, request.kind, &config.batch_config);
        match buffer.push(request) {
            Ok(()) => Ok(()),
            Err(request) => {
                warn!(
                    tenant_id = request.tenant_id,
                    kind = %request.kind,
                    "Buffer full, processing immediately"
                );
                self.coordinator.process(request).await
            }
        }
    }

    /// Returns the buffer for `(tenant, kind)`, creating it and its drain
    /// task on first use. Construction is single-flighted under the table's
    /// write lock.
    fn buffer_for(
        &self,
        tenant_id: i64,
        kind: NotificationKind,
        batch: &BatchConfig,
    ) -> Buffer<NotificationRequest> {
        let key = (tenant_id, kind);
        if let Some(buffer) = self.buffers.read().expect("buffer table lock poisoned").get(&key) {
            return buffer.clone();
        }

        let mut buffers = self.buffers.write().expect("buffer table lock poisoned");
        if let Some(buffer) = buffers.get(&key) {
            return buffer.clone();
        }

        let (buffer, ready) = Buffer::new(
            batch.max_batch_size,
            Duration::from_secs(batch.flush_interval_seconds),
        );
        info!(
            tenant_id,
            kind = %kind,
            max_size = batch.max_batch_size,
            flush_secs = batch.flush_interval_seconds,
            "Created batching buffer"
        );
        let handle = tokio::spawn(drain_loop(
            self.coordinator.clone(),
            buffer.clone(),
            ready,
            self.shutdown.clone(),
            tenant_id,
            kind,
        ));
        self.drain_tasks
            .lock()
            .expect("drain task list lock poisoned")
            .push(handle);
        buffers.insert(key, buffer.clone());
        buffer
    }

    /// Closes every buffer and waits for the drain loops to flush once and
    /// exit.
    pub async fn shutdown(&self) {
        let buffers: Vec<Buffer<NotificationRequest>> = self
            .buffers
            .read()
            .expect("buffer table lock poisoned")
            .values()
            .cloned()
            .collect();
        for buffer in &buffers {
            buffer.close();
        }

        let handles: Vec<JoinHandle<()>> = self
            .drain_tasks
            .lock()
            .expect("drain task list lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Drain task ended abnormally");
            }
        }
        info!("Batching dispatcher stopped");
    }
}

/// One loop per buffer: wait for the ready signal (or shutdown), drain, and
/// hand the batch to the coordinator.
async fn drain_loop(
    coordinator: Arc<Coordinator>,
    buffer: Buffer<NotificationRequest>,
    mut ready: BufferReady,
    mut shutdown: watch::Receiver<bool>,
    tenant_id: i64,
    kind: NotificationKind,
) {
    debug!(tenant_id, kind = %kind, "Drain loop started");
    loop {
        tokio::select! {
            signal = ready.recv() => {
                let drained = buffer.pop_all();
                if !drained.is_empty() {
                    debug!(tenant_id, kind = %kind, count = drained.len(), "Draining buffer");
                    coordinator.process_buffered(drained).await;
                }
                if signal.is_none() {
                    // buffer closed; that drain was the final one
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let drained = buffer.pop_all();
                    if !drained.is_empty() {
                        coordinator.process_buffered(drained).await;
                    }
                    break;
                }
            }
        }
    }
    debug!(tenant_id, kind = %kind, "Drain loop stopped");
}
