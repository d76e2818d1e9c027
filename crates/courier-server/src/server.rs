use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use courier_bus::{DynPublisher, InMemoryBus};
use courier_core::NotificationKind;
use courier_db_memory::{InMemoryConfigStore, InMemoryNotificationStore};
use courier_db_postgres::{PostgresConfig, PostgresConfigStore, PostgresNotificationStore};
use courier_dispatch::{BatchingDispatcher, ConsumerWorker, Coordinator, SchedulerWorker};
use courier_providers::{ProviderManager, ProviderRegistry};
use courier_storage::{DynNotificationStore, DynPartnerConfigStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{AppConfig, StorageBackend};
use crate::handlers;

/// Shared handles behind the HTTP façade.
#[derive(Clone)]
pub struct AppState {
    pub store: DynNotificationStore,
    pub config_store: DynPartnerConfigStore,
    pub publisher: DynPublisher,
    pub email_manager: Arc<ProviderManager>,
    pub sms_manager: Arc<ProviderManager>,
    pub push_manager: Arc<ProviderManager>,
    pub topic: String,
    pub batch_chunk_size: usize,
}

impl AppState {
    /// Drops every channel's cached provider for a tenant; used after a
    /// full config replace.
    pub fn invalidate_providers(&self, tenant_id: i64) {
        self.email_manager.invalidate(tenant_id);
        self.sms_manager.invalidate(tenant_id);
        self.push_manager.invalidate(tenant_id);
    }

    pub fn invalidate_provider(&self, tenant_id: i64, kind: NotificationKind) {
        match kind {
            NotificationKind::Email => self.email_manager.invalidate(tenant_id),
            NotificationKind::Sms => self.sms_manager.invalidate(tenant_id),
            NotificationKind::Push => self.push_manager.invalidate(tenant_id),
        }
    }
}

/// Builds the REST router over the shared state.
pub fn build_app(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/notifications/send", post(handlers::send_notification))
        .route(
            "/notifications/batch",
            post(handlers::send_batch_notification),
        )
        .route(
            "/notifications/status/{request_id}",
            get(handlers::get_notification_status),
        )
        .route(
            "/notifications/batch/{batch_id}/status",
            get(handlers::get_batch_status),
        )
        .route(
            "/notifications/cancel/{request_id}",
            post(handlers::cancel_notification),
        )
        .route(
            "/config/{tenant_id}",
            get(handlers::get_config).put(handlers::update_config),
        )
        .route(
            "/config/{tenant_id}/providers/{channel}",
            post(handlers::add_provider),
        )
        .route(
            "/config/{tenant_id}/providers/{channel}/{name}",
            delete(handlers::remove_provider),
        )
        .route("/health", get(handlers::health))
        .route("/live", get(handlers::live))
        .route("/ready", get(handlers::ready))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

async fn build_stores(
    config: &AppConfig,
) -> anyhow::Result<(DynNotificationStore, DynPartnerConfigStore)> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; records will not survive a restart");
            Ok((
                Arc::new(InMemoryNotificationStore::new()),
                Arc::new(InMemoryConfigStore::new()),
            ))
        }
        StorageBackend::Postgres => {
            let settings = config
                .storage
                .postgres
                .as_ref()
                .context("postgres settings missing")?;
            let pool = PostgresConfig::new(&settings.url)
                .with_pool_size(settings.pool_size)
                .with_connect_timeout(std::time::Duration::from_millis(
                    settings.connect_timeout_ms,
                ))
                .connect()
                .await
                .context("failed to connect to postgres")?;
            info!("Connected to PostgreSQL");
            Ok((
                Arc::new(PostgresNotificationStore::new(pool.clone())),
                Arc::new(PostgresConfigStore::new(pool)),
            ))
        }
    }
}

/// The assembled courier process: REST façade, bus consumers, batching
/// dispatcher, and scheduler over one shared pipeline.
pub struct CourierServer {
    config: AppConfig,
}

impl CourierServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let (store, config_store) = build_stores(&self.config).await?;

        let registry = Arc::new(ProviderRegistry::with_builtins());
        let email_manager = Arc::new(ProviderManager::new(
            NotificationKind::Email,
            registry.clone(),
            config_store.clone(),
        ));
        let sms_manager = Arc::new(ProviderManager::new(
            NotificationKind::Sms,
            registry.clone(),
            config_store.clone(),
        ));
        let push_manager = Arc::new(ProviderManager::new(
            NotificationKind::Push,
            registry,
            config_store.clone(),
        ));

        let settings = self.config.dispatch.settings();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Coordinator::new(
            store.clone(),
            config_store.clone(),
            email_manager.clone(),
            sms_manager.clone(),
            push_manager.clone(),
            settings.clone(),
        );
        let dispatcher = Arc::new(BatchingDispatcher::new(
            coordinator.clone(),
            config_store.clone(),
            shutdown_rx.clone(),
        ));

        let bus = Arc::new(InMemoryBus::new());

        let mut consumer_handles = Vec::with_capacity(self.config.bus.consumers);
        for worker_id in 0..self.config.bus.consumers {
            let worker = ConsumerWorker::new(
                bus.clone(),
                dispatcher.clone(),
                self.config.bus.topic.clone(),
                self.config.bus.consumer_group.clone(),
                shutdown_rx.clone(),
            );
            consumer_handles.push(tokio::spawn(async move {
                if let Err(err) = worker.run().await {
                    error!(worker_id, error = %err, "Consumer worker failed");
                }
            }));
        }

        let scheduler = SchedulerWorker::new(
            store.clone(),
            coordinator.clone(),
            settings.scheduler_tick,
            shutdown_rx,
        );
        let scheduler_handle = tokio::spawn(scheduler.run());

        let state = AppState {
            store,
            config_store,
            publisher: bus.clone(),
            email_manager,
            sms_manager,
            push_manager,
            topic: self.config.bus.topic.clone(),
            batch_chunk_size: self.config.dispatch.batch_chunk_size,
        };
        let app = build_app(state, self.config.server.body_limit_bytes);

        let addr = self.config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "Courier listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        // Ordered shutdown: consumers stop accepting, drain loops flush
        // once, the scheduler stops, then the store handle drops.
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
        bus.close();

        let drain = async {
            for handle in consumer_handles {
                let _ = handle.await;
            }
            dispatcher.shutdown().await;
            let _ = scheduler_handle.await;
        };
        if tokio::time::timeout(settings.shutdown_deadline, drain)
            .await
            .is_err()
        {
            warn!(
                deadline_secs = settings.shutdown_deadline.as_secs(),
                "Shutdown deadline exceeded, abandoning remaining tasks"
            );
        }

        info!("Courier stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
