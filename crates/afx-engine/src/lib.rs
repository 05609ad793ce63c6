//! AutoForwardX forwarding engine.
//!
//! This crate wires the core components together:
//! - SessionSupervisor: session lifecycle, health probes, reconnect
//! - IngressRouter + FilterPipeline: update resolution and content filters
//! - DeliveryQueue: workers claiming due items and dispatching sends
//! - AntiBanController: per-session budgets, throttle levels, emergency stop
//!
//! [`ForwardingEngine`] owns the background tasks and the shutdown order:
//! stop claiming, await in-flight sends with a budget, release claimed
//! items, close clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use afx_client::{ClientPool, PlatformClient};
use afx_store::Store;

pub mod antiban;
pub mod delivery;
pub mod filter;
pub mod router;
pub mod supervisor;

pub use antiban::{AntiBanConfig, AntiBanController, SendGate};
pub use delivery::{DeliveryConfig, DeliveryQueue};
pub use filter::{DropReason, FilterPipeline, FilterVerdict, TransformConfig};
pub use router::{IngressRouter, RouteSummary, RouterOptions};
pub use supervisor::{SessionSignal, SessionSupervisor, SupervisorConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] afx_store::StoreError),

    #[error("client error: {0}")]
    Client(#[from] afx_client::ClientError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub delivery: DeliveryConfig,
    pub supervisor: SupervisorConfig,
    pub antiban: AntiBanConfig,
    pub router: RouterOptions,
    pub transforms: TransformConfig,
    pub ingress_buffer: usize,
    /// Activity log entries older than this are removed by the cleanup
    /// task.
    pub activity_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            supervisor: SupervisorConfig::default(),
            antiban: AntiBanConfig::default(),
            router: RouterOptions::default(),
            transforms: TransformConfig::default(),
            ingress_buffer: 256,
            activity_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Top-level engine: owns all components and their background tasks.
pub struct ForwardingEngine {
    pub store: Arc<dyn Store>,
    pub pool: Arc<ClientPool>,
    pub antiban: Arc<AntiBanController>,
    pub router: Arc<IngressRouter>,
    pub supervisor: Arc<SessionSupervisor>,
    pub delivery: Arc<DeliveryQueue>,
    activity_retention: Duration,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ForwardingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn PlatformClient>,
        config: EngineConfig,
    ) -> Self {
        let pool = Arc::new(ClientPool::new(
            client,
            store.clone(),
            config.ingress_buffer,
        ));
        let antiban = Arc::new(AntiBanController::new(config.antiban, store.clone()));
        let filters = FilterPipeline::new(store.clone()).with_transforms(config.transforms);
        let router = Arc::new(IngressRouter::new(store.clone(), filters, config.router));
        let supervisor = Arc::new(SessionSupervisor::new(
            store.clone(),
            pool.clone(),
            antiban.clone(),
            router.clone(),
            config.supervisor,
        ));
        let delivery = Arc::new(DeliveryQueue::new(
            store.clone(),
            pool.clone(),
            antiban.clone(),
            router.clone(),
            config.delivery,
            supervisor.signal_sender(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            pool,
            antiban,
            router,
            supervisor,
            delivery,
            activity_retention: config.activity_retention,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Recover state, open sessions, and start all background tasks.
    pub async fn start(&self) -> Result<()> {
        // Items claimed by a previous run would otherwise be stuck in
        // processing forever.
        self.store.release_all_processing().await?;

        self.supervisor.bootstrap().await?;

        let mut tasks = self.tasks.lock();
        tasks.push(self.supervisor.start(self.shutdown_tx.subscribe()));
        self.delivery.start();

        // Window-reset ticker for rate counters.
        {
            let antiban = self.antiban.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = tick.tick() => antiban.tick(),
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Hourly cleanup of old activity entries.
        {
            let store = self.store.clone();
            let retention = self.activity_retention;
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(3600));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let cutoff = chrono::Utc::now()
                                - chrono::Duration::from_std(retention)
                                    .unwrap_or_else(|_| chrono::Duration::days(30));
                            match store.cleanup_activity(cutoff).await {
                                Ok(removed) if removed > 0 => {
                                    info!(removed, "Cleaned up old activity entries")
                                }
                                Ok(_) => {}
                                Err(e) => warn!(error = %e, "Activity cleanup failed"),
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        info!("Forwarding engine started");
        Ok(())
    }

    /// Drain in order: stop claiming, await in-flight sends (30 s),
    /// release claimed items, close platform clients.
    pub async fn shutdown(&self) {
        info!("Forwarding engine shutting down");
        let _ = self.shutdown_tx.send(());

        self.supervisor.stop();
        self.delivery.drain(Duration::from_secs(30)).await;
        self.pool.close_all().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Forwarding engine stopped");
    }
}
