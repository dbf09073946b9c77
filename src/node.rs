use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::broker::{Broker, BrokerHandle};
use crate::bus::MessageBus;
use crate::collab::{
    DocumentStore, HttpDocumentStore, HttpObjectStore, MemoryDocumentStore, MemoryObjectStore,
    ObjectStore,
};
use crate::config::FarmConfig;
use crate::error::Result;
use crate::gateway;
use crate::registry::JobRegistry;
use crate::supervisor::JobContext;

/// How long shutdown waits for live jobs to release their workers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One scheduler process: bus, broker, registry and the HTTP surfaces.
pub struct Node {
    pub config: FarmConfig,
    pub bus: MessageBus,
    pub broker: BrokerHandle,
    pub registry: JobRegistry,
    broker_actor: Broker,
    shutdown: CancellationToken,
}

impl Node {
    pub async fn new(
        config: FarmConfig,
        objects: Arc<dyn ObjectStore>,
        documents: Arc<dyn DocumentStore>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let bus = MessageBus::with_farm_topics().await?;
        let (broker_actor, broker) = Broker::new(bus.clone()).await?;

        let ctx = JobContext {
            bus: bus.clone(),
            objects,
            documents,
            scheduling: config.scheduling.clone(),
            storage: config.storage.clone(),
        };
        let registry = JobRegistry::new(ctx, shutdown.clone());

        Ok(Self {
            config,
            bus,
            broker,
            registry,
            broker_actor,
            shutdown,
        })
    }

    /// Build the collaborators from `config`: HTTP clients where a service
    /// URL is set, in-memory stores otherwise.
    pub async fn from_config(config: FarmConfig, shutdown: CancellationToken) -> Result<Self> {
        let timeout = config.storage.request_timeout();
        let objects: Arc<dyn ObjectStore> = match &config.storage.blob_service_url {
            Some(url) => Arc::new(HttpObjectStore::new(url.clone(), timeout)?),
            None => {
                tracing::warn!("No blob service configured, using in-memory object store");
                Arc::new(MemoryObjectStore::new())
            }
        };
        let documents: Arc<dyn DocumentStore> = match &config.storage.document_service_url {
            Some(url) => Arc::new(HttpDocumentStore::new(url.clone(), timeout)?),
            None => {
                tracing::warn!(
                    scenes = config.storage.scenes.len(),
                    "No document service configured, using in-memory document store"
                );
                let store = MemoryDocumentStore::new();
                for scene in &config.storage.scenes {
                    store
                        .add_scene(
                            &scene.customer_id,
                            &scene.object_id,
                            &scene.scene_locator,
                            scene.first_frame,
                            scene.last_frame,
                        )
                        .await;
                }
                Arc::new(store)
            }
        };
        Self::new(config, objects, documents, shutdown).await
    }

    /// Control API and worker gateway on one router.
    pub fn router(&self) -> Router {
        api::router(ApiState {
            registry: self.registry.clone(),
            broker: self.broker.clone(),
        })
        .merge(gateway::router(self.bus.clone()))
    }

    /// Run until the shutdown token fires, then drain.
    ///
    /// 1. Spawns the broker loop
    /// 2. Serves the control API and worker gateway (blocks)
    /// 3. Stops every live job and waits for them to release their workers
    /// 4. Closes the bus
    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let app = self.router();

        let broker_shutdown = self.shutdown.clone();
        let broker_task = tokio::spawn(self.broker_actor.run(broker_shutdown));

        api::serve(self.config.listen_addr, app, self.shutdown.clone()).await;

        tracing::info!("Draining live jobs");
        self.registry.shutdown().await;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while self.registry.live_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                live = self.registry.live_count().await,
                "Jobs still live after drain timeout"
            );
        }

        self.bus.close().await;
        if let Err(e) = broker_task.await {
            tracing::error!(error = %e, "Broker task failed");
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}
