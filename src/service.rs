//! Wiring: connect the shared store and the ledger, then run the coordinator,
//! the fanout relay and the SOL price refresher in the background.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

use crate::{
    config::Settings,
    coordinator::{Coordinator, EventPipeline, LeaseManager},
    fanout::{ConnectionRegistry, FanoutPublisher, FanoutRelay},
    ledger::SolanaLedger,
    store::{CoordinationStore, RedisStore},
    tokens::{enrich::spawn_native_price_refresher, HttpEnrichment, TokenEnrichment, TrackedTokens},
};

/// Everything a transport layer needs from a running tracker.
pub struct TrackerHandle {
    pub coordinator: Arc<Coordinator>,
    pub tokens: Arc<TrackedTokens>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn CoordinationStore>,
    stop: oneshot::Sender<()>,
    coordinator_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn instance_id(&self) -> &str {
        self.coordinator.instance_id()
    }

    /// Stop reconciling and give back every lease this instance holds.
    pub async fn shutdown(self) -> Result<()> {
        info!("🛑 [SERVICE] Shutting down {}", self.coordinator.instance_id());
        if self.stop.send(()).is_err() {
            warn!("⚠️ [SERVICE] Coordinator loop already gone, releasing directly");
            self.coordinator.release_all().await;
        }
        for task in &self.background {
            task.abort();
        }
        self.coordinator_task
            .await
            .context("coordinator task panicked")?;
        Ok(())
    }
}

pub async fn start(settings: Settings) -> Result<TrackerHandle> {
    settings.validate()?;
    let instance_id = Uuid::new_v4().to_string();
    info!("🚀 [SERVICE] Starting instance {}", instance_id);

    let store: Arc<dyn CoordinationStore> = Arc::new(
        RedisStore::connect(&settings.redis_url)
            .await
            .context("connecting to redis")?,
    );
    let ledger = Arc::new(
        SolanaLedger::connect(&settings.rpc_url, &settings.wss_url, &settings.commitment)
            .await
            .context("connecting to ledger")?,
    );
    let enrichment: Arc<dyn TokenEnrichment> =
        Arc::new(HttpEnrichment::new(
        &settings.das_url,
        &settings.birdeye_api_key,
        settings.default_decimals,
    )?);

    let keys = settings.keys.clone();
    let tokens = Arc::new(TrackedTokens::new(
        store.clone(),
        keys.clone(),
        settings.tracked_tokens_ttl(),
    ));
    let pipeline = EventPipeline::new(
        ledger.clone(),
        tokens.clone(),
        enrichment.clone(),
        FanoutPublisher::new(store.clone(), &keys.fanout_channel),
        settings.dust_threshold,
        settings.default_decimals,
    );
    let leases = LeaseManager::new(store.clone(), keys.clone(), instance_id, settings.lease_ttl());
    let coordinator = Coordinator::new(
        store.clone(),
        ledger,
        leases,
        tokens.clone(),
        pipeline,
        &keys.desired_set,
        settings.reconcile_interval(),
    );

    if let Err(e) = coordinator.tick().await {
        error!("❌ [SERVICE] Initial reconciliation failed: {:#}", e);
    }
    let (stop, stop_rx) = oneshot::channel();
    let coordinator_task = tokio::spawn(coordinator.clone().run(stop_rx));

    let registry = Arc::new(ConnectionRegistry::new());
    let relay = Arc::new(FanoutRelay::new(registry.clone(), &keys.fanout_channel));
    let relay_task = relay.spawn(store.clone()).await?;
    let price_task = spawn_native_price_refresher(
        store.clone(),
        enrichment,
        keys.native_price.clone(),
        settings.native_price_ttl(),
    );

    Ok(TrackerHandle {
        coordinator,
        tokens,
        registry,
        store,
        stop,
        coordinator_task,
        background: vec![relay_task, price_task],
    })
}
