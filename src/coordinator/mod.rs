//! Reconciliation coordinator.
//!
//! Every instance runs one. On each tick it makes the local subscription
//! table match `DesiredSet ∩ leases held by this instance`:
//!
//! * desired but not local → try to take the lease, then subscribe
//! * local but no longer desired → unsubscribe and delete the lease
//! * local and desired → renew the lease if we still own it
//!
//! A lease that cannot be renewed was lost to another instance; the local
//! subscription is dropped without touching the lease.

pub mod lease;
pub mod pipeline;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::{
    sync::{oneshot, Mutex},
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    ledger::{LedgerSource, LogEvent, LogSink, SubscriptionHandle},
    store::CoordinationStore,
    tokens::TrackedTokens,
};

pub use lease::LeaseManager;
pub use pipeline::{EventOutcome, EventPipeline};

/// What one tick did; mostly for logs and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: bool,
    pub acquired: usize,
    pub released: usize,
    pub renewed: usize,
    pub lost: usize,
    pub failed: usize,
}

/// A live subscription in the local table. `generation` tells a replaced
/// subscription apart from its successor on the same account.
#[derive(Clone, Copy, Debug)]
struct LocalSubscription {
    handle: SubscriptionHandle,
    generation: u64,
}

pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    ledger: Arc<dyn LedgerSource>,
    leases: LeaseManager,
    tokens: Arc<TrackedTokens>,
    pipeline: EventPipeline,
    desired_set: String,
    interval: Duration,
    /// account → live subscription. Only this instance's view.
    subscriptions: Mutex<HashMap<String, LocalSubscription>>,
    next_generation: AtomicU64,
    tick_guard: Mutex<()>,
    me: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        ledger: Arc<dyn LedgerSource>,
        leases: LeaseManager,
        tokens: Arc<TrackedTokens>,
        pipeline: EventPipeline,
        desired_set: &str,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            ledger,
            leases,
            tokens,
            pipeline,
            desired_set: desired_set.to_string(),
            interval,
            subscriptions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            tick_guard: Mutex::new(()),
            me: me.clone(),
        })
    }

    pub fn instance_id(&self) -> &str {
        self.leases.instance_id()
    }

    pub async fn local_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /* ----------------------------------------------------------------- */
    /*  Tick                                                             */
    /* ----------------------------------------------------------------- */

    pub async fn tick(&self) -> Result<TickReport> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("[COORD] Previous tick still running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };
        let mut report = TickReport::default();

        let desired: HashSet<String> = self
            .store
            .set_members(&self.desired_set)
            .await
            .context("reading desired set")?
            .into_iter()
            .collect();

        /* -------- streams that died on their own ---------------------- */
        let dead: Vec<String> = {
            let subs = self.subscriptions.lock().await;
            subs.iter()
                .filter(|(_, sub)| !self.ledger.is_active(sub.handle))
                .map(|(account, _)| account.clone())
                .collect()
        };
        for account in dead {
            warn!("⚠️ [COORD] Subscription for {} is dead, releasing", account);
            match self.release(&account).await {
                Ok(()) => report.released += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("❌ [COORD] Releasing {}: {:#}", account, e);
                }
            }
        }

        let local: HashSet<String> = self.subscriptions.lock().await.keys().cloned().collect();

        /* -------- claim --------------------------------------------- */
        for account in desired.difference(&local) {
            match self.claim(account).await {
                Ok(true) => report.acquired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!("❌ [COORD] Claiming {}: {:#}", account, e);
                }
            }
        }

        /* -------- release ------------------------------------------- */
        for account in local.difference(&desired) {
            match self.release(account).await {
                Ok(()) => report.released += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("❌ [COORD] Releasing {}: {:#}", account, e);
                }
            }
        }

        /* -------- renew --------------------------------------------- */
        for account in local.intersection(&desired) {
            match self.leases.renew(account).await {
                Ok(true) => report.renewed += 1,
                Ok(false) => {
                    report.lost += 1;
                    warn!("⚠️ [COORD] Lost lease on {}, dropping subscription", account);
                    if let Err(e) = self.drop_subscription(account).await {
                        error!("❌ [COORD] Unsubscribing {}: {:#}", account, e);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!("❌ [COORD] Renewing {}: {:#}", account, e);
                }
            }
        }

        if report.acquired + report.released + report.lost + report.failed > 0 {
            info!("🔄 [COORD] {} tick: {:?}", self.instance_id(), report);
        }
        Ok(report)
    }

    /// Take the lease and subscribe. A failed subscribe gives the lease back.
    async fn claim(&self, account: &str) -> Result<bool> {
        if !self.leases.acquire(account).await? {
            return Ok(false);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(AccountSink {
            account: account.to_string(),
            generation,
            coordinator: self.me.clone(),
        });
        match self.ledger.subscribe_logs(account, sink).await {
            Ok(handle) => {
                self.subscriptions
                    .lock()
                    .await
                    .insert(account.to_string(), LocalSubscription { handle, generation });
                info!("👀 [COORD] Watching {}", account);
                Ok(true)
            }
            Err(e) => {
                if let Err(release_err) = self.leases.release(account).await {
                    warn!("⚠️ [COORD] Lease for {} left to expire: {:#}", account, release_err);
                }
                Err(e.context(format!("subscribing to {account}")))
            }
        }
    }

    async fn drop_subscription(&self, account: &str) -> Result<()> {
        let sub = self.subscriptions.lock().await.remove(account);
        self.unsubscribe(account, sub).await
    }

    async fn unsubscribe(&self, account: &str, sub: Option<LocalSubscription>) -> Result<()> {
        self.tokens.forget(account);
        if let Some(sub) = sub {
            self.ledger.unsubscribe(sub.handle).await?;
        }
        Ok(())
    }

    /// Stop watching `account` and delete its lease if this instance owns it.
    pub async fn release(&self, account: &str) -> Result<()> {
        let sub = self.subscriptions.lock().await.remove(account);
        self.finish_release(account, sub).await
    }

    /// Like [`Coordinator::release`], but only while `generation` is still the
    /// account's current subscription.
    async fn release_generation(&self, account: &str, generation: u64) -> Result<()> {
        let sub = {
            let mut subs = self.subscriptions.lock().await;
            match subs.get(account) {
                Some(current) if current.generation == generation => subs.remove(account),
                _ => None,
            }
        };
        if sub.is_none() {
            debug!("[COORD] Stale release for {} (generation {}) ignored", account, generation);
            return Ok(());
        }
        self.finish_release(account, sub).await
    }

    async fn finish_release(&self, account: &str, sub: Option<LocalSubscription>) -> Result<()> {
        let unsubscribed = self.unsubscribe(account, sub).await;
        let released = self.leases.release(account).await?;
        unsubscribed?;
        if released {
            info!("👋 [COORD] Released {}", account);
        }
        Ok(())
    }

    /// Shutdown teardown: every local subscription and owned lease goes.
    pub async fn release_all(&self) {
        let accounts = self.local_accounts().await;
        for account in &accounts {
            if let Err(e) = self.release(account).await {
                error!("❌ [COORD] Releasing {} on shutdown: {:#}", account, e);
            }
        }
        info!("🛑 [COORD] Released {} account(s)", accounts.len());
    }

    /// Tick every `interval` until `shutdown` fires, then release everything.
    /// The first tick comes one interval after the call.
    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("❌ [COORD] Tick failed: {:#}", e);
                    }
                }
            }
        }
        self.release_all().await;
    }

    async fn on_event(&self, account: &str, generation: u64, event: LogEvent) {
        match self.pipeline.handle(account, &event).await {
            Ok(EventOutcome::AccountUntracked) => {
                if let Err(e) = self.release_generation(account, generation).await {
                    error!("❌ [COORD] Releasing untracked {}: {:#}", account, e);
                }
            }
            Ok(outcome) => debug!("[COORD] {} {}: {:?}", account, event.signature, outcome),
            Err(e) => error!("❌ [COORD] Event {} for {}: {:#}", event.signature, account, e),
        }
    }
}

/// Routes one subscription's events back to its coordinator.
struct AccountSink {
    account: String,
    generation: u64,
    coordinator: Weak<Coordinator>,
}

#[async_trait]
impl LogSink for AccountSink {
    async fn on_log(&self, event: LogEvent) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator
                .on_event(&self.account, self.generation, event)
                .await;
        }
    }
}
