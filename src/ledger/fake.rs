//! Scriptable in-memory ledger for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{LedgerSource, LogEvent, LogSink, SubscriptionHandle, TransactionRecord};

#[derive(Default)]
pub(crate) struct FakeLedger {
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, (String, Arc<dyn LogSink>)>>,
    /// Every sink ever subscribed, oldest first, including unsubscribed ones.
    history: Mutex<Vec<(String, Arc<dyn LogSink>)>>,
    dead: Mutex<HashSet<u64>>,
    refuse: Mutex<HashSet<String>>,
    transactions: Mutex<HashMap<String, TransactionRecord>>,
    balances: Mutex<HashMap<(String, String), u64>>,
    unsubscribed: AtomicU64,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribed_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .subs
            .lock()
            .unwrap()
            .values()
            .map(|(account, _)| account.clone())
            .collect();
        accounts.sort();
        accounts
    }

    pub fn unsubscribe_count(&self) -> u64 {
        self.unsubscribed.load(Ordering::Relaxed)
    }

    pub fn sinks_for(&self, account: &str) -> Vec<Arc<dyn LogSink>> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(acct, _)| acct == account)
            .map(|(_, sink)| sink.clone())
            .collect()
    }

    pub fn refuse_subscriptions_for(&self, account: &str) {
        self.refuse.lock().unwrap().insert(account.to_string());
    }

    /// Simulate the websocket stream for `account` closing on its own.
    pub fn kill(&self, account: &str) {
        let subs = self.subs.lock().unwrap();
        let mut dead = self.dead.lock().unwrap();
        for (id, (acct, _)) in subs.iter() {
            if acct == account {
                dead.insert(*id);
            }
        }
    }

    pub fn add_transaction(&self, record: TransactionRecord) {
        self.transactions
            .lock()
            .unwrap()
            .insert(record.signature.clone(), record);
    }

    pub fn set_balance(&self, owner: &str, mint: &str, raw: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert((owner.to_string(), mint.to_string()), raw);
    }

    /// Deliver `event` to every live subscription on `account` and wait for
    /// the sinks to finish.
    pub async fn emit(&self, account: &str, event: LogEvent) {
        let sinks: Vec<Arc<dyn LogSink>> = self
            .subs
            .lock()
            .unwrap()
            .values()
            .filter(|(acct, _)| acct == account)
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink.on_log(event.clone()).await;
        }
    }
}

#[async_trait]
impl LedgerSource for FakeLedger {
    async fn subscribe_logs(
        &self,
        account: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<SubscriptionHandle> {
        if self.refuse.lock().unwrap().contains(account) {
            return Err(anyhow!("subscription refused for {account}"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.history
            .lock()
            .unwrap()
            .push((account.to_string(), sink.clone()));
        self.subs
            .lock()
            .unwrap()
            .insert(id, (account.to_string(), sink));
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.subs.lock().unwrap().remove(&handle.0);
        self.dead.lock().unwrap().remove(&handle.0);
        self.unsubscribed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_active(&self, handle: SubscriptionHandle) -> bool {
        !self.dead.lock().unwrap().contains(&handle.0)
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionRecord>> {
        Ok(self.transactions.lock().unwrap().get(signature).cloned())
    }

    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(owner.to_string(), mint.to_string()))
            .copied()
            .unwrap_or(0))
    }
}
