//! Tracked-token store.
//!
//! One JSON document per account (`tokens:<account>`) mapping mint → record.
//! The transport layer reads the same document to render a portfolio, so the
//! document shape is part of the external contract.

pub mod enrich;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{config::KeySpace, store::CoordinationStore};

pub use enrich::{enrich_record, HttpEnrichment, TokenEnrichment, TokenLogo};

/// Fallback logo when enrichment has nothing.
pub const DEFAULT_IMG: &str = "https://raw.githubusercontent.com/solana-labs/token-list/main/assets/mainnet/So11111111111111111111111111111111111111112/logo.png";
pub const DEFAULT_SYMBOL: &str = "No ticker";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub mint: String,
    /// Display units (raw / 10^decimals).
    pub balance: f64,
    /// `NaN` when no price could be found; stored as `null`.
    #[serde(with = "nan_as_null")]
    pub usd_value: f64,
    pub logo_uri: String,
    pub symbol: String,
    #[serde(default)]
    pub removed: bool,
}

pub type TrackedTokenMap = BTreeMap<String, TokenRecord>;

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/* --------------------------------------------------------------------- */
/*  Store                                                                */
/* --------------------------------------------------------------------- */

/// Read-modify-write access to the per-account documents.
///
/// Writes replace the whole document. Callers that may race on the same
/// account within this process should hold [`TrackedTokens::lock`].
pub struct TrackedTokens {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    ttl: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TrackedTokens {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self {
            store,
            keys,
            ttl,
            locks: DashMap::new(),
        }
    }

    /// `None` means the account is not tracked (never started or logged out).
    pub async fn get(&self, account: &str) -> Result<Option<TrackedTokenMap>> {
        let key = self.keys.tokens_key(account);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let map = serde_json::from_str(&raw).with_context(|| format!("decoding {key}"))?;
        Ok(Some(map))
    }

    pub async fn update(&self, account: &str, mint: &str, record: TokenRecord) -> Result<()> {
        let mut tokens = self.get(account).await?.unwrap_or_default();
        tokens.insert(mint.to_string(), record);
        self.persist(account, &tokens).await
    }

    /// Removing a mint that is not there is a no-op.
    pub async fn remove(&self, account: &str, mint: &str) -> Result<()> {
        let Some(mut tokens) = self.get(account).await? else {
            return Ok(());
        };
        if tokens.remove(mint).is_none() {
            debug!("[TOKENS] {} not tracked for {}, nothing to remove", mint, account);
            return Ok(());
        }
        self.persist(account, &tokens).await
    }

    /// Session start: empty document plus DesiredSet membership.
    pub async fn track(&self, account: &str) -> Result<()> {
        self.persist(account, &TrackedTokenMap::new()).await?;
        self.store.set_add(&self.keys.desired_set, account).await
    }

    /// Session end: leave DesiredSet and drop the document.
    pub async fn untrack(&self, account: &str) -> Result<()> {
        self.store.set_remove(&self.keys.desired_set, account).await?;
        self.store.del(&self.keys.tokens_key(account)).await
    }

    /// Per-account mutex serialising this process's read-modify-write cycles.
    pub async fn lock(&self, account: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the account's mutex once nothing in this process works on it.
    pub fn forget(&self, account: &str) {
        self.locks
            .remove_if(account, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn persist(&self, account: &str, tokens: &TrackedTokenMap) -> Result<()> {
        let raw = serde_json::to_string(tokens)?;
        self.store
            .set(&self.keys.tokens_key(account), &raw, Some(self.ttl))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const ACCOUNT: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const MINT: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

    fn tokens() -> (Arc<MemoryStore>, TrackedTokens) {
        let store = Arc::new(MemoryStore::new());
        let tracked = TrackedTokens::new(
            store.clone(),
            KeySpace::default(),
            Duration::from_secs(86_400),
        );
        (store, tracked)
    }

    fn record(mint: &str, balance: f64) -> TokenRecord {
        TokenRecord {
            mint: mint.to_string(),
            balance,
            usd_value: 12.5,
            logo_uri: "https://logo".to_string(),
            symbol: "BONK".to_string(),
            removed: false,
        }
    }

    #[tokio::test]
    async fn update_then_get_returns_the_record() {
        let (_, tracked) = tokens();
        tracked.update(ACCOUNT, MINT, record(MINT, 42.0)).await.unwrap();

        let map = tracked.get(ACCOUNT).await.unwrap().unwrap();
        assert_eq!(map.len(), 1);
        let stored = &map[MINT];
        assert_eq!(stored.balance, 42.0);
        assert_eq!(stored.symbol, "BONK");
    }

    #[tokio::test]
    async fn remove_then_get_drops_the_key() {
        let (_, tracked) = tokens();
        tracked.update(ACCOUNT, MINT, record(MINT, 1.0)).await.unwrap();
        tracked.update(ACCOUNT, "other", record("other", 2.0)).await.unwrap();

        tracked.remove(ACCOUNT, MINT).await.unwrap();
        let map = tracked.get(ACCOUNT).await.unwrap().unwrap();
        assert!(!map.contains_key(MINT));
        assert!(map.contains_key("other"));
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let (_, tracked) = tokens();
        tracked.track(ACCOUNT).await.unwrap();
        tracked.remove(ACCOUNT, MINT).await.unwrap();
        tracked.remove(ACCOUNT, MINT).await.unwrap();
        assert!(tracked.get(ACCOUNT).await.unwrap().unwrap().is_empty());

        // Untracked account: still no error, and nothing gets created.
        tracked.remove("nobody", MINT).await.unwrap();
        assert!(tracked.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn track_and_untrack_manage_desired_set() {
        let (store, tracked) = tokens();
        tracked.track(ACCOUNT).await.unwrap();
        assert_eq!(store.set_members("active_wallets").await.unwrap(), vec![ACCOUNT]);
        assert!(tracked.get(ACCOUNT).await.unwrap().is_some());

        tracked.untrack(ACCOUNT).await.unwrap();
        assert!(store.set_members("active_wallets").await.unwrap().is_empty());
        assert!(tracked.get(ACCOUNT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_usd_value_round_trips_as_null() {
        let (store, tracked) = tokens();
        let mut unpriced = record(MINT, 3.0);
        unpriced.usd_value = f64::NAN;
        tracked.update(ACCOUNT, MINT, unpriced).await.unwrap();

        let raw = store.get(&format!("tokens:{ACCOUNT}")).await.unwrap().unwrap();
        assert!(raw.contains(r#""usdValue":null"#));
        assert!(raw.contains(r#""logoUri":"https://logo""#));
        let map = tracked.get(ACCOUNT).await.unwrap().unwrap();
        assert!(map[MINT].usd_value.is_nan());
    }

    #[tokio::test]
    async fn lock_serialises_same_account() {
        let (_, tracked) = tokens();
        let guard = tracked.lock(ACCOUNT).await;
        let other = tracked.lock("someone-else").await;
        drop(other);

        let tracked = Arc::new(tracked);
        let waiter = {
            let tracked = tracked.clone();
            tokio::spawn(async move {
                let _g = tracked.lock(ACCOUNT).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();

        tracked.forget(ACCOUNT);
        assert!(tracked.locks.get(ACCOUNT).is_none());
    }
}
