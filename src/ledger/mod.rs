//! Ledger event source: log subscriptions, transaction fetches, live balances.

pub mod solana;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::solana::SolanaLedger;

/// One `logsNotification` for a watched account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEvent {
    pub signature: String,
    pub logs: Vec<String>,
}

/// Opaque id for a live log subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// A token balance entry from a transaction's pre/post snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub owner: Option<String>,
    pub mint: String,
    /// Raw integer amount as reported by the node.
    pub raw_amount: String,
}

/// The subset of transaction status metadata the decoder reads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub pre_token_balances: Option<Vec<TokenBalance>>,
    pub post_token_balances: Option<Vec<TokenBalance>>,
    /// Native balances by account position; index 0 is the fee payer.
    pub pre_balances: Option<Vec<u64>>,
    pub post_balances: Option<Vec<u64>>,
    pub fee: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: String,
    pub meta: Option<TransactionMeta>,
}

/// Receives the log events of one subscription.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn on_log(&self, event: LogEvent);
}

#[async_trait]
pub trait LedgerSource: Send + Sync + 'static {
    /// Start streaming log events that mention `account` into `sink`.
    ///
    /// Each event is delivered on its own task, so a slow handler never
    /// holds back the stream.
    async fn subscribe_logs(
        &self,
        account: &str,
        sink: Arc<dyn LogSink>,
    ) -> anyhow::Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> anyhow::Result<()>;

    /// `false` once the subscription's stream has closed on its own.
    fn is_active(&self, _handle: SubscriptionHandle) -> bool {
        true
    }

    async fn get_transaction(&self, signature: &str) -> anyhow::Result<Option<TransactionRecord>>;

    /// Current raw balance of `mint` held by `owner`; 0 when no token account exists.
    async fn token_balance(&self, owner: &str, mint: &str) -> anyhow::Result<u64>;
}
