//! Solana JSON-RPC / PubSub implementation of [`LedgerSource`].

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::json;
use solana_account_decoder::UiAccountData;
use solana_client::{
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter},
    rpc_request::{RpcRequest, TokenAccountsFilter},
};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use solana_transaction_status::{
    option_serializer::OptionSerializer, EncodedConfirmedTransactionWithStatusMeta,
    UiTransactionStatusMeta, UiTransactionTokenBalance,
};
use tokio::sync::oneshot;

use super::{
    LedgerSource, LogEvent, LogSink, SubscriptionHandle, TokenBalance, TransactionMeta,
    TransactionRecord,
};

pub struct SolanaLedger {
    rpc: Arc<RpcClient>,
    pubsub: Arc<PubsubClient>,
    commitment: CommitmentConfig,
    next_id: AtomicU64,
    /// Stop signal per live subscription task. A task removes its own entry
    /// when its stream ends, so presence here means "still streaming".
    active: Arc<DashMap<u64, oneshot::Sender<()>>>,
}

impl SolanaLedger {
    pub async fn connect(rpc_url: &str, wss_url: &str, commitment: &str) -> Result<Self> {
        let commitment = CommitmentConfig::from_str(commitment)
            .map_err(|e| anyhow!("invalid commitment `{commitment}`: {e}"))?;
        let rpc = Arc::new(RpcClient::new_with_commitment(rpc_url.to_string(), commitment));
        rpc.get_version()
            .await
            .with_context(|| format!("reaching RPC endpoint {rpc_url}"))?;
        let pubsub = PubsubClient::new(wss_url)
            .await
            .with_context(|| format!("connecting to websocket endpoint {wss_url}"))?;
        info!("🔌 [LEDGER] Connected to {} / {}", rpc_url, wss_url);

        Ok(Self {
            rpc,
            pubsub: Arc::new(pubsub),
            commitment,
            next_id: AtomicU64::new(1),
            active: Arc::new(DashMap::new()),
        })
    }
}

#[async_trait]
impl LedgerSource for SolanaLedger {
    async fn subscribe_logs(
        &self,
        account: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<SubscriptionHandle> {
        Pubkey::from_str(account).with_context(|| format!("invalid account `{account}`"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        self.active.insert(id, stop_tx);

        let pubsub = Arc::clone(&self.pubsub);
        let active = Arc::clone(&self.active);
        let config = RpcTransactionLogsConfig {
            commitment: Some(self.commitment),
        };
        let account = account.to_string();

        tokio::spawn(async move {
            let subscribed = pubsub
                .logs_subscribe(RpcTransactionLogsFilter::Mentions(vec![account.clone()]), config)
                .await;
            let (mut stream, unsubscribe) = match subscribed {
                Ok(pair) => {
                    let _ = ready_tx.send(Ok(()));
                    pair
                }
                Err(e) => {
                    active.remove(&id);
                    let _ = ready_tx.send(Err(anyhow!(e)));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    next = stream.next() => match next {
                        Some(response) => {
                            let event = LogEvent {
                                signature: response.value.signature,
                                logs: response.value.logs,
                            };
                            let sink = Arc::clone(&sink);
                            tokio::spawn(async move { sink.on_log(event).await });
                        }
                        None => {
                            error!("❌ [LEDGER] Log stream for {} ended unexpectedly", account);
                            break;
                        }
                    }
                }
            }

            active.remove(&id);
            drop(stream);
            unsubscribe().await;
            debug!("[LEDGER] Subscription task for {} finished", account);
        });

        ready_rx
            .await
            .map_err(|_| anyhow!("subscription task exited before confirming"))??;
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        match self.active.remove(&handle.0) {
            Some((_, stop)) => {
                // The task may already be gone if its stream closed.
                let _ = stop.send(());
            }
            None => warn!("⚠️ [LEDGER] Unsubscribe for unknown handle {}", handle.0),
        }
        Ok(())
    }

    fn is_active(&self, handle: SubscriptionHandle) -> bool {
        self.active.contains_key(&handle.0)
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionRecord>> {
        // `send` instead of `get_transaction_with_config` so a `null`
        // result maps to `None` rather than a deserialisation error.
        let params = json!([
            signature,
            {
                "encoding": "json",
                "commitment": self.commitment.commitment.to_string(),
                "maxSupportedTransactionVersion": 0
            }
        ]);
        let tx: Option<EncodedConfirmedTransactionWithStatusMeta> = self
            .rpc
            .send(RpcRequest::GetTransaction, params)
            .await
            .with_context(|| format!("getTransaction {signature}"))?;

        Ok(tx.map(|tx| TransactionRecord {
            signature: signature.to_string(),
            meta: tx.transaction.meta.map(convert_meta),
        }))
    }

    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64> {
        let owner_key = Pubkey::from_str(owner).with_context(|| format!("invalid owner `{owner}`"))?;
        let mint_key = Pubkey::from_str(mint).with_context(|| format!("invalid mint `{mint}`"))?;

        let accounts = self
            .rpc
            .get_token_accounts_by_owner(&owner_key, TokenAccountsFilter::Mint(mint_key))
            .await
            .with_context(|| format!("getTokenAccountsByOwner {owner} / {mint}"))?;

        let Some(first) = accounts.first() else {
            return Ok(0);
        };
        let UiAccountData::Json(parsed) = &first.account.data else {
            return Err(anyhow!("token account {} was not returned jsonParsed", first.pubkey));
        };
        let amount = parsed.parsed["info"]["tokenAmount"]["amount"]
            .as_str()
            .ok_or_else(|| anyhow!("token account {} has no tokenAmount", first.pubkey))?;
        let amount = amount.parse::<u64>()?;
        debug!("[LEDGER] Live balance {} of {} for {}", amount, mint, owner);
        Ok(amount)
    }
}

/* --------------------------------------------------------------------- */
/*  RPC meta → crate types                                               */
/* --------------------------------------------------------------------- */

fn convert_meta(meta: UiTransactionStatusMeta) -> TransactionMeta {
    TransactionMeta {
        pre_token_balances: convert_token_balances(meta.pre_token_balances),
        post_token_balances: convert_token_balances(meta.post_token_balances),
        pre_balances: Some(meta.pre_balances),
        post_balances: Some(meta.post_balances),
        fee: meta.fee,
    }
}

fn convert_token_balances(
    balances: OptionSerializer<Vec<UiTransactionTokenBalance>>,
) -> Option<Vec<TokenBalance>> {
    match balances {
        OptionSerializer::Some(list) => Some(
            list.into_iter()
                .map(|b| TokenBalance {
                    owner: match b.owner {
                        OptionSerializer::Some(owner) => Some(owner),
                        _ => None,
                    },
                    mint: b.mint,
                    raw_amount: b.ui_token_amount.amount,
                })
                .collect(),
        ),
        _ => None,
    }
}
