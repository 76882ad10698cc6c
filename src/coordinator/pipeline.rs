//! Per-event work for a watched account: classify, decode, persist, publish.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};

use crate::{
    decode::{self, DecodeError},
    fanout::{BroadcastPayload, FanoutPublisher},
    ledger::{LedgerSource, LogEvent},
    tokens::{enrich_record, TokenEnrichment, TrackedTokens},
};

#[derive(Clone, Debug, PartialEq)]
pub enum EventOutcome {
    /// Logs carry no known swap signature.
    NotASwap,
    /// Looked like a swap but could not be decoded; nothing was written.
    Undecodable(DecodeError),
    /// The account's token map is gone: its session ended.
    AccountUntracked,
    Updated { mint: String, raw_balance: u64 },
    Removed { mint: String },
}

pub struct EventPipeline {
    ledger: Arc<dyn LedgerSource>,
    tokens: Arc<TrackedTokens>,
    enrichment: Arc<dyn TokenEnrichment>,
    publisher: FanoutPublisher,
    /// Raw balances below this are dust and get dropped from the map.
    dust_threshold: u64,
    default_decimals: u8,
}

impl EventPipeline {
    pub fn new(
        ledger: Arc<dyn LedgerSource>,
        tokens: Arc<TrackedTokens>,
        enrichment: Arc<dyn TokenEnrichment>,
        publisher: FanoutPublisher,
        dust_threshold: u64,
        default_decimals: u8,
    ) -> Self {
        Self {
            ledger,
            tokens,
            enrichment,
            publisher,
            dust_threshold,
            default_decimals,
        }
    }

    pub async fn handle(&self, account: &str, event: &LogEvent) -> Result<EventOutcome> {
        let Some(kind) = decode::classify(event.logs.as_slice()) else {
            return Ok(EventOutcome::NotASwap);
        };
        debug!("[PIPELINE] {} looks like {:?} for {}", event.signature, kind, account);

        let _guard = self.tokens.lock(account).await;

        let decoded =
            match decode::decode_transaction(self.ledger.as_ref(), &event.signature, account).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("⚠️ [PIPELINE] Could not decode {}: {}", event.signature, e);
                    return Ok(EventOutcome::Undecodable(e));
                }
            };

        if self.tokens.get(account).await?.is_none() {
            info!("[PIPELINE] {} is no longer tracked", account);
            return Ok(EventOutcome::AccountUntracked);
        }

        let mint = decoded.other_mint;
        if decoded.token_balance >= self.dust_threshold {
            let record = enrich_record(
                self.enrichment.as_ref(),
                &mint,
                decoded.token_balance,
                self.default_decimals,
            )
            .await;
            self.tokens.update(account, &mint, record.clone()).await?;
            self.publisher
                .publish(account, BroadcastPayload::Token(record))
                .await?;
            info!(
                "✅ [PIPELINE] {} {:?} {} → balance {}",
                account, decoded.side, mint, decoded.token_balance
            );
            Ok(EventOutcome::Updated {
                mint,
                raw_balance: decoded.token_balance,
            })
        } else {
            self.tokens.remove(account, &mint).await?;
            self.publisher
                .publish(account, BroadcastPayload::removed(&mint))
                .await?;
            info!("🗑️ [PIPELINE] {} no longer holds {}", account, mint);
            Ok(EventOutcome::Removed { mint })
        }
    }
}
