//! Best-effort token metadata and pricing.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde_json::json;
use tokio::{task::JoinHandle, time::timeout};

use super::{TokenRecord, DEFAULT_IMG, DEFAULT_SYMBOL};
use crate::{decode::NATIVE_MINT, store::CoordinationStore};

const BIRDEYE_PRICE_URL: &str = "https://public-api.birdeye.so/defi/price";
const COINGECKO_SOL_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Asset metadata. Missing image or symbol fall back to placeholders in
/// [`enrich_record`]; decimals are always the asset's own when known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenLogo {
    pub logo_uri: Option<String>,
    pub symbol: Option<String>,
    pub decimals: u8,
}

#[async_trait]
pub trait TokenEnrichment: Send + Sync + 'static {
    /// USD value of `quantity` display units of `mint`.
    async fn price_of(&self, mint: &str, quantity: f64) -> Result<f64>;

    /// `None` when the asset is unknown.
    async fn logo_of(&self, mint: &str) -> Result<Option<TokenLogo>>;

    /// SOL/USD.
    async fn native_price(&self) -> Result<f64>;
}

pub struct HttpEnrichment {
    client: Client,
    das_url: String,
    birdeye_api_key: String,
    default_decimals: u8,
}

impl HttpEnrichment {
    pub fn new(das_url: &str, birdeye_api_key: &str, default_decimals: u8) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            das_url: das_url.to_string(),
            birdeye_api_key: birdeye_api_key.to_string(),
            default_decimals,
        })
    }
}

/// Read a DAS `getAsset` response body.
fn parse_asset(body: &serde_json::Value, default_decimals: u8) -> Option<TokenLogo> {
    let result = body.get("result").filter(|r| r.is_object())?;
    let logo_uri = result["content"]["files"][0]["uri"]
        .as_str()
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let symbol = result["content"]["metadata"]["symbol"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let decimals = result["token_info"]["decimals"]
        .as_u64()
        .and_then(|d| u8::try_from(d).ok())
        .unwrap_or(default_decimals);
    Some(TokenLogo {
        logo_uri,
        symbol,
        decimals,
    })
}

#[async_trait]
impl TokenEnrichment for HttpEnrichment {
    async fn price_of(&self, mint: &str, quantity: f64) -> Result<f64> {
        if self.birdeye_api_key.is_empty() {
            return Err(anyhow!("BIRDEYE_APIKEY not set"));
        }
        let response = timeout(
            HTTP_TIMEOUT,
            self.client
                .get(BIRDEYE_PRICE_URL)
                .query(&[("address", mint)])
                .header("accept", "application/json")
                .header("x-chain", "solana")
                .header("X-API-KEY", &self.birdeye_api_key)
                .send(),
        )
        .await??;

        if !response.status().is_success() {
            return Err(anyhow!("Birdeye error: {}", response.status()));
        }
        let body: serde_json::Value = response.json().await?;
        let price = body["data"]["value"]
            .as_f64()
            .ok_or_else(|| anyhow!("Birdeye price not found for {mint}"))?;

        // Four decimal places is what the portfolio view shows.
        Ok(((quantity * price) * 10_000.0).round() / 10_000.0)
    }

    async fn logo_of(&self, mint: &str) -> Result<Option<TokenLogo>> {
        if mint == NATIVE_MINT {
            return Ok(None);
        }
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getAsset",
            "params": { "id": mint }
        });

        let response = timeout(
            HTTP_TIMEOUT,
            self.client
                .post(&self.das_url)
                .header("Content-Type", "application/json")
                .json(&request_body)
                .send(),
        )
        .await??;

        if !response.status().is_success() {
            return Err(anyhow!("DAS API error: {}", response.status()));
        }
        let body: serde_json::Value = response.json().await?;
        let asset = parse_asset(&body, self.default_decimals);
        if asset.as_ref().map_or(true, |a| a.logo_uri.is_none()) {
            debug!("[ENRICH] No image for {}", mint);
        }
        Ok(asset)
    }

    async fn native_price(&self) -> Result<f64> {
        let response = timeout(HTTP_TIMEOUT, self.client.get(COINGECKO_SOL_URL).send()).await??;
        if !response.status().is_success() {
            return Err(anyhow!("CoinGecko error: {}", response.status()));
        }
        let body: serde_json::Value = response.json().await?;
        body["solana"]["usd"]
            .as_f64()
            .ok_or_else(|| anyhow!("CoinGecko response has no solana.usd"))
    }
}

/// Build the record stored for `mint`. Enrichment failures degrade to
/// placeholders instead of failing the event.
pub async fn enrich_record(
    enrichment: &dyn TokenEnrichment,
    mint: &str,
    raw_balance: u64,
    default_decimals: u8,
) -> TokenRecord {
    let logo = match enrichment.logo_of(mint).await {
        Ok(logo) => logo,
        Err(e) => {
            warn!("⚠️ [ENRICH] Logo lookup for {} failed: {:#}", mint, e);
            None
        }
    };
    let decimals = logo.as_ref().map_or(default_decimals, |l| l.decimals);
    let balance = raw_balance as f64 / 10f64.powi(i32::from(decimals));

    let usd_value = match enrichment.price_of(mint, balance).await {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        Ok(_) => f64::NAN,
        Err(e) => {
            warn!("⚠️ [ENRICH] Price lookup for {} failed: {:#}", mint, e);
            f64::NAN
        }
    };

    let (logo_uri, symbol) = logo.map_or((None, None), |l| (l.logo_uri, l.symbol));
    let logo_uri = logo_uri.unwrap_or_else(|| DEFAULT_IMG.to_string());
    let symbol = symbol.unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
    TokenRecord {
        mint: mint.to_string(),
        balance,
        usd_value,
        logo_uri,
        symbol,
        removed: false,
    }
}

/* --------------------------------------------------------------------- */
/*  Native price cache                                                   */
/* --------------------------------------------------------------------- */

/// Fetch SOL/USD and cache it under `key`. Non-positive prices are not stored.
pub async fn refresh_native_price(
    store: &dyn CoordinationStore,
    enrichment: &dyn TokenEnrichment,
    key: &str,
    ttl: Duration,
) -> Result<Option<f64>> {
    let price = enrichment.native_price().await?;
    if !price.is_finite() || price <= 0.0 {
        warn!("⚠️ [PRICE] Ignoring SOL price {}", price);
        return Ok(None);
    }
    store.set(key, &price.to_string(), Some(ttl)).await?;
    debug!("[PRICE] SOL = ${}", price);
    Ok(Some(price))
}

pub fn spawn_native_price_refresher(
    store: Arc<dyn CoordinationStore>,
    enrichment: Arc<dyn TokenEnrichment>,
    key: String,
    ttl: Duration,
) -> JoinHandle<()> {
    info!("💲 [PRICE] Refreshing SOL price every {:?}", ttl);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ttl);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_native_price(store.as_ref(), enrichment.as_ref(), &key, ttl).await {
                warn!("⚠️ [PRICE] SOL price refresh failed: {:#}", e);
            }
        }
    })
}
