//! Runtime configuration loader and common helpers.

use std::{env, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// ------------------------------------------------------------------
/// Shared-store key layout
/// ------------------------------------------------------------------
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeySpace {
    /// Set of accounts that some instance should be watching.
    pub desired_set: String,
    pub lease_prefix: String,
    pub tokens_prefix: String,
    pub fanout_channel: String,
    pub native_price: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self {
            desired_set: "active_wallets".to_string(),
            lease_prefix: "lock:".to_string(),
            tokens_prefix: "tokens:".to_string(),
            fanout_channel: "ws-messages".to_string(),
            native_price: "solPrice".to_string(),
        }
    }
}

impl KeySpace {
    pub fn lease_key(&self, account: &str) -> String {
        format!("{}{}", self.lease_prefix, account)
    }

    pub fn tokens_key(&self, account: &str) -> String {
        format!("{}{}", self.tokens_prefix, account)
    }
}

/// ------------------------------------------------------------------
/// Main Settings object
/// ------------------------------------------------------------------
#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    /* -------- infrastructure ------------------------ */
    pub redis_url: String,
    pub rpc_url: String,
    pub wss_url: String,
    pub das_url: String,
    pub birdeye_api_key: String,
    pub commitment: String,
    pub log_level: String,

    /* -------- reconciliation ------------------------ */
    pub reconcile_interval_ms: u64,
    pub lease_ttl_secs: u64,

    /* -------- tracked tokens ------------------------ */
    pub tracked_tokens_ttl_secs: u64,
    pub dust_threshold: u64,
    pub default_decimals: u8,
    pub native_price_ttl_secs: u64,

    pub keys: KeySpace,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            rpc_url: String::new(),
            wss_url: String::new(),
            das_url: String::new(),
            birdeye_api_key: String::new(),
            commitment: "confirmed".to_string(),
            log_level: "info".to_string(),
            reconcile_interval_ms: 5_000,
            lease_ttl_secs: 30,
            tracked_tokens_ttl_secs: 86_400,
            dust_threshold: 3,
            default_decimals: 6,
            native_price_ttl_secs: 300,
            keys: KeySpace::default(),
        }
    }
}

impl Settings {
    /// --------------------------------------------------------------
    /// Read `settings.json` from disk, then apply env overrides.
    /// --------------------------------------------------------------
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading settings file {:?}", path.as_ref()))?;
        let mut settings = Self::from_json_str(&raw)?;
        settings.apply_env();
        Ok(settings)
    }

    /// --------------------------------------------------------------
    /// Load settings from default config/settings.json file.
    /// Falls back to env-only configuration when the file is absent.
    /// --------------------------------------------------------------
    pub fn load() -> Result<Self> {
        let path = Path::new("config/settings.json");
        if path.exists() {
            return Self::load_from_file(path);
        }
        let mut settings = Self::default();
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let json: serde_json::Value = serde_json::from_str(raw).context("parsing settings json")?;
        let defaults = Self::default();

        /* -------- plain strings ---------------------------------- */
        let str_or = |field: &str, fallback: &str| {
            json[field].as_str().unwrap_or(fallback).to_string()
        };
        let redis_url = str_or("redis_url", &defaults.redis_url);
        let rpc_url = str_or("rpc_url", &defaults.rpc_url);
        let wss_url = str_or("wss_url", &defaults.wss_url);
        let das_url = str_or("das_url", &rpc_url);
        let birdeye_api_key = str_or("birdeye_api_key", &defaults.birdeye_api_key);
        let commitment = str_or("commitment", &defaults.commitment);
        let log_level = str_or("log_level", &defaults.log_level);

        /* -------- numeric parameters ----------------------------- */
        let u64_or = |field: &str, fallback: u64| json[field].as_u64().unwrap_or(fallback);
        let reconcile_interval_ms = u64_or("reconcile_interval_ms", defaults.reconcile_interval_ms);
        let lease_ttl_secs = u64_or("lease_ttl_secs", defaults.lease_ttl_secs);
        let tracked_tokens_ttl_secs =
            u64_or("tracked_tokens_ttl_secs", defaults.tracked_tokens_ttl_secs);
        let dust_threshold = u64_or("dust_threshold", defaults.dust_threshold);
        let default_decimals = json["default_decimals"]
            .as_u64()
            .and_then(|d| u8::try_from(d).ok())
            .unwrap_or(defaults.default_decimals);
        let native_price_ttl_secs =
            u64_or("native_price_ttl_secs", defaults.native_price_ttl_secs);

        /* -------- key layout ------------------------------------- */
        let keys = match json.get("keys") {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|_| KeySpace::default()),
            None => KeySpace::default(),
        };

        Ok(Self {
            redis_url,
            rpc_url,
            wss_url,
            das_url,
            birdeye_api_key,
            commitment,
            log_level,
            reconcile_interval_ms,
            lease_ttl_secs,
            tracked_tokens_ttl_secs,
            dust_threshold,
            default_decimals,
            native_price_ttl_secs,
            keys,
        })
    }

    /// Connection secrets are usually injected by the deployment, so they
    /// take precedence over whatever the file says.
    pub fn apply_env(&mut self) {
        let overrides: [(&str, &mut String); 5] = [
            ("REDIS_URL", &mut self.redis_url),
            ("RPC_URL", &mut self.rpc_url),
            ("WSS_URL", &mut self.wss_url),
            ("BIRDEYE_APIKEY", &mut self.birdeye_api_key),
            ("LOG_LEVEL", &mut self.log_level),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
        if self.das_url.is_empty() {
            self.das_url = self.rpc_url.clone();
        }
    }

    /// The service is useless without a store and a ledger endpoint.
    pub fn validate(&self) -> Result<()> {
        if self.redis_url.is_empty() {
            return Err(anyhow!("REDIS_URL is not defined"));
        }
        if self.rpc_url.is_empty() || self.wss_url.is_empty() {
            return Err(anyhow!("RPC_URL or WSS_URL is not defined"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(anyhow!("lease_ttl_secs must be > 0"));
        }
        // Both drive tokio intervals, which reject a zero period.
        if self.reconcile_interval_ms == 0 {
            return Err(anyhow!("reconcile_interval_ms must be > 0"));
        }
        if self.native_price_ttl_secs == 0 {
            return Err(anyhow!("native_price_ttl_secs must be > 0"));
        }
        Ok(())
    }

    /* -------- helpers ---------------------------------------- */
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn tracked_tokens_ttl(&self) -> Duration {
        Duration::from_secs(self.tracked_tokens_ttl_secs)
    }

    pub fn native_price_ttl(&self) -> Duration {
        Duration::from_secs(self.native_price_ttl_secs)
    }
}

/* ------------------------------------------------------------------ */
/*  Manual Debug so the API key never lands in a log line             */
/* ------------------------------------------------------------------ */
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("rpc_url", &self.rpc_url)
            .field("wss_url", &self.wss_url)
            .field("commitment", &self.commitment)
            .field("reconcile_interval_ms", &self.reconcile_interval_ms)
            .field("lease_ttl_secs", &self.lease_ttl_secs)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
