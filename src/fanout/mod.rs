//! Cross-instance fanout of portfolio changes.
//!
//! The instance that handled an event publishes once; every instance relays
//! to the client connections it happens to hold for that account.

pub mod relay;

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::{store::CoordinationStore, tokens::TokenRecord};

pub use relay::{ConnectionRegistry, FanoutRelay};

/// What clients receive for an account.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BroadcastPayload {
    Token(TokenRecord),
    Removed {
        mint: String,
        #[serde(deserialize_with = "removal_marker")]
        removed: bool,
    },
}

/// `removed` on a removal is always `true`; anything else is not a removal.
fn removal_marker<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    if bool::deserialize(deserializer)? {
        Ok(true)
    } else {
        Err(de::Error::custom("removal marker must be true"))
    }
}

impl BroadcastPayload {
    pub fn removed(mint: &str) -> Self {
        BroadcastPayload::Removed {
            mint: mint.to_string(),
            removed: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub account_id: String,
    pub data: BroadcastPayload,
}

pub struct FanoutPublisher {
    store: Arc<dyn CoordinationStore>,
    channel: String,
}

impl FanoutPublisher {
    pub fn new(store: Arc<dyn CoordinationStore>, channel: &str) -> Self {
        Self {
            store,
            channel: channel.to_string(),
        }
    }

    pub async fn publish(&self, account: &str, payload: BroadcastPayload) -> Result<()> {
        let event = BroadcastEvent {
            account_id: account.to_string(),
            data: payload,
        };
        let raw = serde_json::to_string(&event)?;
        self.store.publish(&self.channel, &raw).await?;
        debug!("[FANOUT] Published {} bytes for {}", raw.len(), account);
        Ok(())
    }
}
