//! Instance-local delivery of fanout messages.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

use crate::store::CoordinationStore;

pub type ClientId = u64;

/// account → client id → outbound channel of the client's connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<String, HashMap<ClientId, UnboundedSender<String>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once a client connection has authenticated as `account`.
    pub fn register(&self, account: &str, outbound: UnboundedSender<String>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .entry(account.to_string())
            .or_default()
            .insert(id, outbound);
        id
    }

    pub fn unregister(&self, account: &str, client: ClientId) {
        if let Some(mut conns) = self.clients.get_mut(account) {
            conns.remove(&client);
        }
        self.clients.remove_if(account, |_, conns| conns.is_empty());
    }

    pub fn connection_count(&self, account: &str) -> usize {
        self.clients.get(account).map_or(0, |c| c.len())
    }

    /// Send `message` to every open connection of `account`; closed ones are
    /// dropped from the registry.
    fn send_to(&self, account: &str, message: &str) -> usize {
        let Some(mut conns) = self.clients.get_mut(account) else {
            return 0;
        };
        let mut delivered = 0;
        conns.retain(|_, outbound| {
            if outbound.send(message.to_string()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        drop(conns);
        self.clients.remove_if(account, |_, conns| conns.is_empty());
        delivered
    }
}

/// Only the routing key is interpreted; `data` goes out as-is.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    account_id: String,
    data: serde_json::Value,
}

pub struct FanoutRelay {
    registry: Arc<ConnectionRegistry>,
    channel: String,
}

impl FanoutRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, channel: &str) -> Self {
        Self {
            registry,
            channel: channel.to_string(),
        }
    }

    /// Returns how many local connections received the message.
    pub fn deliver(&self, raw: &str) -> usize {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(e) => e,
            Err(e) => {
                warn!("⚠️ [RELAY] Dropping malformed fanout message: {}", e);
                return 0;
            }
        };
        let delivered = self
            .registry
            .send_to(&envelope.account_id, &envelope.data.to_string());
        if delivered > 0 {
            debug!("[RELAY] {} → {} connection(s)", envelope.account_id, delivered);
        }
        delivered
    }

    /// Subscribe to the fanout channel and relay every message until the
    /// subscription ends.
    pub async fn spawn(self: Arc<Self>, store: Arc<dyn CoordinationStore>) -> Result<JoinHandle<()>> {
        let mut messages = store.subscribe(&self.channel).await?;
        info!("📡 [RELAY] Listening on {}", self.channel);
        Ok(tokio::spawn(async move {
            while let Some(raw) = messages.next().await {
                self.deliver(&raw);
            }
            warn!("⚠️ [RELAY] Fanout subscription on {} closed", self.channel);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fanout::{BroadcastPayload, FanoutPublisher},
        store::MemoryStore,
    };
    use tokio::sync::mpsc;

    fn relay() -> (Arc<ConnectionRegistry>, FanoutRelay) {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = FanoutRelay::new(registry.clone(), "ws-messages");
        (registry, relay)
    }

    #[test]
    fn no_local_connections_is_a_no_op() {
        let (registry, relay) = relay();
        let delivered = relay.deliver(r#"{"accountId":"acct","data":{"mint":"m","removed":true}}"#);
        assert_eq!(delivered, 0);
        assert_eq!(registry.connection_count("acct"), 0);
    }

    #[test]
    fn data_is_forwarded_to_every_connection_of_the_account() {
        let (registry, relay) = relay();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        registry.register("acct", tx1);
        registry.register("acct", tx2);
        registry.register("someone-else", tx3);

        let delivered = relay.deliver(r#"{"accountId":"acct","data":{"mint":"m","removed":true}}"#);
        assert_eq!(delivered, 2);

        let expected = r#"{"mint":"m","removed":true}"#;
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn closed_connections_are_skipped_and_pruned() {
        let (registry, relay) = relay();
        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel::<String>();
        registry.register("acct", open_tx);
        registry.register("acct", closed_tx);
        drop(closed_rx);

        assert_eq!(relay.deliver(r#"{"accountId":"acct","data":1}"#), 1);
        assert_eq!(open_rx.try_recv().unwrap(), "1");
        assert_eq!(registry.connection_count("acct"), 1);
    }

    #[test]
    fn last_unregister_drops_the_account() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let a = registry.register("acct", tx);
        let b = registry.register("acct", tx2);
        registry.unregister("acct", a);
        assert_eq!(registry.connection_count("acct"), 1);
        registry.unregister("acct", b);
        assert!(registry.clients.get("acct").is_none());
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let (_, relay) = relay();
        assert_eq!(relay.deliver("not json"), 0);
        assert_eq!(relay.deliver(r#"{"data":{}}"#), 0);
    }

    #[tokio::test]
    async fn relay_delivers_published_events() {
        let store = Arc::new(MemoryStore::new());
        let (registry, relay) = relay();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("acct", tx);

        let _task = Arc::new(relay).spawn(store.clone()).await.unwrap();
        FanoutPublisher::new(store, "ws-messages")
            .publish("acct", BroadcastPayload::removed("mintX"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(value, serde_json::json!({"mint": "mintX", "removed": true}));
    }
}
