//! In-process coordination store with Redis-like expiry and pub/sub.
//!
//! Expiry is evaluated lazily against `tokio::time::Instant`, so tests running
//! on a paused clock can step past a TTL with `tokio::time::advance`.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tokio_stream::wrappers::BroadcastStream;

use super::CoordinationStore;

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|e| !e.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some_and(|e| e.value == expected) {
            inner.values.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.live(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        if let Some(sender) = inner.channels.get(channel) {
            // No receivers is fine; Redis drops the message too.
            let _ = sender.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut inner = self.inner.lock().await;
        let receiver = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|msg| async move { msg.ok() })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.set_if_absent("lock:a", "one", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "two", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!store.set_if_absent("lock:a", "two", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("lock:a", "two", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn conditional_delete_and_expire_check_the_value() {
        let store = MemoryStore::new();
        store.set("lock:a", "one", None).await.unwrap();

        assert!(!store.delete_if_equals("lock:a", "two").await.unwrap());
        assert!(!store
            .expire_if_equals("lock:a", "two", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("lock:a", "one", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store.delete_if_equals("lock:a", "one").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(!store.expire("lock:a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn set_membership() {
        let store = MemoryStore::new();
        store.set_add("active", "a").await.unwrap();
        store.set_add("active", "b").await.unwrap();
        store.set_add("active", "a").await.unwrap();
        assert_eq!(store.set_members("active").await.unwrap(), vec!["a", "b"]);

        store.set_remove("active", "a").await.unwrap();
        store.set_remove("active", "missing").await.unwrap();
        assert_eq!(store.set_members("active").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn subscribers_receive_published_messages() {
        let store = MemoryStore::new();
        store.publish("chan", "before").await.unwrap();

        let mut first = store.subscribe("chan").await.unwrap();
        let mut second = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();

        assert_eq!(first.next().await.as_deref(), Some("hello"));
        assert_eq!(second.next().await.as_deref(), Some("hello"));
    }
}
