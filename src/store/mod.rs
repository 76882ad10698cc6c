//! Shared coordination store.
//!
//! Everything instances agree on (who should be watched, who owns which
//! lease, the tracked-token documents, the fanout channel) goes through this
//! trait. `RedisStore` is the production backend; `MemoryStore` mirrors its
//! semantics in-process.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Atomic `SET key value NX EX ttl`. Returns `true` when the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Plain `SET`, with an expiry when `ttl` is given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    async fn del(&self, key: &str) -> anyhow::Result<()>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> anyhow::Result<bool>;

    /// Refresh the expiry of `key` only while it still holds `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration)
        -> anyhow::Result<bool>;

    async fn set_add(&self, key: &str, member: &str) -> anyhow::Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> anyhow::Result<()>;

    async fn set_members(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> anyhow::Result<()>;

    /// Stream of message payloads published on `channel` after this call.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>>;
}

/// Redis expiries are whole seconds; never round a live TTL down to zero.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
