//! Redis-backed coordination store.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{info, warn};
use once_cell::sync::Lazy;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client as RedisClient, Script};

use super::{ttl_secs, CoordinationStore};

/// DEL only if the key still holds ARGV[1].
static DELETE_IF_EQUALS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
          end
          return 0",
    )
});

/// EXPIRE only if the key still holds ARGV[1].
static EXPIRE_IF_EQUALS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('EXPIRE', KEYS[1], ARGV[2])
          end
          return 0",
    )
});

#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Open the client and establish the shared multiplexed connection.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = RedisClient::open(redis_url).context("parsing REDIS_URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to Redis")?;
        info!("🔌 [STORE] Redis client connected");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn();
        let deleted: i64 = DELETE_IF_EQUALS
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let updated: i64 = EXPIRE_IF_EQUALS
            .key(key)
            .arg(expected)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    /// Pub/sub needs a connection of its own; it cannot share the multiplexed one.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("opening Redis pub/sub connection")?;
        pubsub.subscribe(channel).await?;
        info!("📡 [STORE] Subscribed to channel {}", channel);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("⚠️ [STORE] Dropping non-utf8 pub/sub payload: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
