use async_trait::async_trait;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};

use crate::store::{BusMessage, BusStream, SharedStore};
use crate::Error;

// SADD on the unique set decides the winner; the owner set is only touched by
// the winner, inside the same script, so both sets change together or not at all.
static INSERT_UNIQUE: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
    redis.call('SADD', KEYS[2], ARGV[1])
    return 1
end
return 0
"#,
    )
});

// Only members still in the owner set (KEYS[1]) leave the unique set (KEYS[2]);
// a name another instance has claimed since is untouched.
static RELEASE_OWNED: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local released = {}
for _, member in ipairs(ARGV) do
    if redis.call('SREM', KEYS[1], member) == 1 then
        redis.call('SREM', KEYS[2], member)
        table.insert(released, member)
    end
end
return released
"#,
    )
});

// Read, unlink and delete in one step so a second observer evicting the same
// instance finds an empty owner set.
static DRAIN_OWNED: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local members = redis.call('SMEMBERS', KEYS[1])
for _, member in ipairs(members) do
    redis.call('SREM', KEYS[2], member)
end
redis.call('DEL', KEYS[1])
return members
"#,
    )
});

/// [`SharedStore`] backed by Redis sets, hashes and Pub/Sub.
///
/// Commands go through one multiplexed connection (cheap to clone per call);
/// every subscription opens its own dedicated Pub/Sub connection.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        tracing::debug!("Connected to Redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn insert_unique(
        &self,
        unique_key: &str,
        owner_key: &str,
        member: &str,
    ) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let mut invocation = INSERT_UNIQUE.prepare_invoke();
        invocation.key(unique_key).key(owner_key).arg(member);
        let added: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(added == 1)
    }

    async fn release_owned(
        &self,
        owner_key: &str,
        unique_key: &str,
        members: &[String],
    ) -> Result<Vec<String>, Error> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut invocation = RELEASE_OWNED.prepare_invoke();
        invocation.key(owner_key).key(unique_key).arg(members);
        let released: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(released)
    }

    async fn drain_owned(&self, owner_key: &str, unique_key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let mut invocation = DRAIN_OWNED.prepare_invoke();
        invocation.key(owner_key).key(unique_key);
        let drained: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(drained)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, Error> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let created: i64 = conn.hset(key, field, value).await?;
        Ok(created == 1)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(entries)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::trace!(channel, receivers, "Published to Redis channel");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
            tracing::debug!("Subscribed to {}", channel);
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!("Failed to get Pub/Sub payload: {}", e);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
