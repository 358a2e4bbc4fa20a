//! Pluggable persistence for subscription state.
//!
//! The in-memory [`super::SubscriptionStore`] trie is always authoritative
//! for matching; a [`SubscriptionBackend`] only mirrors subscribe/unsubscribe
//! calls so the trie can be rebuilt after a restart. `Ram` keeps nothing,
//! `Disk` mirrors into the embedded KV store, `Redis` mirrors into an
//! external server shared across a cluster of brokers pointed at it.

use async_trait::async_trait;

/// Error returned by a [`SubscriptionBackend`] operation.
#[derive(Debug)]
pub enum StoreError {
    Fjall(fjall::Error),
    Redis(redis::RedisError),
    Encode(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Fjall(e) => write!(f, "fjall error: {}", e),
            StoreError::Redis(e) => write!(f, "redis error: {}", e),
            StoreError::Encode(msg) => write!(f, "encode error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Fjall(e)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Redis(e)
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// A (client_id, filter) pair recovered from the backend at startup.
pub struct StoredSubscription {
    pub client_id: String,
    pub filter: String,
}

/// Mirrors subscribe/unsubscribe calls for crash recovery.
///
/// Implementations only need to be eventually consistent with the trie:
/// a backend write failing is logged and otherwise ignored, since the
/// trie itself is still correct until the next restart.
#[async_trait]
pub trait SubscriptionBackend: Send + Sync {
    async fn persist(&self, client_id: &str, filter: &str) -> Result<()>;
    async fn remove(&self, client_id: &str, filter: &str) -> Result<()>;
    async fn remove_all(&self, client_id: &str) -> Result<()>;
    /// Rebuild the full subscription set after a restart.
    async fn load_all(&self) -> Result<Vec<StoredSubscription>>;
}

/// Trie-only backend; nothing survives a restart.
#[derive(Debug, Default)]
pub struct RamBackend;

#[async_trait]
impl SubscriptionBackend for RamBackend {
    async fn persist(&self, _client_id: &str, _filter: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _client_id: &str, _filter: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_all(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredSubscription>> {
        Ok(Vec::new())
    }
}

fn subscription_key(client_id: &str, filter: &str) -> String {
    format!("topic:{}:{}", client_id, filter)
}

/// Mirrors subscriptions into an embedded fjall partition, keyed
/// `topic:<clientId>:<filter>`. Rebuilt on startup via a prefix scan.
pub struct FjallSubscriptionBackend {
    partition: fjall::PartitionHandle,
}

impl FjallSubscriptionBackend {
    pub fn open(keyspace: &fjall::Keyspace) -> Result<Self> {
        let partition =
            keyspace.open_partition("subscriptions", fjall::PartitionCreateOptions::default())?;
        Ok(Self { partition })
    }
}

#[async_trait]
impl SubscriptionBackend for FjallSubscriptionBackend {
    async fn persist(&self, client_id: &str, filter: &str) -> Result<()> {
        self.partition
            .insert(subscription_key(client_id, filter), b"")?;
        Ok(())
    }

    async fn remove(&self, client_id: &str, filter: &str) -> Result<()> {
        self.partition.remove(subscription_key(client_id, filter))?;
        Ok(())
    }

    async fn remove_all(&self, client_id: &str) -> Result<()> {
        let prefix = format!("topic:{}:", client_id);
        for kv in self.partition.prefix(&prefix) {
            let (key, _) = kv?;
            self.partition.remove(key)?;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredSubscription>> {
        let mut out = Vec::new();
        for kv in self.partition.prefix("topic:") {
            let (key, _) = kv?;
            let key = String::from_utf8_lossy(&key);
            // topic:<clientId>:<filter> - clientId never contains ':' in practice
            if let Some(rest) = key.strip_prefix("topic:") {
                if let Some((client_id, filter)) = rest.split_once(':') {
                    out.push(StoredSubscription {
                        client_id: client_id.to_string(),
                        filter: filter.to_string(),
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Mirrors subscriptions into Redis, one hash per client: `sub:<clientId>`
/// maps filter -> "1". Used when several brokers share subscription state
/// through a store external to the cluster's own gossip replication.
pub struct RedisSubscriptionBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisSubscriptionBackend {
    pub async fn connect(addrs: &[String], user: Option<&str>, pwd: Option<&str>) -> Result<Self> {
        let addr = addrs
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1:6379".to_string());
        let mut url = format!("redis://");
        if let (Some(user), Some(pwd)) = (user, pwd) {
            url.push_str(&format!("{}:{}@", user, pwd));
        } else if let Some(pwd) = pwd {
            url.push_str(&format!(":{}@", pwd));
        }
        url.push_str(&addr);

        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn hash_key(client_id: &str) -> String {
        format!("sub:{}", client_id)
    }
}

#[async_trait]
impl SubscriptionBackend for RedisSubscriptionBackend {
    async fn persist(&self, client_id: &str, filter: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(Self::hash_key(client_id), filter, "1").await?;
        Ok(())
    }

    async fn remove(&self, client_id: &str, filter: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(Self::hash_key(client_id), filter).await?;
        Ok(())
    }

    async fn remove_all(&self, client_id: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::hash_key(client_id)).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredSubscription>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let mut out = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("sub:*")
                .query_async(&mut conn)
                .await?;
            for key in keys {
                let client_id = key.trim_start_matches("sub:").to_string();
                let filters: Vec<String> = conn.hkeys(&key).await?;
                for filter in filters {
                    out.push(StoredSubscription {
                        client_id: client_id.clone(),
                        filter,
                    });
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }
}
