use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Webhook replay dedup keyed by provider event id. Redis-backed when
/// `REDIS_URL` is configured, in-process set otherwise. Best-effort: a redis
/// outage degrades to processing the event again, which the unlock and
/// intake paths tolerate.
#[derive(Clone)]
pub struct EventDedup {
    redis: Option<redis::Client>,
    seen: Arc<Mutex<HashSet<String>>>,
    ttl_secs: u64,
}

impl EventDedup {
    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        let ttl_secs = std::env::var("EVENT_DEDUP_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60 * 60 * 24);
        Self {
            redis,
            seen: Arc::new(Mutex::new(HashSet::new())),
            ttl_secs,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            redis: None,
            seen: Arc::new(Mutex::new(HashSet::new())),
            ttl_secs: 60 * 60 * 24,
        }
    }

    /// Record the event id; returns true the first time it is seen.
    pub async fn first_delivery(&self, source: &str, event_id: &str) -> bool {
        let key = format!("event:{source}:{event_id}");
        if let Some(client) = &self.redis {
            match self.redis_claim(client, &key).await {
                Some(fresh) => return fresh,
                None => {
                    warn!(target = "pawtraits.api", key = %key, "redis dedup unavailable, using local set");
                }
            }
        }
        let mut guard = self.seen.lock().await;
        guard.insert(key)
    }

    async fn redis_claim(&self, client: &redis::Client, key: &str) -> Option<bool> {
        let mut conn = client.get_multiplexed_async_connection().await.ok()?;
        // SET NX EX: claimed iff the key did not exist
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .ok()?;
        Some(set.is_some())
    }
}
