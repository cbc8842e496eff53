// =============================================================================
// Cache — Redis-backed leaderboard cache and session lookups
// =============================================================================
//
// A thin wrapper over `redis::aio::ConnectionManager`, which reconnects
// transparently the way the teacher's `binance::client` retries a dropped
// REST connection. Cache misses and Redis unavailability are never fatal:
// callers fall back to the source of truth (Postgres) and log a warning,
// matching spec.md §4.6's "cache is an optimization, not a dependency".
// =============================================================================

use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

#[derive(Clone)]
pub struct Cache {
    manager: ConnectionManager,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    /// Fetch and deserialize a JSON value, returning `None` on a miss or any
    /// Redis/deserialize error (logged, not propagated).
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, %key, "cache get failed, falling back to source of truth");
                return None;
            }
        };
        match raw {
            Some(s) => match serde_json::from_str(&s) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, %key, "cache value failed to deserialize");
                    None
                }
            },
            None => None,
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_s: u64) {
        let mut conn = self.manager.clone();
        let Ok(raw) = serde_json::to_string(value) else {
            warn!(%key, "cache value failed to serialize, skipping write");
            return;
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, raw, ttl_s).await {
            warn!(error = %e, %key, "cache set failed");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let mut conn = self.manager.clone();
        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!(error = %e, %key, "cache invalidate failed");
        }
    }
}

pub fn leaderboard_key(period: &str) -> String {
    format!("leaderboard:{period}")
}
