/// Redis wrapper with graceful degradation.
///
/// All operations return `Option<T>` or `bool`: on any Redis error the operation logs a warning
/// and reports "nothing". The pipeline is fully functional without Redis; it only loses usage
/// counters and cross-run duplicate suppression.
use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::CommonError;

#[derive(Clone)]
pub struct RedisCache {
    client: Option<redis::Client>,
}

impl RedisCache {
    /// If the URL is `None` or invalid, returns a `RedisCache` that always degrades (no-ops).
    pub fn new(url: Option<&str>) -> Self {
        let client = url.and_then(|u| {
            redis::Client::open(u)
                .inspect_err(|e| warn!(error = %e, url = u, "failed to create redis client, state disabled"))
                .ok()
        });
        Self { client }
    }

    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub async fn ping(&self) -> Result<(), CommonError> {
        let client = self.client.as_ref().ok_or(CommonError::RedisUnavailable)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn is_available(&self) -> bool {
        self.ping().await.is_ok()
    }

    async fn conn(&self) -> Option<MultiplexedConnection> {
        let client = self.client.as_ref()?;
        client
            .get_multiplexed_async_connection()
            .await
            .inspect_err(|e| warn!(error = %e, "redis connection failed"))
            .ok()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis GET failed"))
            .ok()?
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let Some(mut conn) = self.conn().await else {
            return false;
        };
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis SETEX failed"))
            .is_ok()
    }

    pub async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Option<i64> {
        let mut conn = self.conn().await?;
        conn.hincr::<_, _, _, i64>(key, field, delta)
            .await
            .inspect_err(|e| warn!(error = %e, key, field, "redis HINCRBY failed"))
            .ok()
    }

    pub async fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        conn.hgetall::<_, HashMap<String, String>>(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis HGETALL failed"))
            .ok()
    }

    /// Adds members to a set. Returns `true` if the command succeeded.
    pub async fn sadd(&self, key: &str, members: &[String]) -> bool {
        if members.is_empty() {
            return true;
        }
        let Some(mut conn) = self.conn().await else {
            return false;
        };
        conn.sadd::<_, _, ()>(key, members)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis SADD failed"))
            .is_ok()
    }

    /// `None` means "unknown" (Redis unavailable), which callers treat as not a member.
    pub async fn sismember(&self, key: &str, member: &str) -> Option<bool> {
        let mut conn = self.conn().await?;
        conn.sismember::<_, _, bool>(key, member)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis SISMEMBER failed"))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_degrades_to_no_ops() {
        let cache = RedisCache::disabled();
        assert!(!cache.is_available().await);
        assert!(matches!(cache.ping().await, Err(CommonError::RedisUnavailable)));
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.set_with_ttl("k", "v", 10).await);
        assert_eq!(cache.hincr_by("h", "f", 1).await, None);
        assert_eq!(cache.sismember("s", "m").await, None);
        assert!(cache.sadd("s", &[]).await);
        assert!(!cache.sadd("s", &["m".to_string()]).await);
    }

    #[test]
    fn invalid_url_disables_client() {
        let cache = RedisCache::new(Some("not a url"));
        assert!(cache.client.is_none());
    }
}
