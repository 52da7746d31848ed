use rfp_common::redis::RedisCache;
use tracing::{info, warn};

use crate::model::Opportunity;

const SEEN_KEY: &str = "rfp:v1:seen";

/// Ids recorded by earlier runs. Lookups that cannot reach Redis count as "not seen", so an
/// outage can only cause re-scoring, never skipped work.
#[derive(Clone)]
pub struct SeenLedger {
    redis: RedisCache,
}

impl SeenLedger {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    /// Splits `items` into `(unseen, already_seen_count)`.
    pub async fn filter_unseen(&self, items: Vec<Opportunity>) -> (Vec<Opportunity>, usize) {
        if !self.redis.is_available().await {
            return (items, 0);
        }
        let mut unseen = Vec::with_capacity(items.len());
        let mut seen = 0usize;
        for item in items {
            if self.redis.sismember(SEEN_KEY, &item.id).await == Some(true) {
                seen += 1;
            } else {
                unseen.push(item);
            }
        }
        if seen > 0 {
            info!(seen, "skipping opportunities recorded by earlier runs");
        }
        (unseen, seen)
    }

    pub async fn mark_seen(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if !self.redis.sadd(SEEN_KEY, ids).await {
            warn!(count = ids.len(), "could not record seen ids");
        }
    }
}
