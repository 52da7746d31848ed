use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::openai::ChatCompletionUsage;
use crate::redis::RedisCache;

const USAGE_KEY: &str = "rfp:v1:usage";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UsageStats {
    pub models: Vec<ModelUsageStats>,
    pub redis_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelUsageStats {
    pub model: String,
    pub requests: u64,
    pub failures: u64,
    pub total_tokens: Option<u64>,
    pub token_counted_requests: u64,
}

/// Per-model request and token counters, kept in a single Redis hash.
///
/// Field layout: `{kind}:{model}` where kind is one of `requests`, `failures`,
/// `tokens_total`, `tokens_known_requests`.
#[derive(Clone)]
pub struct UsageTracker {
    redis: RedisCache,
}

impl UsageTracker {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    pub async fn record(&self, model: &str, usage: Option<&ChatCompletionUsage>) {
        self.redis
            .hincr_by(USAGE_KEY, &format!("requests:{model}"), 1)
            .await;

        if let Some(total) = usage.and_then(|u| u.total_tokens) {
            self.redis
                .hincr_by(USAGE_KEY, &format!("tokens_total:{model}"), total as i64)
                .await;
            self.redis
                .hincr_by(USAGE_KEY, &format!("tokens_known_requests:{model}"), 1)
                .await;
        }
    }

    pub async fn record_failure(&self, model: &str) {
        self.redis
            .hincr_by(USAGE_KEY, &format!("failures:{model}"), 1)
            .await;
    }

    pub async fn get_usage_stats(&self) -> UsageStats {
        let redis_available = self.redis.is_available().await;
        let entries = self.redis.hgetall(USAGE_KEY).await.unwrap_or_default();
        UsageStats {
            models: aggregate(entries),
            redis_available,
        }
    }
}

fn aggregate(entries: HashMap<String, String>) -> Vec<ModelUsageStats> {
    let mut by_model: HashMap<String, ModelUsageStats> = HashMap::new();

    for (field, value) in entries {
        let Some((kind, model)) = field.split_once(':') else {
            continue;
        };
        let stat = by_model
            .entry(model.to_string())
            .or_insert_with(|| ModelUsageStats {
                model: model.to_string(),
                requests: 0,
                failures: 0,
                total_tokens: None,
                token_counted_requests: 0,
            });

        let parsed = value.parse::<u64>().unwrap_or(0);
        match kind {
            "requests" => stat.requests = parsed,
            "failures" => stat.failures = parsed,
            "tokens_total" => stat.total_tokens = Some(parsed),
            "tokens_known_requests" => stat.token_counted_requests = parsed,
            _ => {}
        }
    }

    let mut models: Vec<ModelUsageStats> = by_model.into_values().collect();
    models.sort_by(|a, b| a.model.cmp(&b.model));
    models
}
