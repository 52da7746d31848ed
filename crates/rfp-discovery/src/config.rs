use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use rfp_common::env;
use rfp_common::openai::OpenAiClientConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::model::Thresholds;
use crate::retry::RetryPolicy;

/// Fan-out settings for one scoring tier.
#[derive(Debug, Clone, Copy)]
pub struct TierConfig {
    pub max_concurrent: usize,
    pub min_interval: Duration,
    /// Outer bound on one item, retries included.
    pub item_timeout: Duration,
    /// Bound on a single backend call.
    pub call_timeout: Duration,
}

/// Application configuration loaded from environment variables.
///
/// Every value has a default; only malformed values are errors. `REDIS_URL` and
/// `SLACK_WEBHOOK_URL` are optional and their features switch off when unset.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai: OpenAiClientConfig,
    pub mini_model: String,
    pub deep_model: String,
    /// `None` disables deep-tier model fallback.
    pub fallback_model: Option<String>,
    pub mini: TierConfig,
    pub deep: TierConfig,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub thresholds: Thresholds,
    pub max_daily: usize,
    pub data_dir: PathBuf,
    pub company_profile_path: PathBuf,
    pub slack_webhook_url: Option<String>,
    pub redis_url: Option<String>,
    pub run_at: NaiveTime,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let fallback_model = match std::env::var("FALLBACK_MODEL") {
            Ok(v) => Some(v.trim().to_string()).filter(|s| !s.is_empty()),
            Err(_) => Some("gpt-4o".to_string()),
        };

        let thresholds = Thresholds {
            screen: env::parse_or("SCREEN_THRESHOLD", 4)?,
            maybe: env::parse_or("MAYBE_THRESHOLD", 4)?,
            qualified: env::parse_or("QUALIFIED_THRESHOLD", 7)?,
        };
        validate_thresholds(&thresholds)?;

        let run_at = parse_run_at(&env::string("RUN_AT").unwrap_or_else(|| "17:00".to_string()))?;

        let config = Self {
            openai: OpenAiClientConfig::from_env()?,
            mini_model: env::string("MINI_MODEL").unwrap_or_else(|| "gpt-5-mini".to_string()),
            deep_model: env::string("DEEP_MODEL").unwrap_or_else(|| "gpt-5".to_string()),
            fallback_model,
            mini: TierConfig {
                max_concurrent: env::parse_or("MAX_CONCURRENT_MINI", 200)?,
                min_interval: env::millis_or("MINI_MIN_REQUEST_INTERVAL_MS", 5)?,
                item_timeout: env::secs_or("MINI_ITEM_TIMEOUT_SECS", 90)?,
                call_timeout: env::secs_or("MINI_CALL_TIMEOUT_SECS", 20)?,
            },
            deep: TierConfig {
                max_concurrent: env::parse_or("MAX_CONCURRENT_DEEP", 30)?,
                min_interval: env::millis_or("DEEP_MIN_REQUEST_INTERVAL_MS", 10)?,
                item_timeout: env::secs_or("DEEP_ITEM_TIMEOUT_SECS", 300)?,
                call_timeout: env::secs_or("DEEP_CALL_TIMEOUT_SECS", 90)?,
            },
            retry: RetryPolicy {
                max_attempts: env::parse_or("SCORING_MAX_ATTEMPTS", 3)?,
                ..RetryPolicy::default()
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: env::parse_or("CIRCUIT_BREAKER_THRESHOLD", 3)?,
                cooldown: env::secs_or("CIRCUIT_BREAKER_TIMEOUT_SECS", 60)?,
            },
            thresholds,
            max_daily: env::parse_or("MAX_DAILY_RFPS", 20_000)?,
            data_dir: PathBuf::from(env::string("DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            company_profile_path: PathBuf::from(
                env::string("COMPANY_PROFILE_PATH")
                    .unwrap_or_else(|| "./company_config.json".to_string()),
            ),
            slack_webhook_url: env::string("SLACK_WEBHOOK_URL"),
            redis_url: env::string("REDIS_URL"),
            run_at,
        };

        validate_tier("MINI", &config.mini, &config.retry)?;
        validate_tier("DEEP", &config.deep, &config.retry)?;
        if config.max_daily == 0 {
            return Err(AppError::Config("MAX_DAILY_RFPS must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn carryover_path(&self) -> PathBuf {
        self.data_dir.join("carryover.json")
    }

    pub fn inbound_path(&self) -> PathBuf {
        self.data_dir.join("inbound.json")
    }

    pub fn results_path(&self) -> PathBuf {
        self.data_dir.join("results.jsonl")
    }

    pub fn qualified_path(&self) -> PathBuf {
        self.data_dir.join("qualified.jsonl")
    }

    pub fn review_path(&self) -> PathBuf {
        self.data_dir.join("maybe.jsonl")
    }
}

fn validate_thresholds(t: &Thresholds) -> Result<(), AppError> {
    for (name, value) in [
        ("SCREEN_THRESHOLD", t.screen),
        ("MAYBE_THRESHOLD", t.maybe),
        ("QUALIFIED_THRESHOLD", t.qualified),
    ] {
        if !(1..=10).contains(&value) {
            return Err(AppError::Config(format!("{name} must be within 1..=10, got {value}")));
        }
    }
    if t.maybe > t.qualified {
        return Err(AppError::Config(format!(
            "MAYBE_THRESHOLD ({}) must not exceed QUALIFIED_THRESHOLD ({})",
            t.maybe, t.qualified
        )));
    }
    Ok(())
}

/// The item timeout has to leave room for the whole retry sequence, otherwise slow calls are
/// cut off before they are retried.
fn validate_tier(prefix: &str, tier: &TierConfig, retry: &RetryPolicy) -> Result<(), AppError> {
    let needed = retry.worst_case(tier.call_timeout);
    if tier.item_timeout < needed {
        return Err(AppError::Config(format!(
            "{prefix}_ITEM_TIMEOUT_SECS ({}s) must cover {} attempts of {prefix}_CALL_TIMEOUT_SECS \
             ({}s) plus backoff, at least {:.0}s",
            tier.item_timeout.as_secs(),
            retry.max_attempts.max(1),
            tier.call_timeout.as_secs(),
            needed.as_secs_f64().ceil()
        )));
    }
    Ok(())
}

fn parse_run_at(raw: &str) -> Result<NaiveTime, AppError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|e| AppError::Config(format!("RUN_AT must be HH:MM, got {raw:?}: {e}")))
}

/// Company description used both as scoring context and for prioritization.
///
/// Layout matches `company_config.json`:
/// `{"company": {"name", "profile", "capabilities", "past_performance"}, "rfp_targeting": {"keywords", "naics_codes"}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(default)]
    pub company: CompanyInfo,
    #[serde(default)]
    pub rfp_targeting: Targeting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyInfo {
    pub name: String,
    pub profile: String,
    pub capabilities: Vec<String>,
    /// One line per previously won contract.
    pub past_performance: Vec<String>,
}

impl Default for CompanyInfo {
    fn default() -> Self {
        Self {
            name: "YOUR_COMPANY".to_string(),
            profile: "Company profile not configured".to_string(),
            capabilities: [
                "Software development and consulting",
                "Technology integration and implementation",
                "Data analysis and processing",
                "Business process automation",
                "Legacy system modernization",
                "Cloud solutions and deployment",
            ]
            .map(String::from)
            .to_vec(),
            past_performance: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Targeting {
    pub keywords: Vec<String>,
    pub naics_codes: Vec<String>,
}

impl Default for Targeting {
    fn default() -> Self {
        Self {
            keywords: ["software", "technology", "consulting"].map(String::from).to_vec(),
            naics_codes: ["541511", "541512", "541519"].map(String::from).to_vec(),
        }
    }
}

impl CompanyProfile {
    /// Reads the profile, falling back to the neutral default when the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "company profile not readable, using default");
                return Self::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "company profile is not valid JSON, using default");
            Self::default()
        })
    }
}
