use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::breaker::BreakerSnapshot;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TierCounts {
    pub rejected_by_mini: usize,
    pub qualified: usize,
    pub maybe: usize,
    pub rejected: usize,
    /// Mini survivors whose deep analysis did not run.
    pub deferred: usize,
    /// Error-sentinel results across both tiers.
    pub errors: usize,
}

impl TierCounts {
    pub fn evaluated(&self) -> usize {
        self.rejected_by_mini + self.qualified + self.maybe + self.rejected
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageTimings {
    pub fetch_ms: u64,
    pub screening_ms: u64,
    pub deep_ms: u64,
    pub persist_ms: u64,
    pub total_ms: u64,
}

pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Highlight {
    pub id: String,
    pub title: String,
    pub agency: String,
    pub score: u8,
    pub link: Option<String>,
}

/// What a run did, including how far it got when it stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub mode: String,
    pub search_range: Option<String>,
    pub fetched: usize,
    pub prefiltered_out: usize,
    pub already_seen: usize,
    pub from_carryover: usize,
    /// Items handed to the mini tier.
    pub screened_input: usize,
    pub screen_threshold: u8,
    pub counts: TierCounts,
    /// Items waiting in the carryover store after this run.
    pub carried_over: usize,
    pub avg_deep_score: Option<f64>,
    pub timings: StageTimings,
    pub partial: bool,
    pub failure: Option<String>,
    pub sink_failures: usize,
    /// Ids recorded in the seen ledger. Error results are left out and get scored again later.
    #[serde(default)]
    pub marked_seen: usize,
    pub top_qualified: Vec<Highlight>,
    /// Breaker state per model at the end of the run.
    #[serde(default)]
    pub breakers: Vec<BreakerSnapshot>,
}

pub fn new_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let counter = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut h = Sha256::new();
    h.update(now.as_nanos().to_le_bytes());
    h.update(std::process::id().to_le_bytes());
    h.update(counter.to_le_bytes());
    let digest = h.finalize();
    hex_lower(&digest[..8])
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_hex_and_distinct() {
        let a = new_run_id();
        let b = new_run_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn evaluated_excludes_deferred() {
        let counts = TierCounts {
            rejected_by_mini: 10,
            qualified: 3,
            maybe: 4,
            rejected: 5,
            deferred: 2,
            errors: 1,
        };
        assert_eq!(counts.evaluated(), 22);
    }
}
