//! Daily load cap with durable overflow.
//!
//! Inbound items beyond the daily cap are written to a carryover batch and surface first on the
//! next run. The store only ever holds items that are not part of the current run's work.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::CompanyProfile;
use crate::error::AppError;
use crate::model::Opportunity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarryoverBatch {
    pub date: NaiveDate,
    pub count: usize,
    #[serde(alias = "rfps")]
    pub items: Vec<Opportunity>,
}

impl CarryoverBatch {
    pub fn new(date: NaiveDate, items: Vec<Opportunity>) -> Self {
        Self {
            date,
            count: items.len(),
            items,
        }
    }
}

/// Durable home of the pending batch. `write` must replace the previous batch atomically.
pub trait CarryoverStore: Send + Sync {
    fn read(&self) -> Result<Option<CarryoverBatch>, AppError>;
    fn write(&self, batch: &CarryoverBatch) -> Result<(), AppError>;
    fn clear(&self) -> Result<(), AppError>;
}

/// JSON file written through a temp file in the same directory, fsynced, then renamed over the
/// target.
pub struct FileCarryoverStore {
    path: PathBuf,
}

impl FileCarryoverStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Keeps an unreadable batch for inspection instead of overwriting it on the next write.
    fn quarantine(&self, reason: &str) {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{stamp}"));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => error!(
                path = %self.path.display(),
                moved_to = %Path::new(&aside).display(),
                reason,
                "carryover batch unreadable, moved aside"
            ),
            Err(e) => error!(path = %self.path.display(), error = %e, "failed to move corrupt carryover batch"),
        }
    }
}

impl CarryoverStore for FileCarryoverStore {
    fn read(&self) -> Result<Option<CarryoverBatch>, AppError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<CarryoverBatch>(&raw) {
            Ok(batch) => Ok(Some(batch)),
            Err(e) => {
                self.quarantine(&e.to_string());
                Ok(None)
            }
        }
    }

    fn write(&self, batch: &CarryoverBatch) -> Result<(), AppError> {
        let dir = self.dir();
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".carryover-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, batch)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| AppError::Carryover(format!("rename into {}: {}", self.path.display(), e.error)))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), AppError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

const DEFAULT_TITLE_KEYWORDS: &[&str] = &[
    "ai",
    "artificial intelligence",
    "machine learning",
    "ml",
    "data",
    "analytics",
    "automation",
    "algorithm",
    "software",
    "cloud",
    "digital",
    "cyber",
    "system",
    "platform",
];

const DEFAULT_PSC_PREFIXES: &[&str] = &["DA", "DB", "DC", "DD", "DJ"];

/// Cheap four-bucket ordering: matching NAICS prefix, then title keyword, then IT PSC prefix,
/// then everything else. Keywords match on word boundaries.
#[derive(Debug, Clone)]
pub struct PriorityRules {
    naics_prefixes: Vec<String>,
    title_keywords: Option<Regex>,
    psc_prefixes: Vec<String>,
}

impl PriorityRules {
    pub fn new(
        naics_prefixes: Vec<String>,
        title_keywords: &[String],
        psc_prefixes: Vec<String>,
    ) -> Result<Self, AppError> {
        let title_keywords = if title_keywords.is_empty() {
            None
        } else {
            let alternation = title_keywords
                .iter()
                .map(|k| regex::escape(k.trim()))
                .collect::<Vec<_>>()
                .join("|");
            Some(
                Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))
                    .map_err(|e| AppError::Config(format!("priority keywords: {e}")))?,
            )
        };
        Ok(Self {
            naics_prefixes,
            title_keywords,
            psc_prefixes,
        })
    }

    /// Defaults extended with the profile's targeting lists.
    pub fn from_profile(profile: &CompanyProfile) -> Result<Self, AppError> {
        let mut naics: Vec<String> = vec!["541".to_string()];
        naics.extend(profile.rfp_targeting.naics_codes.iter().cloned());

        let mut keywords: Vec<String> = DEFAULT_TITLE_KEYWORDS.iter().map(|s| s.to_string()).collect();
        keywords.extend(profile.rfp_targeting.keywords.iter().cloned());
        keywords.retain(|k| !k.trim().is_empty());
        keywords.sort();
        keywords.dedup();

        Self::new(
            naics,
            &keywords,
            DEFAULT_PSC_PREFIXES.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// 0 is most promising.
    pub fn rank(&self, opp: &Opportunity) -> u8 {
        let naics = opp.naics_code.as_deref().unwrap_or_default();
        if !naics.is_empty() && self.naics_prefixes.iter().any(|p| naics.starts_with(p.as_str())) {
            return 0;
        }
        if self
            .title_keywords
            .as_ref()
            .is_some_and(|re| re.is_match(&opp.title))
        {
            return 1;
        }
        let psc = opp.classification_code.as_deref().unwrap_or_default();
        if !psc.is_empty() && self.psc_prefixes.iter().any(|p| psc.starts_with(p.as_str())) {
            return 2;
        }
        3
    }
}

/// Monotonic step function from inbound volume to the mini-tier cutoff.
#[derive(Debug, Clone)]
pub struct AdaptiveThreshold {
    /// `(volume_below, threshold)` ascending by volume.
    steps: Vec<(usize, u8)>,
    ceiling: u8,
}

impl Default for AdaptiveThreshold {
    fn default() -> Self {
        Self {
            steps: vec![(300, 4), (600, 5), (1_000, 6)],
            ceiling: 7,
        }
    }
}

impl AdaptiveThreshold {
    pub fn for_volume(&self, volume: usize) -> u8 {
        self.steps
            .iter()
            .find(|(below, _)| volume < *below)
            .map(|(_, t)| *t)
            .unwrap_or(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct DailyLoad {
    pub to_process: Vec<Opportunity>,
    pub to_carryover: Vec<Opportunity>,
    /// How many of `to_process` came from the pending store.
    pub from_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct CarryoverStats {
    pub has_carryover: bool,
    pub count: usize,
    pub date: Option<String>,
    pub oldest_deadline: Option<String>,
}

pub struct LoadCarryoverManager {
    store: Arc<dyn CarryoverStore>,
    daily_cap: usize,
    rules: PriorityRules,
    adaptive: AdaptiveThreshold,
    base_threshold: u8,
}

impl LoadCarryoverManager {
    pub fn new(
        store: Arc<dyn CarryoverStore>,
        daily_cap: usize,
        rules: PriorityRules,
        base_threshold: u8,
    ) -> Self {
        Self {
            store,
            daily_cap: daily_cap.max(1),
            rules,
            adaptive: AdaptiveThreshold::default(),
            base_threshold,
        }
    }

    pub fn load_pending(&self) -> Result<Vec<Opportunity>, AppError> {
        let Some(batch) = self.store.read()? else {
            return Ok(Vec::new());
        };
        info!(count = batch.items.len(), date = %batch.date, "loaded carryover batch");
        Ok(batch.items)
    }

    /// Stable sort by priority bucket; order within a bucket is preserved.
    pub fn prioritize(&self, mut items: Vec<Opportunity>) -> Vec<Opportunity> {
        items.sort_by_key(|o| self.rules.rank(o));
        items
    }

    /// Never looser than the configured base threshold.
    pub fn adaptive_threshold(&self, volume: usize) -> u8 {
        self.adaptive.for_volume(volume).max(self.base_threshold)
    }

    /// Merges pending (first, in stored order) with prioritized new items, caps the result, and
    /// replaces the store with the overflow. The store is cleared when nothing overflows.
    pub fn manage_daily_load(&self, new_items: Vec<Opportunity>) -> Result<DailyLoad, AppError> {
        let pending = self.load_pending()?;
        let pending_len = pending.len();
        let new_len = new_items.len();

        let mut seen = HashSet::new();
        let mut missing_id = 0usize;
        let mut merged = Vec::with_capacity(pending_len + new_len);
        let mut pending_kept = 0usize;

        for item in pending {
            if item.id.trim().is_empty() {
                missing_id += 1;
            } else if seen.insert(item.id.clone()) {
                merged.push(item);
                pending_kept += 1;
            }
        }
        for item in self.prioritize(new_items) {
            if item.id.trim().is_empty() {
                missing_id += 1;
            } else if seen.insert(item.id.clone()) {
                merged.push(item);
            }
        }
        if missing_id > 0 {
            warn!(missing_id, "skipping opportunities without an id");
        }

        let to_carryover = if merged.len() > self.daily_cap {
            merged.split_off(self.daily_cap)
        } else {
            Vec::new()
        };

        if to_carryover.is_empty() {
            self.store.clear()?;
            info!(
                total = merged.len(),
                pending = pending_kept,
                new = new_len,
                "processing all opportunities today"
            );
        } else {
            self.store
                .write(&CarryoverBatch::new(Local::now().date_naive(), to_carryover.clone()))?;
            warn!(
                processing = merged.len(),
                carrying_over = to_carryover.len(),
                cap = self.daily_cap,
                "daily cap reached, overflow carried to next run"
            );
        }

        Ok(DailyLoad {
            from_pending: pending_kept.min(merged.len()),
            to_process: merged,
            to_carryover,
        })
    }

    /// Appends items to the pending batch, keeping existing entries first. Returns the new
    /// pending count.
    pub fn defer(&self, items: Vec<Opportunity>) -> Result<usize, AppError> {
        if items.is_empty() {
            return Ok(self.store.read()?.map(|b| b.items.len()).unwrap_or(0));
        }
        let mut pending = self.load_pending()?;
        let mut seen: HashSet<String> = pending.iter().map(|o| o.id.clone()).collect();
        let before = pending.len();
        pending.extend(items.into_iter().filter(|o| seen.insert(o.id.clone())));

        let count = pending.len();
        self.store
            .write(&CarryoverBatch::new(Local::now().date_naive(), pending))?;
        info!(added = count - before, pending = count, "deferred opportunities to next run");
        Ok(count)
    }

    pub fn stats(&self) -> Result<CarryoverStats, AppError> {
        let Some(batch) = self.store.read()? else {
            return Ok(CarryoverStats {
                has_carryover: false,
                count: 0,
                date: None,
                oldest_deadline: None,
            });
        };
        let oldest_deadline = batch
            .items
            .iter()
            .filter_map(|o| o.response_deadline.as_deref())
            .filter_map(|d| deadline_date(d).map(|date| (date, d)))
            .min_by_key(|(date, _)| *date)
            .map(|(_, raw)| raw.to_string());

        Ok(CarryoverStats {
            has_carryover: true,
            count: batch.items.len(),
            date: Some(batch.date.to_string()),
            oldest_deadline,
        })
    }
}

fn deadline_date(raw: &str) -> Option<NaiveDate> {
    let prefix = raw.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}
