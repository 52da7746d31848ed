use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::AppError;
use crate::model::Opportunity;

/// Inclusive posted-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn single(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}..{}", self.from, self.to)
        }
    }
}

/// Source-side narrowing. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default)]
pub struct SourceFilters {
    pub naics_prefixes: Vec<String>,
}

impl SourceFilters {
    fn admits(&self, opp: &Opportunity) -> bool {
        if self.naics_prefixes.is_empty() {
            return true;
        }
        let naics = opp.naics_code.as_deref().unwrap_or_default();
        self.naics_prefixes.iter().any(|p| naics.starts_with(p.as_str()))
    }
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    /// Every returned item must carry a stable, non-empty `id`.
    async fn fetch(
        &self,
        filters: &SourceFilters,
        range: &DateRange,
    ) -> Result<Vec<Opportunity>, AppError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InboundFile {
    List(Vec<Opportunity>),
    Search {
        #[serde(rename = "opportunitiesData")]
        opportunities_data: Vec<Opportunity>,
    },
}

/// Reads a JSON export: either a bare list of opportunities or a search response with
/// `opportunitiesData`. Items without a parseable posted date are kept regardless of range.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OpportunitySource for JsonFileSource {
    async fn fetch(
        &self,
        filters: &SourceFilters,
        range: &DateRange,
    ) -> Result<Vec<Opportunity>, AppError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "inbound file not found, nothing to fetch");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(AppError::Source(format!("{}: {e}", self.path.display())));
            }
        };
        let items = match serde_json::from_str::<InboundFile>(&raw)
            .map_err(|e| AppError::Source(format!("{}: {e}", self.path.display())))?
        {
            InboundFile::List(items) => items,
            InboundFile::Search { opportunities_data } => opportunities_data,
        };

        let total = items.len();
        let fetched: Vec<Opportunity> = items
            .into_iter()
            .filter(|o| filters.admits(o))
            .filter(|o| match posted_on(o) {
                Some(day) => range.contains(day),
                None => true,
            })
            .collect();
        info!(
            path = %self.path.display(),
            range = %range,
            total,
            fetched = fetched.len(),
            "fetched opportunities"
        );
        Ok(fetched)
    }
}

fn posted_on(opp: &Opportunity) -> Option<NaiveDate> {
    let raw = opp.posted_date.as_deref()?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}
