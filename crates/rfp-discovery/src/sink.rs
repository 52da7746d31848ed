use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::model::{Opportunity, Outcome, Tier};

/// Full audit trail: every evaluated opportunity, whatever its tier.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome, tier: Tier) -> Result<(), AppError>;
}

/// Qualified opportunities only. Called after the result sink has the record.
#[async_trait]
pub trait QualifiedSink: Send + Sync {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome) -> Result<(), AppError>;
}

/// Maybe-tier opportunities awaiting human review.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome) -> Result<(), AppError>;
}

#[derive(Serialize)]
struct Record<'a> {
    recorded_at: String,
    tier: Tier,
    opportunity: &'a Opportunity,
    outcome: &'a Outcome,
}

/// Appends one JSON object per line. Writers are serialized so lines never interleave.
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, opp: &Opportunity, outcome: &Outcome, tier: Tier) -> Result<(), AppError> {
        let mut line = serde_json::to_string(&Record {
            recorded_at: Utc::now().to_rfc3339(),
            tier,
            opportunity: opp,
            outcome,
        })?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome, tier: Tier) -> Result<(), AppError> {
        self.write(opp, outcome, tier).await
    }
}

#[async_trait]
impl QualifiedSink for JsonlSink {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome) -> Result<(), AppError> {
        self.write(opp, outcome, Tier::Qualified).await
    }
}

#[async_trait]
impl ReviewSink for JsonlSink {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome) -> Result<(), AppError> {
        self.write(opp, outcome, Tier::Maybe).await
    }
}
