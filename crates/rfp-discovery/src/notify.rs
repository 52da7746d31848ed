use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::summary::RunSummary;

/// Fire-and-forget delivery of a run summary. Implementations log their own failures.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, summary: &RunSummary);
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl NotificationChannel for NoopNotifier {
    async fn send(&self, summary: &RunSummary) {
        debug!(run_id = %summary.run_id, "notifications disabled");
    }
}

pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn send(&self, summary: &RunSummary) {
        let body = json!({
            "text": headline(summary),
            "blocks": [{
                "type": "section",
                "text": { "type": "mrkdwn", "text": format_summary(summary) }
            }]
        });
        match self.http.post(&self.webhook_url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(run_id = %summary.run_id, "summary notification sent");
            }
            Ok(resp) => {
                warn!(run_id = %summary.run_id, status = %resp.status(), "slack rejected summary");
            }
            Err(e) => {
                warn!(run_id = %summary.run_id, error = %e, "slack notification failed");
            }
        }
    }
}

fn headline(summary: &RunSummary) -> String {
    let status = if summary.partial { " (partial)" } else { "" };
    format!(
        "RFP discovery{status}: {} qualified, {} for review",
        summary.counts.qualified, summary.counts.maybe
    )
}

/// Plain-text digest: tier counts, timing, and up to five top qualified opportunities.
pub fn format_summary(summary: &RunSummary) -> String {
    let c = &summary.counts;
    let mut out = String::new();
    let _ = writeln!(out, "*{}*", headline(summary));
    if let Some(range) = &summary.search_range {
        let _ = writeln!(out, "Search window: {range}");
    }
    let _ = writeln!(
        out,
        "Screened {} (threshold {}): {} rejected by mini, {} qualified, {} maybe, {} rejected, {} errors",
        summary.screened_input,
        summary.screen_threshold,
        c.rejected_by_mini,
        c.qualified,
        c.maybe,
        c.rejected,
        c.errors
    );
    if c.deferred > 0 || summary.carried_over > 0 {
        let _ = writeln!(
            out,
            "Deferred {} awaiting deep analysis; {} carried to the next run",
            c.deferred, summary.carried_over
        );
    }
    let _ = writeln!(out, "Elapsed {:.1}s", summary.timings.total_ms as f64 / 1000.0);
    if let Some(reason) = &summary.failure {
        let _ = writeln!(out, "Stopped early: {reason}");
    }

    if summary.top_qualified.is_empty() {
        out.push_str("_No qualified opportunities this run._");
    } else {
        out.push_str("*Top qualified:*\n");
        for (i, h) in summary.top_qualified.iter().take(5).enumerate() {
            let title: String = h.title.chars().take(60).collect();
            let _ = write!(out, "{}. {} ({}/10) {}", i + 1, title, h.score, h.agency);
            if let Some(link) = &h.link {
                let _ = write!(out, " <{link}|view>");
            }
            out.push('\n');
        }
    }
    out
}
