use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use rfp_common::redis::RedisCache;
use rfp_common::usage::{UsageStats, UsageTracker};

use crate::carryover::{CarryoverStats, LoadCarryoverManager};
use crate::model::{AssessmentResult, Opportunity, ScreenResult};
use crate::orchestrator::LAST_RUN_KEY;
use crate::scoring::{Scorer, Scorers};
use crate::summary::RunSummary;

#[derive(Clone)]
pub struct DiscoveryServer {
    scorers: Scorers,
    carryover: Arc<LoadCarryoverManager>,
    usage: UsageTracker,
    redis: RedisCache,
    tool_router: ToolRouter<DiscoveryServer>,
}

impl DiscoveryServer {
    pub fn new(
        scorers: Scorers,
        carryover: Arc<LoadCarryoverManager>,
        usage: UsageTracker,
        redis: RedisCache,
    ) -> Self {
        Self {
            scorers,
            carryover,
            usage,
            redis,
            tool_router: Self::tool_router(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct OpportunityParams {
    opportunity: Opportunity,
}

impl OpportunityParams {
    fn validated(self) -> Result<Opportunity, String> {
        let opp = self.opportunity;
        if opp.id.trim().is_empty() {
            return Err("opportunity.id must not be empty".to_string());
        }
        if opp.title.trim().is_empty() && opp.description.trim().is_empty() {
            return Err("opportunity needs a title or a description".to_string());
        }
        Ok(opp)
    }
}

#[derive(Debug, Serialize, JsonSchema)]
struct LastRunResponse {
    found: bool,
    summary: Option<RunSummary>,
}

#[tool_router]
impl DiscoveryServer {
    #[tool(description = "Run the fast relevance screen on one opportunity. Returns a 1-10 score and a one-line reason; error=true marks a failed evaluation.")]
    async fn screen_opportunity(
        &self,
        Parameters(params): Parameters<OpportunityParams>,
    ) -> Result<Json<ScreenResult>, String> {
        let opp = params.validated()?;
        let result = self
            .scorers
            .mini
            .score(&opp)
            .await
            .map_err(|e| format!("screening unavailable: {e}"))?;
        Ok(Json(result))
    }

    #[tool(description = "Run the full qualification assessment on one opportunity. Returns score, justification, key requirements and a suggested approach.")]
    async fn assess_opportunity(
        &self,
        Parameters(params): Parameters<OpportunityParams>,
    ) -> Result<Json<AssessmentResult>, String> {
        let opp = params.validated()?;
        let result = self
            .scorers
            .deep
            .score(&opp)
            .await
            .map_err(|e| format!("assessment unavailable: {e}"))?;
        Ok(Json(result))
    }

    #[tool(description = "Report the opportunities deferred to the next run by the daily cap or by an early stop.")]
    async fn carryover_status(&self) -> Result<Json<CarryoverStats>, String> {
        let stats = self
            .carryover
            .stats()
            .map_err(|e| format!("carryover_status failed: {e}"))?;
        Ok(Json(stats))
    }

    #[tool(description = "Get scoring usage aggregated per model (requests, failures and tokens when reported by upstream).")]
    async fn get_usage_stats(&self) -> Result<Json<UsageStats>, String> {
        let stats = self.usage.get_usage_stats().await;
        Ok(Json(stats))
    }

    #[tool(description = "Get the summary of the most recent pipeline run (kept for 7 days when Redis is configured).")]
    async fn last_run(&self) -> Result<Json<LastRunResponse>, String> {
        let summary = match self.redis.get(LAST_RUN_KEY).await {
            Some(raw) => Some(
                serde_json::from_str::<RunSummary>(&raw)
                    .map_err(|e| format!("stored run summary is unreadable: {e}"))?,
            ),
            None => None,
        };
        Ok(Json(LastRunResponse {
            found: summary.is_some(),
            summary,
        }))
    }
}

#[tool_handler]
impl ServerHandler for DiscoveryServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "rfp-discovery".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "RFP screening MCP server. Use screen_opportunity for a quick relevance score and \
assess_opportunity for a full qualification review of a single opportunity. carryover_status, \
last_run and get_usage_stats report pipeline state."
                    .to_string(),
            ),
        }
    }
}
