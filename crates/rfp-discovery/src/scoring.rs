//! Scoring clients for the two tiers.
//!
//! Each client turns one opportunity into a result value. Per-item failures (exhausted retries,
//! permanent upstream errors, unparseable replies) come back as error-sentinel results. The only
//! error that leaves this layer is [`CircuitOpen`], which is systemic: no backend of the tier can
//! take the item and further items should not be attempted.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rfp_common::openai::OpenAiClient;
use rfp_common::usage::UsageTracker;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Constraints, OpenAiBackend, Prompt, ScoringBackend};
use crate::breaker::{BreakerError, BreakerSnapshot, CircuitBreaker};
use crate::config::Config;
use crate::error::AppError;
use crate::model::{AssessmentResult, Opportunity, ScreenResult, Thresholds};
use crate::prompt::{self, EvaluationContext, MINI_OUTPUT_TOKENS};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit '{breaker}' is open")]
pub struct CircuitOpen {
    pub breaker: String,
}

/// One tier's scoring function as seen by the batch fan-out.
#[async_trait]
pub trait Scorer: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn tier(&self) -> &'static str;

    async fn score(&self, opp: &Opportunity) -> Result<Self::Output, CircuitOpen>;

    /// Error sentinel for an item that never produced a result (timeout, panic).
    fn failed(&self, opp: &Opportunity, reason: &str) -> Self::Output;

    /// False while every backend of the tier has its circuit open.
    fn accepting_work(&self) -> bool;
}

/// Backend + breaker + retry policy for one model.
#[derive(Clone)]
pub struct ResilientCall {
    backend: Arc<dyn ScoringBackend>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

enum CallFailure {
    Backend(BackendError),
    Unparseable(String),
}

impl CallFailure {
    fn summary(&self) -> String {
        match self {
            CallFailure::Backend(e) => e.to_string(),
            CallFailure::Unparseable(_) => "unparseable response".to_string(),
        }
    }
}

impl ResilientCall {
    pub fn new(backend: Arc<dyn ScoringBackend>, breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self {
            backend,
            breaker,
            retry,
        }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: Constraints,
    ) -> Result<String, BreakerError<BackendError>> {
        let backend = &*self.backend;
        let constraints = &constraints;
        let retry = &self.retry;
        self.breaker
            .call(move || {
                retry.run(
                    backend.model(),
                    move |_| backend.complete(prompt, constraints),
                    BackendError::is_transient,
                )
            })
            .await
    }

    /// Structured call with one relaxed retry when the reply is empty or does not parse.
    async fn parsed<T>(
        &self,
        prompt: &Prompt,
        constraints: Constraints,
        parse: fn(&str) -> Option<T>,
    ) -> Result<Result<T, CallFailure>, CircuitOpen> {
        let first = match self.complete(prompt, constraints).await {
            Ok(raw) => match parse(&raw) {
                Some(parsed) => return Ok(Ok(parsed)),
                None => CallFailure::Unparseable(raw),
            },
            Err(BreakerError::Inner(BackendError::EmptyResponse)) => {
                CallFailure::Backend(BackendError::EmptyResponse)
            }
            Err(BreakerError::Inner(e)) => return Ok(Err(CallFailure::Backend(e))),
            Err(BreakerError::Open { name, .. }) => return Err(CircuitOpen { breaker: name }),
        };

        debug!(model = self.model(), failure = %first.summary(), "retrying without structured output");
        match self.complete(prompt, constraints.relaxed()).await {
            Ok(raw) => Ok(parse(&raw).ok_or(CallFailure::Unparseable(raw))),
            Err(BreakerError::Inner(e)) => Ok(Err(CallFailure::Backend(e))),
            Err(BreakerError::Open { name, .. }) => Err(CircuitOpen { breaker: name }),
        }
    }
}

/// Fast first-pass relevance screen.
pub struct MiniScorer {
    call: ResilientCall,
    ctx: Arc<EvaluationContext>,
    call_timeout: Duration,
}

impl MiniScorer {
    pub fn new(call: ResilientCall, ctx: Arc<EvaluationContext>, call_timeout: Duration) -> Self {
        Self {
            call,
            ctx,
            call_timeout,
        }
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.call.breaker().snapshot()
    }
}

#[async_trait]
impl Scorer for MiniScorer {
    type Output = ScreenResult;

    fn tier(&self) -> &'static str {
        "mini"
    }

    async fn score(&self, opp: &Opportunity) -> Result<ScreenResult, CircuitOpen> {
        let prompt = prompt::mini_prompt(&self.ctx, opp);
        let constraints = Constraints {
            max_output_tokens: MINI_OUTPUT_TOKENS,
            structured: true,
            timeout: self.call_timeout,
        };
        let model = self.call.model();

        Ok(match self.call.parsed(&prompt, constraints, parse_screen).await? {
            Ok((score, reason)) => ScreenResult {
                opportunity_id: opp.id.clone(),
                score,
                reason,
                model: model.to_string(),
                error: false,
            },
            Err(failure) => {
                warn!(id = %opp.id, error = %failure.summary(), "mini screening failed");
                ScreenResult::failed(&opp.id, model, format!("Screening error: {}", failure.summary()))
            }
        })
    }

    fn failed(&self, opp: &Opportunity, reason: &str) -> ScreenResult {
        ScreenResult::failed(&opp.id, self.call.model(), reason)
    }

    fn accepting_work(&self) -> bool {
        self.call.breaker().is_accepting()
    }
}

/// Full assessment with optional fallback model and heuristic recovery.
pub struct DeepScorer {
    primary: ResilientCall,
    fallback: Option<ResilientCall>,
    ctx: Arc<EvaluationContext>,
    thresholds: Thresholds,
    call_timeout: Duration,
}

impl DeepScorer {
    pub fn new(
        primary: ResilientCall,
        fallback: Option<ResilientCall>,
        ctx: Arc<EvaluationContext>,
        thresholds: Thresholds,
        call_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            ctx,
            thresholds,
            call_timeout,
        }
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        std::iter::once(&self.primary)
            .chain(self.fallback.as_ref())
            .map(|c| c.breaker().snapshot())
            .collect()
    }

    fn finish(&self, opp: &Opportunity, raw: RawAssessment, model: &str, degraded: bool) -> AssessmentResult {
        AssessmentResult {
            opportunity_id: opp.id.clone(),
            qualified: self.thresholds.is_qualified(raw.score, false),
            score: raw.score,
            justification: raw.justification,
            key_requirements: raw.key_requirements,
            company_advantages: raw.company_advantages,
            suggested_approach: raw.suggested_approach,
            ai_application: raw.ai_application,
            similar_past_rfps: raw.similar_past_rfps,
            uncertainty_factors: raw.uncertainty_factors,
            model: model.to_string(),
            degraded,
            error: false,
        }
    }

    async fn try_fallback(
        &self,
        opp: &Opportunity,
        prompt: &Prompt,
        constraints: Constraints,
        primary_failure: &CallFailure,
    ) -> AssessmentResult {
        let Some(fallback) = &self.fallback else {
            return AssessmentResult::failed(
                &opp.id,
                self.primary.model(),
                format!("Assessment error: {}", primary_failure.summary()),
            );
        };

        info!(id = %opp.id, model = fallback.model(), "primary failed, trying fallback model");
        match fallback.parsed(prompt, constraints, parse_assessment).await {
            Ok(Ok(raw)) => self.finish(opp, raw, fallback.model(), true),
            Ok(Err(failure)) => AssessmentResult::failed(
                &opp.id,
                fallback.model(),
                format!(
                    "Assessment error: {}; fallback failed: {}",
                    primary_failure.summary(),
                    failure.summary()
                ),
            ),
            Err(open) => AssessmentResult::failed(
                &opp.id,
                self.primary.model(),
                format!(
                    "Assessment error: {}; fallback unavailable: {open}",
                    primary_failure.summary()
                ),
            ),
        }
    }

    /// Primary circuit is open: the fallback model takes the item, or the tier is down.
    async fn bypass_primary(
        &self,
        opp: &Opportunity,
        prompt: &Prompt,
        constraints: Constraints,
        open: CircuitOpen,
    ) -> Result<AssessmentResult, CircuitOpen> {
        let Some(fallback) = &self.fallback else {
            return Err(open);
        };
        debug!(id = %opp.id, model = fallback.model(), "primary circuit open, using fallback model");
        Ok(match fallback.parsed(prompt, constraints, parse_assessment).await? {
            Ok(raw) => self.finish(opp, raw, fallback.model(), true),
            Err(failure) => AssessmentResult::failed(
                &opp.id,
                fallback.model(),
                format!("Assessment error: {open}; fallback failed: {}", failure.summary()),
            ),
        })
    }
}

#[async_trait]
impl Scorer for DeepScorer {
    type Output = AssessmentResult;

    fn tier(&self) -> &'static str {
        "deep"
    }

    async fn score(&self, opp: &Opportunity) -> Result<AssessmentResult, CircuitOpen> {
        let prompt = prompt::deep_prompt(&self.ctx, opp);
        let constraints = Constraints {
            max_output_tokens: prompt::deep_output_tokens(opp),
            structured: true,
            timeout: self.call_timeout,
        };

        let failure = match self.primary.parsed(&prompt, constraints, parse_assessment).await {
            Ok(Ok(raw)) => return Ok(self.finish(opp, raw, self.primary.model(), false)),
            Ok(Err(failure)) => failure,
            Err(open) => return self.bypass_primary(opp, &prompt, constraints, open).await,
        };

        if let CallFailure::Unparseable(text) = &failure {
            if let Some(raw) = extract_heuristic(text) {
                warn!(id = %opp.id, score = raw.score, "using heuristic extraction");
                return Ok(self.finish(opp, raw, self.primary.model(), true));
            }
        }

        if matches!(&failure, CallFailure::Backend(e) if e.is_rate_limited()) {
            warn!(id = %opp.id, "rate limited after retries, no fallback");
            return Ok(AssessmentResult::failed(
                &opp.id,
                self.primary.model(),
                format!("Assessment error: {}", failure.summary()),
            ));
        }

        Ok(self.try_fallback(opp, &prompt, constraints, &failure).await)
    }

    fn failed(&self, opp: &Opportunity, reason: &str) -> AssessmentResult {
        AssessmentResult::failed(&opp.id, self.primary.model(), reason)
    }

    fn accepting_work(&self) -> bool {
        self.primary.breaker().is_accepting()
            || self
                .fallback
                .as_ref()
                .is_some_and(|f| f.breaker().is_accepting())
    }
}

/// Slice from the first `{` to the last `}`; replies are sometimes wrapped in prose or fences.
fn json_slice(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

/// Accepts integers and numeric strings. Fractions are rounded; anything that does not land on
/// 1..=10 is rejected.
fn validate_score(value: &Value) -> Option<u8> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    let rounded = n.round();
    (1.0..=10.0).contains(&rounded).then_some(rounded as u8)
}

#[derive(Deserialize)]
struct ScreenReply {
    score: Value,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_screen(raw: &str) -> Option<(u8, String)> {
    let reply: ScreenReply = serde_json::from_str(json_slice(raw)?).ok()?;
    let score = validate_score(&reply.score)?;
    Some((score, reply.reason.unwrap_or_default()))
}

#[derive(Deserialize)]
struct AssessmentReply {
    #[serde(alias = "score")]
    relevance_score: Value,
    #[serde(default)]
    justification: String,
    #[serde(default)]
    key_requirements: Vec<String>,
    #[serde(default)]
    company_advantages: Vec<String>,
    #[serde(default)]
    suggested_approach: String,
    #[serde(default)]
    ai_application: String,
    #[serde(default)]
    similar_past_rfps: Vec<String>,
    #[serde(default)]
    uncertainty_factors: Vec<String>,
}

struct RawAssessment {
    score: u8,
    justification: String,
    key_requirements: Vec<String>,
    company_advantages: Vec<String>,
    suggested_approach: String,
    ai_application: String,
    similar_past_rfps: Vec<String>,
    uncertainty_factors: Vec<String>,
}

impl RawAssessment {
    fn bare(score: u8, justification: String) -> Self {
        Self {
            score,
            justification,
            key_requirements: Vec::new(),
            company_advantages: Vec::new(),
            suggested_approach: String::new(),
            ai_application: String::new(),
            similar_past_rfps: Vec::new(),
            uncertainty_factors: Vec::new(),
        }
    }
}

fn parse_assessment(raw: &str) -> Option<RawAssessment> {
    let reply: AssessmentReply = serde_json::from_str(json_slice(raw)?).ok()?;
    Some(RawAssessment {
        score: validate_score(&reply.relevance_score)?,
        justification: reply.justification,
        key_requirements: reply.key_requirements,
        company_advantages: reply.company_advantages,
        suggested_approach: reply.suggested_approach,
        ai_application: reply.ai_application,
        similar_past_rfps: reply.similar_past_rfps,
        uncertainty_factors: reply.uncertainty_factors,
    })
}

/// Recovers a score from prose such as "Overall score: 8/10".
fn extract_heuristic(text: &str) -> Option<RawAssessment> {
    static SCORE_RE: OnceLock<Regex> = OnceLock::new();
    let re = SCORE_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:score|rating)\b[^0-9\n]{0,20}(\d{1,2})(?:\s*(?:/|out of)\s*10)?")
            .expect("valid regex")
    });
    let caps = re.captures(text)?;
    let score = validate_score(&Value::String(caps[1].to_string()))?;

    let justification: String = text
        .split('.')
        .take(3)
        .collect::<Vec<_>>()
        .join(".")
        .trim()
        .chars()
        .take(500)
        .collect();
    Some(RawAssessment::bare(score, justification))
}

/// Both tiers wired to the configured chat-completions service. Each model gets its own breaker.
#[derive(Clone)]
pub struct Scorers {
    pub mini: Arc<MiniScorer>,
    pub deep: Arc<DeepScorer>,
}

impl Scorers {
    pub fn from_config(
        config: &Config,
        ctx: Arc<EvaluationContext>,
        usage: UsageTracker,
    ) -> Result<Self, AppError> {
        let client = OpenAiClient::new(config.openai.clone())
            .map_err(|e| AppError::Backend(format!("client setup failed: {e}")))?;
        let call = |model: &str| {
            ResilientCall::new(
                Arc::new(OpenAiBackend::new(client.clone(), model, usage.clone())),
                CircuitBreaker::new(model, config.breaker),
                config.retry,
            )
        };

        let mini = MiniScorer::new(call(&config.mini_model), Arc::clone(&ctx), config.mini.call_timeout);
        let deep = DeepScorer::new(
            call(&config.deep_model),
            config.fallback_model.as_deref().map(call),
            ctx,
            config.thresholds,
            config.deep.call_timeout,
        );
        info!(
            mini = %config.mini_model,
            deep = %config.deep_model,
            fallback = config.fallback_model.as_deref().unwrap_or("none"),
            "scoring clients configured"
        );
        Ok(Self {
            mini: Arc::new(mini),
            deep: Arc::new(deep),
        })
    }
}
