//! Scripted collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, Constraints, Prompt, ScoringBackend};
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::carryover::{CarryoverBatch, CarryoverStore};
use crate::config::{CompanyProfile, TierConfig};
use crate::error::AppError;
use crate::model::{Opportunity, Outcome, Thresholds, Tier};
use crate::prompt::EvaluationContext;
use crate::retry::RetryPolicy;
use crate::scoring::{DeepScorer, MiniScorer, ResilientCall};
use crate::sink::{QualifiedSink, ResultSink, ReviewSink};
use crate::source::{DateRange, OpportunitySource, SourceFilters};

pub fn opportunity(id: &str) -> Opportunity {
    Opportunity {
        id: id.to_string(),
        title: format!("Opportunity {id}"),
        agency: "GENERAL SERVICES ADMINISTRATION".to_string(),
        notice_type: "Solicitation".to_string(),
        naics_code: None,
        classification_code: None,
        description: "Modernize a legacy records system.".to_string(),
        posted_date: None,
        response_deadline: None,
        link: None,
    }
}

pub fn opportunities(n: usize) -> Vec<Opportunity> {
    (0..n).map(|i| opportunity(&format!("rfp-{i}"))).collect()
}

#[derive(Debug, Clone)]
pub enum Reply {
    Score(u8),
    Raw(String),
    Empty,
    Transient,
    RateLimited,
    Permanent,
    Hang,
    /// First attempt for the id hangs past the call timeout; later attempts score.
    SlowFirst(u8),
}

/// Backend whose reply is chosen by the `Notice ID` line of the prompt.
pub struct ScriptedBackend {
    model: String,
    replies: HashMap<String, Reply>,
    default: Reply,
    delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,
    calls: Mutex<HashMap<String, usize>>,
    structured_calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            replies: HashMap::new(),
            default: Reply::Score(5),
            delay: Duration::ZERO,
            cancel_after: None,
            calls: Mutex::new(HashMap::new()),
            structured_calls: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, id: &str, reply: Reply) -> Self {
        self.replies.insert(id.to_string(), reply);
        self
    }

    pub fn default_reply(mut self, reply: Reply) -> Self {
        self.default = reply;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cancels `token` once `n` calls have completed.
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn structured_calls_for(&self, id: &str) -> usize {
        self.structured_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn notice_id(prompt: &Prompt) -> String {
        prompt
            .user
            .lines()
            .find_map(|l| l.strip_prefix("Notice ID: "))
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScoringBackend for ScriptedBackend {
    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &Constraints,
    ) -> Result<String, BackendError> {
        let id = Self::notice_id(prompt);
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if constraints.structured {
            *self.structured_calls.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let reply = match self.replies.get(&id).cloned().unwrap_or_else(|| self.default.clone()) {
            Reply::SlowFirst(score) if attempt > 1 => Reply::Score(score),
            reply => reply,
        };
        let wait = async {
            if matches!(reply, Reply::Hang | Reply::SlowFirst(_)) {
                std::future::pending::<()>().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        };
        let timed_out = tokio::time::timeout(constraints.timeout, wait).await.is_err();
        drop(guard);
        if timed_out {
            return Err(BackendError::Timeout(constraints.timeout));
        }

        let done = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = &self.cancel_after {
            if done >= *n {
                token.cancel();
            }
        }

        match reply {
            Reply::Score(score) => Ok(format!(
                r#"{{"score": {score}, "reason": "scripted", "justification": "scripted score {score}"}}"#
            )),
            Reply::Raw(text) => Ok(text),
            Reply::Empty => Err(BackendError::EmptyResponse),
            Reply::Transient => Err(BackendError::Transient("502 bad gateway".to_string())),
            Reply::RateLimited => Err(BackendError::RateLimited("429".to_string())),
            Reply::Permanent => Err(BackendError::Permanent("400 bad request".to_string())),
            Reply::Hang | Reply::SlowFirst(_) => unreachable!(),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

pub fn resilient(backend: Arc<ScriptedBackend>, breaker_threshold: u32) -> ResilientCall {
    let name = backend.model().to_string();
    ResilientCall::new(
        backend,
        CircuitBreaker::new(
            &name,
            CircuitBreakerConfig {
                failure_threshold: breaker_threshold,
                cooldown: Duration::from_secs(60),
            },
        ),
        fast_retry(),
    )
}

pub fn context() -> Arc<EvaluationContext> {
    Arc::new(EvaluationContext::from_profile(&CompanyProfile::default()))
}

pub fn mini_scorer(backend: Arc<ScriptedBackend>, breaker_threshold: u32) -> Arc<MiniScorer> {
    mini_scorer_with_call_timeout(backend, breaker_threshold, Duration::from_secs(5))
}

pub fn mini_scorer_with_call_timeout(
    backend: Arc<ScriptedBackend>,
    breaker_threshold: u32,
    call_timeout: Duration,
) -> Arc<MiniScorer> {
    Arc::new(MiniScorer::new(
        resilient(backend, breaker_threshold),
        context(),
        call_timeout,
    ))
}

pub fn deep_scorer(
    backend: Arc<ScriptedBackend>,
    fallback: Option<Arc<ScriptedBackend>>,
    breaker_threshold: u32,
) -> Arc<DeepScorer> {
    Arc::new(DeepScorer::new(
        resilient(backend, breaker_threshold),
        fallback.map(|b| resilient(b, breaker_threshold)),
        context(),
        Thresholds::default(),
        Duration::from_secs(5),
    ))
}

pub fn tier_config(max_concurrent: usize) -> TierConfig {
    TierConfig {
        max_concurrent,
        min_interval: Duration::ZERO,
        item_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(5),
    }
}

/// Records every append; ids listed in `fail_ids` are rejected.
#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<Vec<(String, Tier, u8, bool)>>,
    pub fail_ids: Vec<String>,
}

impl MemorySink {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|r| r.0.clone()).collect()
    }

    pub fn tiers(&self) -> HashMap<String, Tier> {
        self.records.lock().unwrap().iter().map(|r| (r.0.clone(), r.1)).collect()
    }

    fn push(&self, opp: &Opportunity, outcome: &Outcome, tier: Tier) -> Result<(), AppError> {
        if self.fail_ids.contains(&opp.id) {
            return Err(AppError::Io(std::io::Error::other("sink rejected record")));
        }
        self.records
            .lock()
            .unwrap()
            .push((opp.id.clone(), tier, outcome.score(), outcome.is_error()));
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome, tier: Tier) -> Result<(), AppError> {
        self.push(opp, outcome, tier)
    }
}

#[async_trait]
impl QualifiedSink for MemorySink {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome) -> Result<(), AppError> {
        self.push(opp, outcome, Tier::Qualified)
    }
}

#[async_trait]
impl ReviewSink for MemorySink {
    async fn append(&self, opp: &Opportunity, outcome: &Outcome) -> Result<(), AppError> {
        self.push(opp, outcome, Tier::Maybe)
    }
}

#[derive(Default)]
pub struct MemoryCarryoverStore {
    pub batch: Mutex<Option<CarryoverBatch>>,
    pub writes: AtomicUsize,
}

impl CarryoverStore for MemoryCarryoverStore {
    fn read(&self) -> Result<Option<CarryoverBatch>, AppError> {
        Ok(self.batch.lock().unwrap().clone())
    }

    fn write(&self, batch: &CarryoverBatch) -> Result<(), AppError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.batch.lock().unwrap() = Some(batch.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AppError> {
        *self.batch.lock().unwrap() = None;
        Ok(())
    }
}

pub struct MemorySource {
    pub items: Vec<Opportunity>,
}

#[async_trait]
impl OpportunitySource for MemorySource {
    async fn fetch(
        &self,
        _filters: &SourceFilters,
        _range: &DateRange,
    ) -> Result<Vec<Opportunity>, AppError> {
        Ok(self.items.clone())
    }
}
