//! Run sequencing: fetch, daily load management, mini screening, deep analysis, persistence.
//!
//! Every stage writes what it produced into a [`RunAccumulator`] as soon as it finishes. The
//! persist step reads only the accumulator and runs however execution ended: normally, on a
//! systemic failure, on operator interrupt, or after a panic.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use rfp_common::redis::RedisCache;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchDeepAnalyzer, BatchProcessor, BatchScreener, DeepPartition, HaltReason, ScreenPartition};
use crate::breaker::BreakerSnapshot;
use crate::carryover::{FileCarryoverStore, LoadCarryoverManager, PriorityRules};
use crate::config::{CompanyProfile, Config};
use crate::dedup::SeenLedger;
use crate::error::{AppError, PipelineError};
use crate::filter::prefilter;
use crate::model::{Assessed, Opportunity, Outcome, Screened, Thresholds, Tier};
use crate::notify::{NoopNotifier, NotificationChannel, SlackNotifier};
use crate::schedule::{search_range, SearchWindow};
use crate::scoring::Scorers;
use crate::sink::{JsonlSink, QualifiedSink, ResultSink, ReviewSink};
use crate::source::{DateRange, JsonFileSource, OpportunitySource, SourceFilters};
use crate::summary::{millis, new_run_id, Highlight, RunSummary, StageTimings, TierCounts};

pub const LAST_RUN_KEY: &str = "rfp:v1:last_run";
const LAST_RUN_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const TOP_QUALIFIED: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Screening,
    DeepAnalysis,
    Partition,
    Persist,
    Done,
    Aborting,
}

/// One trigger of the pipeline.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub today: NaiveDate,
    pub window: SearchWindow,
    pub filters: SourceFilters,
    /// Skip the keyword pre-filter.
    pub overkill: bool,
    /// Test mode: caps volume and leaves the carryover store and seen ledger untouched.
    pub test_limit: Option<usize>,
}

impl RunRequest {
    pub fn production(today: NaiveDate) -> Self {
        Self {
            today,
            window: SearchWindow::Production,
            filters: SourceFilters::default(),
            overkill: false,
            test_limit: None,
        }
    }

    pub fn test(today: NaiveDate, max: usize) -> Self {
        Self {
            today,
            window: SearchWindow::Test,
            filters: SourceFilters::default(),
            overkill: false,
            test_limit: Some(max.max(1)),
        }
    }

    pub fn is_test(&self) -> bool {
        self.test_limit.is_some()
    }

    fn mode(&self) -> &'static str {
        match (self.test_limit, self.window) {
            (Some(_), _) => "test",
            (None, SearchWindow::DaysBack(_)) => "manual",
            (None, _) => "production",
        }
    }
}

/// Output collaborators and the opportunity feed.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn OpportunitySource>,
    pub results: Arc<dyn ResultSink>,
    pub qualified: Arc<dyn QualifiedSink>,
    pub review: Arc<dyn ReviewSink>,
    pub notifier: Arc<dyn NotificationChannel>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Self {
        let notifier: Arc<dyn NotificationChannel> = match &config.slack_webhook_url {
            Some(url) => Arc::new(SlackNotifier::new(url.clone())),
            None => Arc::new(NoopNotifier),
        };
        Self {
            source: Arc::new(JsonFileSource::new(config.inbound_path())),
            results: Arc::new(JsonlSink::new(config.results_path())),
            qualified: Arc::new(JsonlSink::new(config.qualified_path())),
            review: Arc::new(JsonlSink::new(config.review_path())),
            notifier,
        }
    }
}

/// Source of truth for the persist step.
#[derive(Debug)]
struct RunAccumulator {
    stage: Stage,
    search_range: Option<DateRange>,
    fetched: usize,
    prefiltered_out: usize,
    already_seen: usize,
    from_carryover: usize,
    screened_input: usize,
    threshold: u8,
    /// Admitted for this run but not screened (yet).
    unscreened: Vec<Opportunity>,
    rejected_by_mini: Vec<Screened>,
    /// Mini survivors, high-priority first.
    candidates: Vec<Screened>,
    deep: DeepPartition,
    timings: StageTimings,
    failure: Option<PipelineError>,
}

impl RunAccumulator {
    fn new(threshold: u8) -> Self {
        Self {
            stage: Stage::Init,
            search_range: None,
            fetched: 0,
            prefiltered_out: 0,
            already_seen: 0,
            from_carryover: 0,
            screened_input: 0,
            threshold,
            unscreened: Vec::new(),
            rejected_by_mini: Vec::new(),
            candidates: Vec::new(),
            deep: DeepPartition::default(),
            timings: StageTimings::default(),
            failure: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "stage transition");
        self.stage = stage;
    }

    fn abort(&mut self, err: PipelineError) {
        match &err {
            PipelineError::Interrupted => {
                warn!(stage = ?self.stage, "run interrupted, persisting partial results")
            }
            PipelineError::Systemic(reason) => {
                error!(stage = ?self.stage, reason = %reason, "run failed, persisting partial results")
            }
        }
        self.enter(Stage::Aborting);
        self.failure = Some(err);
    }

    fn deep_results(&self) -> impl Iterator<Item = (Tier, &Assessed)> {
        let d = &self.deep;
        d.qualified
            .iter()
            .map(|a| (Tier::Qualified, a))
            .chain(d.maybe.iter().map(|a| (Tier::Maybe, a)))
            .chain(d.rejected.iter().map(|a| (Tier::Rejected, a)))
    }

    /// Mini survivors that never got a deep result.
    fn deferred(&self) -> Vec<&Screened> {
        let assessed: HashSet<&str> = self
            .deep_results()
            .map(|(_, a)| a.opportunity.id.as_str())
            .collect();
        self.candidates
            .iter()
            .filter(|s| !assessed.contains(s.opportunity.id.as_str()))
            .collect()
    }
}

#[derive(Debug, Default)]
struct PersistReport {
    sink_failures: usize,
    carried_over: usize,
    /// Ids handed to the seen ledger.
    seen: Vec<String>,
}

pub struct PipelineOrchestrator {
    screener: BatchScreener,
    analyzer: BatchDeepAnalyzer,
    carryover: LoadCarryoverManager,
    seen: SeenLedger,
    thresholds: Thresholds,
    io: Collaborators,
    redis: RedisCache,
}

impl PipelineOrchestrator {
    pub fn new(
        screener: BatchScreener,
        analyzer: BatchDeepAnalyzer,
        carryover: LoadCarryoverManager,
        seen: SeenLedger,
        thresholds: Thresholds,
        io: Collaborators,
        redis: RedisCache,
    ) -> Self {
        Self {
            screener,
            analyzer,
            carryover,
            seen,
            thresholds,
            io,
            redis,
        }
    }

    pub fn from_config(
        config: &Config,
        profile: &CompanyProfile,
        scorers: &Scorers,
        redis: RedisCache,
    ) -> Result<Self, AppError> {
        let screener = BatchScreener::new(
            BatchProcessor::new(Arc::clone(&scorers.mini), config.mini),
            config.thresholds.qualified,
        );
        let analyzer = BatchDeepAnalyzer::new(
            BatchProcessor::new(Arc::clone(&scorers.deep), config.deep),
            config.thresholds,
        );
        let carryover = LoadCarryoverManager::new(
            Arc::new(FileCarryoverStore::new(config.carryover_path())),
            config.max_daily,
            PriorityRules::from_profile(profile)?,
            config.thresholds.screen,
        );
        Ok(Self::new(
            screener,
            analyzer,
            carryover,
            SeenLedger::new(redis.clone()),
            config.thresholds,
            Collaborators::from_config(config),
            redis,
        ))
    }

    /// Runs the pipeline and always persists what was gathered. Never fails: early termination
    /// is reported through `partial` and `failure` on the summary.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> RunSummary {
        let started = Instant::now();
        let started_at = Utc::now().to_rfc3339();
        let run_id = new_run_id();
        info!(run_id = %run_id, mode = request.mode(), "pipeline run starting");

        let mut acc = RunAccumulator::new(self.thresholds.screen);
        let executed = AssertUnwindSafe(self.execute(&mut acc, request, cancel))
            .catch_unwind()
            .await;
        match executed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => acc.abort(err),
            Err(panic) => acc.abort(PipelineError::Systemic(format!(
                "pipeline panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }

        acc.enter(Stage::Persist);
        let persist_started = Instant::now();
        let report = self.persist(&acc, request).await;
        acc.timings.persist_ms = millis(persist_started.elapsed());
        acc.timings.total_ms = millis(started.elapsed());

        let breakers = std::iter::once(self.screener.scorer().breaker_snapshot())
            .chain(self.analyzer.scorer().breaker_snapshots())
            .collect();
        let summary = summarize(&acc, request, run_id, started_at, &report, breakers);
        acc.enter(Stage::Done);
        info!(
            run_id = %summary.run_id,
            partial = summary.partial,
            rejected_by_mini = summary.counts.rejected_by_mini,
            qualified = summary.counts.qualified,
            maybe = summary.counts.maybe,
            rejected = summary.counts.rejected,
            deferred = summary.counts.deferred,
            errors = summary.counts.errors,
            carried_over = summary.carried_over,
            total_ms = summary.timings.total_ms,
            "pipeline run finished"
        );

        self.io.notifier.send(&summary).await;
        self.store_last_run(&summary).await;
        summary
    }

    async fn execute(
        &self,
        acc: &mut RunAccumulator,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let fetch_started = Instant::now();
        let range = search_range(request.today, request.window);
        let fetched = match &range {
            Some(range) => self.io.source.fetch(&request.filters, range).await?,
            None => {
                info!(today = %request.today, "no search window today, draining carryover only");
                Vec::new()
            }
        };
        acc.search_range = range;
        acc.fetched = fetched.len();

        let kept = if request.overkill {
            fetched
        } else {
            let outcome = prefilter(fetched);
            acc.prefiltered_out = outcome.dropped;
            outcome.kept
        };
        let (unseen, already_seen) = self.seen.filter_unseen(kept).await;
        acc.already_seen = already_seen;

        let to_screen = match request.test_limit {
            Some(max) => {
                let mut items = unseen;
                items.truncate(max);
                items
            }
            None => {
                let load = self.carryover.manage_daily_load(unseen)?;
                acc.from_carryover = load.from_pending;
                load.to_process
            }
        };
        acc.timings.fetch_ms = millis(fetch_started.elapsed());
        acc.screened_input = to_screen.len();
        if !request.is_test() {
            acc.threshold = self.carryover.adaptive_threshold(to_screen.len());
        }
        acc.unscreened = to_screen;
        info!(
            fetched = acc.fetched,
            prefiltered_out = acc.prefiltered_out,
            already_seen = acc.already_seen,
            from_carryover = acc.from_carryover,
            to_screen = acc.screened_input,
            threshold = acc.threshold,
            "inputs prepared"
        );

        if cancel.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        if acc.unscreened.is_empty() {
            acc.enter(Stage::Partition);
            return Ok(());
        }

        acc.enter(Stage::Screening);
        let screen = self
            .screener
            .process_batch(acc.unscreened.clone(), acc.threshold, cancel)
            .await;
        acc.timings.screening_ms = millis(screen.elapsed);
        acc.unscreened = screen.unprocessed;
        let ScreenPartition {
            high,
            maybe,
            rejected,
        } = screen.partition;
        acc.rejected_by_mini = rejected;
        acc.candidates = high.into_iter().chain(maybe).collect();
        if let Some(reason) = screen.halted {
            return Err(halt_error(reason));
        }

        acc.enter(Stage::DeepAnalysis);
        let deep_input: Vec<Opportunity> = acc
            .candidates
            .iter()
            .map(|s| s.opportunity.clone())
            .collect();
        if !deep_input.is_empty() {
            let deep = self.analyzer.process_batch(deep_input, cancel).await;
            acc.timings.deep_ms = millis(deep.elapsed);
            acc.deep = deep.partition;
            if let Some(reason) = deep.halted {
                return Err(halt_error(reason));
            }
        }

        acc.enter(Stage::Partition);
        Ok(())
    }

    async fn persist(&self, acc: &RunAccumulator, request: &RunRequest) -> PersistReport {
        let mut report = PersistReport::default();
        // Error results stay out of the seen ledger so a later run scores them again.
        let mut settled: Vec<String> = Vec::new();

        for s in &acc.rejected_by_mini {
            let outcome = Outcome::Screen(s.result.clone());
            if self.record(&s.opportunity, &outcome, Tier::RejectedByMini, &mut report).await
                && !outcome.is_error()
            {
                settled.push(s.opportunity.id.clone());
            }
        }
        for (tier, a) in acc.deep_results() {
            let outcome = Outcome::Assessment(a.result.clone());
            if self.record(&a.opportunity, &outcome, tier, &mut report).await && !outcome.is_error() {
                settled.push(a.opportunity.id.clone());
            }
        }
        let deferred = acc.deferred();
        for s in &deferred {
            let outcome = Outcome::Screen(s.result.clone());
            self.record(&s.opportunity, &outcome, Tier::Deferred, &mut report)
                .await;
        }

        for a in &acc.deep.qualified {
            let outcome = Outcome::Assessment(a.result.clone());
            if let Err(e) = self.io.qualified.append(&a.opportunity, &outcome).await {
                warn!(id = %a.opportunity.id, error = %e, "qualified sink rejected record");
                report.sink_failures += 1;
            }
        }
        for a in &acc.deep.maybe {
            let outcome = Outcome::Assessment(a.result.clone());
            if let Err(e) = self.io.review.append(&a.opportunity, &outcome).await {
                warn!(id = %a.opportunity.id, error = %e, "review sink rejected record");
                report.sink_failures += 1;
            }
        }

        if request.is_test() {
            report.carried_over = self.carryover.stats().map(|s| s.count).unwrap_or(0);
            return report;
        }

        self.seen.mark_seen(&settled).await;
        report.seen = settled;
        let leftovers: Vec<Opportunity> = acc
            .unscreened
            .iter()
            .cloned()
            .chain(deferred.iter().map(|s| s.opportunity.clone()))
            .collect();
        match self.carryover.defer(leftovers) {
            Ok(pending) => report.carried_over = pending,
            Err(e) => {
                error!(error = %e, "could not write unfinished opportunities to carryover");
                report.sink_failures += 1;
            }
        }
        report
    }

    /// Failures are logged and counted; the persist loop always continues.
    async fn record(
        &self,
        opp: &Opportunity,
        outcome: &Outcome,
        tier: Tier,
        report: &mut PersistReport,
    ) -> bool {
        match self.io.results.append(opp, outcome, tier).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %opp.id, tier = tier.as_str(), error = %e, "result sink rejected record");
                report.sink_failures += 1;
                false
            }
        }
    }

    async fn store_last_run(&self, summary: &RunSummary) {
        let Ok(raw) = serde_json::to_string(summary) else {
            return;
        };
        if !self.redis.set_with_ttl(LAST_RUN_KEY, &raw, LAST_RUN_TTL_SECS).await {
            debug!("last run summary not stored");
        }
    }
}

fn halt_error(reason: HaltReason) -> PipelineError {
    match reason {
        HaltReason::Cancelled => PipelineError::Interrupted,
        HaltReason::CircuitOpen(name) => {
            PipelineError::Systemic(format!("circuit open for {name}, scoring backend unavailable"))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn summarize(
    acc: &RunAccumulator,
    request: &RunRequest,
    run_id: String,
    started_at: String,
    report: &PersistReport,
    breakers: Vec<BreakerSnapshot>,
) -> RunSummary {
    let deep_scores: Vec<u8> = acc
        .deep_results()
        .filter(|(_, a)| !a.result.error)
        .map(|(_, a)| a.result.score)
        .collect();
    let avg_deep_score = (!deep_scores.is_empty()).then(|| {
        deep_scores.iter().map(|s| f64::from(*s)).sum::<f64>() / deep_scores.len() as f64
    });

    let errors = acc.rejected_by_mini.iter().filter(|s| s.result.error).count()
        + acc.deep_results().filter(|(_, a)| a.result.error).count();

    let mut top: Vec<&Assessed> = acc.deep.qualified.iter().collect();
    top.sort_by(|a, b| b.result.score.cmp(&a.result.score));
    let top_qualified = top
        .into_iter()
        .take(TOP_QUALIFIED)
        .map(|a| Highlight {
            id: a.opportunity.id.clone(),
            title: a.opportunity.title.clone(),
            agency: a.opportunity.agency.clone(),
            score: a.result.score,
            link: a.opportunity.link.clone(),
        })
        .collect();

    RunSummary {
        run_id,
        started_at,
        mode: request.mode().to_string(),
        search_range: acc.search_range.map(|r| r.to_string()),
        fetched: acc.fetched,
        prefiltered_out: acc.prefiltered_out,
        already_seen: acc.already_seen,
        from_carryover: acc.from_carryover,
        screened_input: acc.screened_input,
        screen_threshold: acc.threshold,
        counts: TierCounts {
            rejected_by_mini: acc.rejected_by_mini.len(),
            qualified: acc.deep.qualified.len(),
            maybe: acc.deep.maybe.len(),
            rejected: acc.deep.rejected.len(),
            deferred: acc.deferred().len(),
            errors,
        },
        carried_over: report.carried_over,
        avg_deep_score,
        timings: acc.timings.clone(),
        partial: acc.failure.is_some(),
        failure: acc.failure.as_ref().map(|e| e.to_string()),
        sink_failures: report.sink_failures,
        marked_seen: report.seen.len(),
        top_qualified,
        breakers,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::carryover::CarryoverStore;
    use crate::testing::{
        deep_scorer, mini_scorer, opportunities, tier_config, MemoryCarryoverStore, MemorySink,
        MemorySource, Reply, ScriptedBackend,
    };

    struct Harness {
        orchestrator: PipelineOrchestrator,
        results: Arc<MemorySink>,
        qualified: Arc<MemorySink>,
        review: Arc<MemorySink>,
        store: Arc<MemoryCarryoverStore>,
    }

    fn harness(
        items: Vec<Opportunity>,
        mini: Arc<ScriptedBackend>,
        deep: Arc<ScriptedBackend>,
        deep_breaker_threshold: u32,
        results: MemorySink,
    ) -> Harness {
        harness_with_fallback(items, mini, deep, None, deep_breaker_threshold, results)
    }

    fn harness_with_fallback(
        items: Vec<Opportunity>,
        mini: Arc<ScriptedBackend>,
        deep: Arc<ScriptedBackend>,
        fallback: Option<Arc<ScriptedBackend>>,
        deep_breaker_threshold: u32,
        results: MemorySink,
    ) -> Harness {
        let results = Arc::new(results);
        let qualified = Arc::new(MemorySink::default());
        let review = Arc::new(MemorySink::default());
        let store = Arc::new(MemoryCarryoverStore::default());
        let thresholds = Thresholds::default();

        let screener = BatchScreener::new(
            BatchProcessor::new(mini_scorer(mini, 1_000), tier_config(1)),
            thresholds.qualified,
        );
        let analyzer = BatchDeepAnalyzer::new(
            BatchProcessor::new(deep_scorer(deep, fallback, deep_breaker_threshold), tier_config(4)),
            thresholds,
        );
        let carryover = LoadCarryoverManager::new(
            store.clone(),
            1_000,
            PriorityRules::from_profile(&CompanyProfile::default()).unwrap(),
            thresholds.screen,
        );
        let io = Collaborators {
            source: Arc::new(MemorySource { items }),
            results: results.clone(),
            qualified: qualified.clone(),
            review: review.clone(),
            notifier: Arc::new(NoopNotifier),
        };
        Harness {
            orchestrator: PipelineOrchestrator::new(
                screener,
                analyzer,
                carryover,
                SeenLedger::new(RedisCache::disabled()),
                thresholds,
                io,
                RedisCache::disabled(),
            ),
            results,
            qualified,
            review,
            store,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            window: SearchWindow::DaysBack(1),
            ..RunRequest::production(NaiveDate::from_ymd_opt(2025, 8, 13).unwrap())
        }
    }

    fn scenario_mini() -> ScriptedBackend {
        let mut mini = ScriptedBackend::new("mini");
        for i in 0..50u8 {
            let score = match i {
                0..=9 => 1 + i % 3,
                10..=29 => 4 + i % 3,
                _ => 7 + i % 4,
            };
            mini = mini.with(&format!("rfp-{i}"), Reply::Score(score));
        }
        mini
    }

    /// Deep replies for the fifty-item run: 40..49 score 9, 10..14 fail, the rest score 6.
    fn scenario_deep(model: &str, failure: Reply) -> ScriptedBackend {
        let mut deep = ScriptedBackend::new(model).default_reply(Reply::Score(6));
        for i in 40..50 {
            deep = deep.with(&format!("rfp-{i}"), Reply::Score(9));
        }
        for i in 10..15 {
            deep = deep.with(&format!("rfp-{i}"), failure.clone());
        }
        deep
    }

    #[tokio::test]
    async fn fifty_item_run_partitions_every_item_once() {
        let primary = Arc::new(scenario_deep("deep", Reply::Permanent));
        let fallback = Arc::new(scenario_deep("fallback", Reply::Raw("model unavailable".into())));
        let h = harness_with_fallback(
            opportunities(50),
            Arc::new(scenario_mini()),
            primary.clone(),
            Some(fallback.clone()),
            CircuitBreakerConfig::default().failure_threshold,
            MemorySink::default(),
        );

        let summary = h.orchestrator.run(&request(), &CancellationToken::new()).await;

        assert!(!summary.partial, "{:?}", summary.failure);
        assert_eq!(summary.screen_threshold, 4);
        assert_eq!(summary.counts.rejected_by_mini, 10);
        assert_eq!(summary.counts.qualified, 10);
        assert_eq!(summary.counts.maybe, 25);
        assert_eq!(summary.counts.rejected, 5);
        assert_eq!(summary.counts.deferred, 0);
        assert_eq!(summary.counts.errors, 5);
        assert_eq!(
            summary.counts.qualified + summary.counts.maybe + summary.counts.rejected,
            40
        );
        assert_eq!(summary.counts.evaluated(), 50);
        for i in 10..15 {
            let id = format!("rfp-{i}");
            assert_eq!(fallback.calls_for(&id), 2, "{id} gets one relaxed retry on the fallback");
        }

        let tiers = h.results.tiers();
        assert_eq!(h.results.ids().len(), 50);
        assert_eq!(tiers.len(), 50);
        for i in 10..15 {
            assert_eq!(tiers[&format!("rfp-{i}")], Tier::Rejected);
        }
        let errors: Vec<_> = h.results.records.lock().unwrap().iter().filter(|r| r.3).map(|r| r.1).collect();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().all(|t| *t == Tier::Rejected));

        assert_eq!(h.qualified.ids().len(), 10);
        assert_eq!(h.review.ids().len(), 25);
        assert_eq!(summary.top_qualified.len(), 5);
        assert!(summary.top_qualified.iter().all(|q| q.score == 9));
        assert_eq!(summary.carried_over, 0);
        assert!(h.store.read().unwrap().is_none());
        assert_eq!(summary.marked_seen, 45);
    }

    #[tokio::test]
    async fn error_results_are_not_marked_seen() {
        let mini = Arc::new(
            ScriptedBackend::new("mini")
                .default_reply(Reply::Score(8))
                .with("rfp-0", Reply::Permanent)
                .with("rfp-1", Reply::Score(2)),
        );
        let deep = Arc::new(
            ScriptedBackend::new("deep")
                .default_reply(Reply::Score(8))
                .with("rfp-2", Reply::Permanent),
        );
        let h = harness(opportunities(4), mini, deep, 1_000, MemorySink::default());

        let mut acc = RunAccumulator::new(Thresholds::default().screen);
        h.orchestrator
            .execute(&mut acc, &request(), &CancellationToken::new())
            .await
            .unwrap();
        let report = h.orchestrator.persist(&acc, &request()).await;

        let mut seen = report.seen.clone();
        seen.sort();
        assert_eq!(seen, vec!["rfp-1", "rfp-3"]);
        assert_eq!(h.results.ids().len(), 4);
    }

    #[tokio::test]
    async fn interrupt_persists_every_completed_result() {
        let cancel = CancellationToken::new();
        let mini = Arc::new(
            ScriptedBackend::new("mini")
                .default_reply(Reply::Score(8))
                .with_delay(Duration::from_millis(5))
                .cancel_after(4, cancel.clone()),
        );
        let deep = Arc::new(ScriptedBackend::new("deep"));
        let h = harness(opportunities(20), mini.clone(), deep.clone(), 1_000, MemorySink::default());

        let summary = h.orchestrator.run(&request(), &cancel).await;

        assert!(summary.partial);
        assert_eq!(summary.failure.as_deref(), Some("run interrupted by operator"));
        let completed = mini.total_calls();
        assert!(completed >= 4 && completed < 20);
        assert_eq!(deep.total_calls(), 0);

        let tiers = h.results.tiers();
        assert_eq!(tiers.len(), completed);
        assert!(tiers.values().all(|t| *t == Tier::Deferred));
        assert_eq!(summary.counts.deferred, completed);

        let pending = h.store.read().unwrap().unwrap();
        let pending_ids: HashSet<_> = pending.items.iter().map(|o| o.id.clone()).collect();
        assert_eq!(pending_ids.len(), 20);
        assert_eq!(summary.carried_over, 20);
    }

    #[tokio::test]
    async fn open_deep_circuit_defers_remaining_candidates() {
        let mini = Arc::new(ScriptedBackend::new("mini").default_reply(Reply::Score(8)));
        let deep = Arc::new(ScriptedBackend::new("deep").default_reply(Reply::Permanent));
        let h = harness(opportunities(10), mini, deep.clone(), 2, MemorySink::default());

        let summary = h.orchestrator.run(&request(), &CancellationToken::new()).await;

        assert!(summary.partial);
        assert!(summary.failure.unwrap().contains("circuit open"));
        assert_eq!(summary.counts.rejected, deep.total_calls());
        assert_eq!(summary.counts.rejected + summary.counts.deferred, 10);
        assert_eq!(h.results.ids().len(), 10);

        let pending = h.store.read().unwrap().unwrap();
        assert_eq!(pending.items.len(), summary.counts.deferred);
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_persistence() {
        let mini = Arc::new(
            ScriptedBackend::new("mini")
                .default_reply(Reply::Score(2))
                .with("rfp-0", Reply::Score(9)),
        );
        let deep = Arc::new(ScriptedBackend::new("deep").default_reply(Reply::Score(8)));
        let h = harness(
            opportunities(6),
            mini,
            deep,
            1_000,
            MemorySink::failing(&["rfp-1", "rfp-3"]),
        );

        let summary = h.orchestrator.run(&request(), &CancellationToken::new()).await;

        assert!(!summary.partial);
        assert_eq!(summary.sink_failures, 2);
        let mut ids = h.results.ids();
        ids.sort();
        assert_eq!(ids, vec!["rfp-0", "rfp-2", "rfp-4", "rfp-5"]);
        assert_eq!(h.qualified.ids(), vec!["rfp-0"]);
    }

    #[tokio::test]
    async fn test_mode_caps_volume_and_leaves_carryover_alone() {
        let mini = Arc::new(ScriptedBackend::new("mini").default_reply(Reply::Score(2)));
        let deep = Arc::new(ScriptedBackend::new("deep"));
        let h = harness(opportunities(30), mini.clone(), deep, 1_000, MemorySink::default());

        let request = RunRequest::test(NaiveDate::from_ymd_opt(2025, 8, 13).unwrap(), 5);
        let summary = h.orchestrator.run(&request, &CancellationToken::new()).await;

        assert_eq!(summary.mode, "test");
        assert_eq!(summary.screened_input, 5);
        assert_eq!(mini.total_calls(), 5);
        assert_eq!(h.store.writes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_carryover_is_screened_before_new_items() {
        let mini = Arc::new(ScriptedBackend::new("mini").default_reply(Reply::Score(1)));
        let deep = Arc::new(ScriptedBackend::new("deep"));
        let h = harness(opportunities(3), mini, deep, 1_000, MemorySink::default());
        h.store
            .write(&crate::carryover::CarryoverBatch::new(
                NaiveDate::from_ymd_opt(2025, 8, 12).unwrap(),
                vec![crate::testing::opportunity("old-1")],
            ))
            .unwrap();

        let summary = h.orchestrator.run(&request(), &CancellationToken::new()).await;

        assert_eq!(summary.from_carryover, 1);
        assert_eq!(summary.screened_input, 4);
        let by_tier: HashMap<_, _> = h.results.tiers();
        assert_eq!(by_tier["old-1"], Tier::RejectedByMini);
        assert!(h.store.read().unwrap().is_none());
    }
}
