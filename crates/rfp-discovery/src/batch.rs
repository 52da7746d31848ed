//! Bounded fan-out of one scoring tier over a batch.
//!
//! A fixed pool of long-lived workers pulls item indices from a pre-filled queue. Each worker
//! takes a gate permit, scores the item under an outer timeout, and reports `(index, result)`.
//! Results are reassembled by index, so input/result association never depends on completion
//! order. Scheduling stops on cancellation or when the tier's circuit opens; items that were
//! never scored come back as unprocessed.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::TierConfig;
use crate::gate::RateLimitedGate;
use crate::model::{
    Assessed, AssessmentResult, Evaluated, Opportunity, ScreenResult, Screened, Thresholds,
};
use crate::scoring::{DeepScorer, MiniScorer, Scorer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum HaltReason {
    Cancelled,
    CircuitOpen(String),
}

/// Index-aligned results of one fan-out. `None` marks an item that was never scored.
#[derive(Debug)]
pub struct BatchReport<R> {
    pub results: Vec<Option<R>>,
    pub halted: Option<HaltReason>,
    pub elapsed: Duration,
}

impl<R> BatchReport<R> {
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Pairs results back with their inputs; unscored inputs are returned separately.
    pub fn into_evaluated(self, items: Vec<Opportunity>) -> (Vec<Evaluated<R>>, Vec<Opportunity>) {
        let mut evaluated = Vec::with_capacity(items.len());
        let mut unprocessed = Vec::new();
        for (opportunity, result) in items.into_iter().zip(self.results) {
            match result {
                Some(result) => evaluated.push(Evaluated {
                    opportunity,
                    result,
                }),
                None => unprocessed.push(opportunity),
            }
        }
        (evaluated, unprocessed)
    }
}

pub struct BatchProcessor<S: Scorer> {
    scorer: Arc<S>,
    gate: RateLimitedGate,
    item_timeout: Duration,
    progress_every: usize,
}

impl<S: Scorer> BatchProcessor<S> {
    pub fn new(scorer: Arc<S>, tier: TierConfig) -> Self {
        Self {
            scorer,
            gate: RateLimitedGate::new(tier.max_concurrent, tier.min_interval),
            item_timeout: tier.item_timeout,
            progress_every: 50,
        }
    }

    pub fn scorer(&self) -> &Arc<S> {
        &self.scorer
    }

    pub async fn process(
        &self,
        items: &[Opportunity],
        cancel: &CancellationToken,
    ) -> BatchReport<S::Output> {
        let started = Instant::now();
        let total = items.len();
        let mut results: Vec<Option<S::Output>> = vec![None; total];
        if total == 0 {
            return BatchReport {
                results,
                halted: None,
                elapsed: started.elapsed(),
            };
        }

        let items: Arc<Vec<Opportunity>> = Arc::new(items.to_vec());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        for idx in 0..total {
            let _ = queue_tx.send(idx);
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, S::Output)>();
        let stop = cancel.child_token();
        let halt: Arc<StdMutex<Option<HaltReason>>> = Arc::new(StdMutex::new(None));
        let completed = Arc::new(AtomicUsize::new(0));

        let workers = self.gate.max_concurrent().min(total);
        info!(
            tier = self.scorer.tier(),
            total,
            workers,
            min_interval_ms = self.gate.min_interval().as_millis() as u64,
            "batch started"
        );

        let mut join_set = JoinSet::new();
        for _ in 0..workers {
            let worker = Worker {
                scorer: Arc::clone(&self.scorer),
                gate: self.gate.clone(),
                items: Arc::clone(&items),
                queue: Arc::clone(&queue),
                done: done_tx.clone(),
                stop: stop.clone(),
                halt: Arc::clone(&halt),
                completed: Arc::clone(&completed),
                item_timeout: self.item_timeout,
                progress_every: self.progress_every,
                total,
            };
            join_set.spawn(worker.run());
        }
        drop(done_tx);

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(tier = self.scorer.tier(), error = %e, "batch worker aborted");
            }
        }
        while let Ok((idx, result)) = done_rx.try_recv() {
            results[idx] = Some(result);
        }

        let unprocessed = results.iter().filter(|r| r.is_none()).count();
        let halted = if unprocessed == 0 {
            None
        } else if cancel.is_cancelled() {
            Some(HaltReason::Cancelled)
        } else {
            let reason = halt.lock().unwrap_or_else(|p| p.into_inner()).clone();
            Some(reason.unwrap_or_else(|| HaltReason::CircuitOpen("unknown".to_string())))
        };

        let elapsed = started.elapsed();
        info!(
            tier = self.scorer.tier(),
            completed = total - unprocessed,
            unprocessed,
            halted = ?halted,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch finished"
        );
        BatchReport {
            results,
            halted,
            elapsed,
        }
    }
}

struct Worker<S: Scorer> {
    scorer: Arc<S>,
    gate: RateLimitedGate,
    items: Arc<Vec<Opportunity>>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<usize>>>,
    done: mpsc::UnboundedSender<(usize, S::Output)>,
    stop: CancellationToken,
    halt: Arc<StdMutex<Option<HaltReason>>>,
    completed: Arc<AtomicUsize>,
    item_timeout: Duration,
    progress_every: usize,
    total: usize,
}

impl<S: Scorer> Worker<S> {
    fn halt_with(&self, reason: HaltReason) {
        let mut halt = self.halt.lock().unwrap_or_else(|p| p.into_inner());
        if halt.is_none() {
            warn!(tier = self.scorer.tier(), reason = ?reason, "halting batch");
            *halt = Some(reason);
        }
        self.stop.cancel();
    }

    async fn run(self) {
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            if !self.scorer.accepting_work() {
                self.halt_with(HaltReason::CircuitOpen(format!("{} tier", self.scorer.tier())));
                break;
            }

            let Ok(idx) = self.queue.lock().await.try_recv() else {
                break;
            };

            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                permit = self.gate.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let opp = &self.items[idx];
            let scored = AssertUnwindSafe(self.scorer.score(opp)).catch_unwind();
            let result = match tokio::time::timeout(self.item_timeout, scored).await {
                Ok(Ok(Ok(result))) => result,
                Ok(Ok(Err(open))) => {
                    permit.release();
                    self.halt_with(HaltReason::CircuitOpen(open.breaker));
                    break;
                }
                Ok(Err(_)) => {
                    error!(id = %opp.id, tier = self.scorer.tier(), "scoring panicked");
                    self.scorer.failed(opp, "Processing error: scoring panicked")
                }
                Err(_) => {
                    warn!(
                        id = %opp.id,
                        tier = self.scorer.tier(),
                        timeout_secs = self.item_timeout.as_secs_f64(),
                        "item timed out"
                    );
                    self.scorer.failed(opp, "Processing timeout")
                }
            };
            permit.release();

            if self.done.send((idx, result)).is_err() {
                break;
            }
            let n = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
            if n % self.progress_every == 0 || n == self.total {
                info!(
                    tier = self.scorer.tier(),
                    completed = n,
                    total = self.total,
                    in_flight = self.gate.in_flight(),
                    "progress"
                );
            }
        }
    }
}

/// Mini-tier buckets. `high` and `maybe` together are the deep-tier candidates.
#[derive(Debug, Default)]
pub struct ScreenPartition {
    pub high: Vec<Screened>,
    pub maybe: Vec<Screened>,
    pub rejected: Vec<Screened>,
}

impl ScreenPartition {
    pub fn candidate_count(&self) -> usize {
        self.high.len() + self.maybe.len()
    }
}

pub fn partition_screened(items: Vec<Screened>, threshold: u8, high_cutoff: u8) -> ScreenPartition {
    let mut partition = ScreenPartition::default();
    for item in items {
        let score = item.result.score;
        if item.result.error || score < threshold {
            partition.rejected.push(item);
        } else if score >= high_cutoff {
            partition.high.push(item);
        } else {
            partition.maybe.push(item);
        }
    }
    partition
}

#[derive(Debug, Default)]
pub struct DeepPartition {
    pub qualified: Vec<Assessed>,
    pub maybe: Vec<Assessed>,
    pub rejected: Vec<Assessed>,
}

impl DeepPartition {
    pub fn len(&self) -> usize {
        self.qualified.len() + self.maybe.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn partition_assessed(items: Vec<Assessed>, thresholds: &Thresholds) -> DeepPartition {
    let mut partition = DeepPartition::default();
    for item in items {
        match thresholds.deep_tier(&item.result) {
            crate::model::Tier::Qualified => partition.qualified.push(item),
            crate::model::Tier::Maybe => partition.maybe.push(item),
            _ => partition.rejected.push(item),
        }
    }
    partition
}

#[derive(Debug)]
pub struct ScreenOutcome {
    pub partition: ScreenPartition,
    pub unprocessed: Vec<Opportunity>,
    pub halted: Option<HaltReason>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct DeepOutcome {
    pub partition: DeepPartition,
    pub unprocessed: Vec<Opportunity>,
    pub halted: Option<HaltReason>,
    pub elapsed: Duration,
}

/// Mini tier over a whole batch.
pub struct BatchScreener {
    processor: BatchProcessor<MiniScorer>,
    high_cutoff: u8,
}

impl BatchScreener {
    pub fn new(processor: BatchProcessor<MiniScorer>, high_cutoff: u8) -> Self {
        Self {
            processor,
            high_cutoff,
        }
    }

    pub fn scorer(&self) -> &Arc<MiniScorer> {
        self.processor.scorer()
    }

    pub async fn process_batch(
        &self,
        items: Vec<Opportunity>,
        threshold: u8,
        cancel: &CancellationToken,
    ) -> ScreenOutcome {
        let report: BatchReport<ScreenResult> = self.processor.process(&items, cancel).await;
        let halted = report.halted.clone();
        let elapsed = report.elapsed;
        let (screened, unprocessed) = report.into_evaluated(items);
        let partition = partition_screened(screened, threshold, self.high_cutoff.max(threshold));
        info!(
            high = partition.high.len(),
            maybe = partition.maybe.len(),
            candidates = partition.candidate_count(),
            rejected = partition.rejected.len(),
            unprocessed = unprocessed.len(),
            threshold,
            "mini screening partitioned"
        );
        ScreenOutcome {
            partition,
            unprocessed,
            halted,
            elapsed,
        }
    }
}

/// Deep tier over the mini-tier survivors.
pub struct BatchDeepAnalyzer {
    processor: BatchProcessor<DeepScorer>,
    thresholds: Thresholds,
}

impl BatchDeepAnalyzer {
    pub fn new(processor: BatchProcessor<DeepScorer>, thresholds: Thresholds) -> Self {
        Self {
            processor,
            thresholds,
        }
    }

    pub fn scorer(&self) -> &Arc<DeepScorer> {
        self.processor.scorer()
    }

    pub async fn process_batch(
        &self,
        items: Vec<Opportunity>,
        cancel: &CancellationToken,
    ) -> DeepOutcome {
        let report: BatchReport<AssessmentResult> = self.processor.process(&items, cancel).await;
        let halted = report.halted.clone();
        let elapsed = report.elapsed;
        let (assessed, unprocessed) = report.into_evaluated(items);
        let partition = partition_assessed(assessed, &self.thresholds);
        info!(
            qualified = partition.qualified.len(),
            maybe = partition.maybe.len(),
            rejected = partition.rejected.len(),
            unprocessed = unprocessed.len(),
            "deep analysis partitioned"
        );
        DeepOutcome {
            partition,
            unprocessed,
            halted,
            elapsed,
        }
    }
}
