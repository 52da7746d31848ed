use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rfp_common::redis::RedisCache;
use rfp_common::usage::UsageTracker;

use rfp_discovery::carryover::{FileCarryoverStore, LoadCarryoverManager, PriorityRules};
use rfp_discovery::config::{CompanyProfile, Config};
use rfp_discovery::orchestrator::{PipelineOrchestrator, RunRequest};
use rfp_discovery::prompt::EvaluationContext;
use rfp_discovery::schedule::{next_run_after, SearchWindow};
use rfp_discovery::scoring::Scorers;
use rfp_discovery::server::DiscoveryServer;
use rfp_discovery::source::SourceFilters;
use rfp_discovery::summary::RunSummary;

const EXIT_PARTIAL: u8 = 2;

#[derive(Parser)]
#[command(name = "rfp-discovery", version, about = "Two-tier LLM screening of contracting opportunities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline now over the previous business window.
    Run {
        /// Search the N most recent days instead of the business window.
        #[arg(long)]
        days_back: Option<u32>,
        /// Skip the keyword pre-filter and screen everything.
        #[arg(long)]
        overkill: bool,
        /// Restrict to NAICS code prefixes (comma separated).
        #[arg(long, value_delimiter = ',')]
        naics: Vec<String>,
    },
    /// Small run over today's postings. Carryover and the seen ledger are left untouched.
    Test {
        #[arg(long, default_value_t = 20)]
        max: usize,
    },
    /// Run every day at RUN_AT until interrupted.
    Schedule,
    /// Show the pending carryover batch.
    Carryover,
    /// Serve the screening tools over MCP stdio.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let profile = CompanyProfile::load(&config.company_profile_path);

    if let Command::Carryover = cli.command {
        let stats = carryover_manager(&config, &profile)?.stats()?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(ExitCode::SUCCESS);
    }

    let redis = RedisCache::new(config.redis_url.as_deref());
    if redis.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, running without usage counters or seen ledger");
    }
    let usage = UsageTracker::new(redis.clone());
    let ctx = Arc::new(EvaluationContext::from_profile(&profile));
    let scorers = Scorers::from_config(&config, ctx, usage.clone())?;

    match cli.command {
        Command::Serve => {
            let server = DiscoveryServer::new(
                scorers,
                Arc::new(carryover_manager(&config, &profile)?),
                usage,
                redis,
            );
            info!("MCP server ready, serving on stdio");
            let service = server.serve(stdio()).await.inspect_err(|e| {
                tracing::error!(error = %e, "MCP server error");
            })?;
            service.waiting().await?;
            info!("MCP server shut down");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            days_back,
            overkill,
            naics,
        } => {
            let orchestrator = PipelineOrchestrator::from_config(&config, &profile, &scorers, redis)?;
            let request = RunRequest {
                window: days_back.map_or(SearchWindow::Production, SearchWindow::DaysBack),
                filters: SourceFilters {
                    naics_prefixes: naics,
                },
                overkill,
                ..RunRequest::production(Local::now().date_naive())
            };
            let summary = orchestrator.run(&request, &interrupt_token()).await;
            report(&summary)
        }
        Command::Test { max } => {
            let orchestrator = PipelineOrchestrator::from_config(&config, &profile, &scorers, redis)?;
            let request = RunRequest::test(Local::now().date_naive(), max);
            let summary = orchestrator.run(&request, &interrupt_token()).await;
            report(&summary)
        }
        Command::Schedule => {
            let orchestrator = PipelineOrchestrator::from_config(&config, &profile, &scorers, redis)?;
            let cancel = interrupt_token();
            loop {
                let now = Local::now().naive_local();
                let next = next_run_after(now, config.run_at);
                let wait = (next - now).to_std().unwrap_or_default();
                info!(next_run = %next, "waiting for scheduled run");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let summary = orchestrator
                    .run(&RunRequest::production(Local::now().date_naive()), &cancel)
                    .await;
                println!("{}", serde_json::to_string(&summary)?);
                if cancel.is_cancelled() {
                    break;
                }
            }
            info!("scheduler stopped");
            Ok(ExitCode::SUCCESS)
        }
        Command::Carryover => Ok(ExitCode::SUCCESS),
    }
}

fn carryover_manager(config: &Config, profile: &CompanyProfile) -> anyhow::Result<LoadCarryoverManager> {
    Ok(LoadCarryoverManager::new(
        Arc::new(FileCarryoverStore::new(config.carryover_path())),
        config.max_daily,
        PriorityRules::from_profile(profile)?,
        config.thresholds.screen,
    ))
}

/// Cancelled on the first Ctrl-C. In-flight calls finish; nothing new is scheduled.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work and persisting");
            trigger.cancel();
        }
    });
    cancel
}

fn report(summary: &RunSummary) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(if summary.partial {
        ExitCode::from(EXIT_PARTIAL)
    } else {
        ExitCode::SUCCESS
    })
}
