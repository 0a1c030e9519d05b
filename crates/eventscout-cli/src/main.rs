use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eventscout_sync::{
    EventService, EventsRefreshTask, RefreshRunner, RefreshScheduler, RefreshTask,
    RefugeeCountTask, ScoutConfig, ScrapeOrchestrator, TaskOutcome,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "eventscout")]
#[command(about = "Community event scraper and cache-backed events API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the refresh scheduler unless disabled).
    Serve,
    /// Scrape every configured source once and cache the result.
    Scrape {
        /// Print the full run report as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Run one refresh cycle over all scheduled tasks.
    Refresh,
}

fn init_tracing() -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::try_new(format!("warn,eventscout={level},tower_http={level}"))
                .with_context(|| format!("invalid LOG_LEVEL `{level}`"))?
        }
    };
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn refresh_tasks(config: &ScoutConfig, orchestrator: &Arc<ScrapeOrchestrator>) -> Vec<Arc<dyn RefreshTask>> {
    let events: Arc<dyn RefreshTask> = Arc::new(EventsRefreshTask::new(orchestrator.clone()));
    let refugees: Arc<dyn RefreshTask> = Arc::new(RefugeeCountTask::new(
        orchestrator.fetcher(),
        config.refugee_primary_url.clone(),
        config.refugee_fallback_url.clone(),
        config.refugee_ttl,
    ));
    vec![events, refugees]
}

async fn serve(config: ScoutConfig, orchestrator: Arc<ScrapeOrchestrator>) -> Result<()> {
    let service = EventService::new(orchestrator.clone());
    // held until the server exits
    let _scheduler = if config.scheduler_enabled {
        let scheduler = RefreshScheduler::new(
            RefreshRunner::new(orchestrator.cache().clone()),
            refresh_tasks(&config, &orchestrator),
            config.refresh_interval,
        );
        Some(scheduler.start().await?)
    } else {
        info!("refresh scheduler disabled");
        None
    };
    eventscout_web::serve(&config, service).await
}

async fn scrape(orchestrator: &ScrapeOrchestrator, json: bool) -> Result<()> {
    let report = orchestrator.run_report().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "scrape complete: run_id={} events={} candidates={} rejected={} sources_ok={} sources_failed={} pages={}",
            report.run_id,
            report.events.len(),
            report.candidates,
            report.rejected,
            report.sources_ok,
            report.sources_failed,
            report.pages_fetched
        );
    }
    Ok(())
}

async fn refresh(config: &ScoutConfig, orchestrator: &Arc<ScrapeOrchestrator>) -> Result<()> {
    let runner = RefreshRunner::new(orchestrator.cache().clone());
    let outcomes = runner.run_cycle(&refresh_tasks(config, orchestrator)).await;
    let mut failed = 0;
    for (task, outcome) in &outcomes {
        println!("{task}: {outcome}");
        if matches!(outcome, TaskOutcome::Failed(_)) {
            failed += 1;
        }
    }
    if failed == outcomes.len() && !outcomes.is_empty() {
        bail!("every refresh task failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = ScoutConfig::from_env()?;
    let orchestrator = Arc::new(
        ScrapeOrchestrator::from_config(&config, config.cache_store())
            .context("building scrape orchestrator")?,
    );
    info!(
        sources = orchestrator.sources().len(),
        cache = ?config.cache_backend,
        "eventscout configured"
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, orchestrator).await?,
        Commands::Scrape { json } => scrape(&orchestrator, json).await?,
        Commands::Refresh => refresh(&config, &orchestrator).await?,
    }

    Ok(())
}
