use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use invcrawl_adapters::{HtmlMetaExtractor, ProfileDiscoverer, StrategyRegistry};
use invcrawl_core::DataSource;
use invcrawl_storage::{CrawlStore, FetcherSet, HeadlessFetcher, HttpFetcher, PgCrawlStore};
use invcrawl_sync::{
    EngineConfig, FanoutEventSink, JobCorrelation, JobOutcome, LoggingJobHandle, PgEventSink,
    ProbeEngine, ProductionEngine, TracingEventSink,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "invcrawl")]
#[command(about = "Inventory crawl engine: probe sites and run incremental crawls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(long)]
    customer: Uuid,
    #[arg(long)]
    source: Uuid,
}

#[derive(Debug, Args)]
struct JobArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Reuse a pre-created run row.
    #[arg(long)]
    run_id: Option<Uuid>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Migrate,
    AddSource {
        #[arg(long)]
        customer: Uuid,
        #[arg(long)]
        base_url: String,
    },
    ShowProfile(SourceArgs),
    Items(SourceArgs),
    Probe(JobArgs),
    Run(JobArgs),
}

impl JobArgs {
    fn correlation(&self, label: &str) -> JobCorrelation {
        let mut correlation = JobCorrelation::new(self.source.customer, self.source.source);
        correlation.run_id = self.run_id;
        correlation.job_id = Some(format!("cli-{label}-{}", Uuid::new_v4()));
        correlation
    }
}

struct Runtime {
    store: Arc<PgCrawlStore>,
    config: EngineConfig,
}

impl Runtime {
    async fn connect() -> Result<Self> {
        let config = EngineConfig::from_env();
        let store = PgCrawlStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        Ok(Self {
            store: Arc::new(store),
            config,
        })
    }

    fn fetchers(&self) -> Result<FetcherSet> {
        let http = HttpFetcher::new(self.config.http_client_config())?;
        let mut fetchers = FetcherSet::new(Arc::new(http));
        if let Some(url) = &self.config.headless_url {
            let headless = HeadlessFetcher::new(url.clone(), Some(&self.config.user_agent))?;
            fetchers = fetchers.with_headless(Arc::new(headless));
        }
        Ok(fetchers)
    }

    fn events(&self) -> Arc<FanoutEventSink> {
        Arc::new(
            FanoutEventSink::new()
                .with(Arc::new(TracingEventSink))
                .with(Arc::new(PgEventSink::new(self.store.pool().clone()))),
        )
    }

    // Strategy implementations are registered by the deployment embedding the engine.
    fn registry(&self) -> StrategyRegistry {
        StrategyRegistry::new()
    }
}

/// Explains up front why a job with no registered strategies will not find items.
fn registry_warning(registry: &StrategyRegistry, job: &str) -> Option<String> {
    if !registry.is_empty() {
        return None;
    }
    let consequence = match job {
        "probe" => "the probe will resolve to unknown",
        _ => "the run will fail with SCRAPE_CRASH",
    };
    Some(format!(
        "no discovery strategies are registered in this binary; {consequence}. \
         Embed the engine with a StrategyRegistry carrying real implementations."
    ))
}

fn strategies_for(runtime: &Runtime, job: &str) -> StrategyRegistry {
    let registry = runtime.registry();
    if let Some(message) = registry_warning(&registry, job) {
        warn!(job, "{message}");
    }
    registry
}

fn report(outcome: JobOutcome) -> Result<()> {
    match outcome {
        JobOutcome::Probed {
            run_id,
            profile,
            found_count,
        } => {
            println!(
                "probe complete: run_id={run_id} strategy={} confidence={} found={found_count}",
                profile.discovery.strategy, profile.probe.confidence
            );
            for note in &profile.probe.notes {
                println!("  note: {note}");
            }
        }
        JobOutcome::Crawled {
            run_id,
            counts,
            detail,
        } => println!(
            "run complete: run_id={run_id} seen={} new={} removed={} fetched={} failed={} deferred={}",
            counts.items_seen,
            counts.items_new,
            counts.items_removed,
            detail.fetched,
            detail.failed,
            detail.skipped
        ),
        JobOutcome::AlreadyFinished { run_id, status } => {
            println!("run {run_id} already {}", status.as_str())
        }
        JobOutcome::DeadLettered {
            run_id,
            code,
            message,
        } => {
            let run_id = run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
            bail!("run {run_id} failed with {code}: {message}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "invcrawl=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let runtime = Runtime::connect().await?;

    match cli.command {
        Commands::Migrate => {
            runtime.store.migrate().await?;
            info!("migrations applied");
        }
        Commands::AddSource { customer, base_url } => {
            let source = DataSource {
                id: Uuid::new_v4(),
                customer_id: customer,
                base_url,
                config: serde_json::json!({}),
            };
            runtime.store.insert_data_source(&source).await?;
            println!("{}", source.id);
        }
        Commands::ShowProfile(args) => {
            let source = runtime
                .store
                .get_data_source(args.customer, args.source)
                .await?
                .with_context(|| format!("data source {} not found", args.source))?;
            match source.site_profile()? {
                Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                None => println!("no site profile; run probe first"),
            }
        }
        Commands::Items(args) => {
            let items = runtime.store.list_items(args.customer, args.source).await?;
            let active = items.iter().filter(|i| i.is_active).count();
            let pending = items.iter().filter(|i| i.detail_fetched_at.is_none()).count();
            println!(
                "items: total={} active={active} removed={} awaiting_detail={pending}",
                items.len(),
                items.len() - active
            );
        }
        Commands::Probe(args) => {
            let engine = ProbeEngine::new(
                runtime.store.clone(),
                runtime.fetchers()?,
                strategies_for(&runtime, "probe"),
                Arc::new(HtmlMetaExtractor),
                runtime.events(),
                runtime.config.clone(),
            );
            let handle = LoggingJobHandle::new("probe");
            report(engine.run(&args.correlation("probe"), &handle).await)?;
        }
        Commands::Run(args) => {
            let discoverer = ProfileDiscoverer::new(strategies_for(&runtime, "prod"))
                .with_simulated_removals(runtime.config.simulate_removals_fraction);
            let engine = ProductionEngine::new(
                runtime.store.clone(),
                runtime.fetchers()?,
                Arc::new(discoverer),
                Arc::new(HtmlMetaExtractor),
                runtime.events(),
                runtime.config.clone(),
            );
            let handle = LoggingJobHandle::new("prod");
            report(engine.run(&args.correlation("prod"), &handle).await)?;
        }
    }

    Ok(())
}
