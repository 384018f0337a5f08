use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod cache;
mod config;
mod db;
mod dispatcher;
mod error;
mod models;
mod rebuild;
mod risk;
mod store;

use api::{BatchRequest, ReadApi};
use cache::{Cache, RedisCache};
use config::{CacheTtls, DispatcherSettings, RebuildSettings, Settings};
use dispatcher::{BatchHandle, BatchReport, BatchState, Dispatcher};
use models::{AlertFilter, AlertStatus, PageRequest, Severity};
use rebuild::RebuildJob;
use store::{MemoryStore, PgStore};

#[derive(Parser)]
#[command(name = "market-supervision")]
#[command(
    about = "Batch alert processing and cached risk reporting for market supervision",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed alerts
    Seed,
    /// Import alerts from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Headline alert statistics over the trend window
    Stats,
    /// Daily alert counts and amounts
    Trends {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Companies ranked by risk score
    TopCompanies {
        #[arg(long, default_value_t = api::DEFAULT_TOP_COMPANIES)]
        limit: usize,
    },
    /// Aggregate profile for one company
    Company {
        #[arg(long)]
        name: String,
    },
    /// List alerts, newest first
    Alerts {
        #[arg(long)]
        severity: Option<Severity>,
        #[arg(long)]
        status: Option<AlertStatus>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        since_days: Option<i64>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = PageRequest::DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },
    /// Process a batch of alerts and wait for the result
    Process {
        #[arg(required = true)]
        alert_ids: Vec<String>,
        #[arg(long, default_value_t = 200)]
        poll_ms: u64,
    },
    /// Recompute company aggregates and daily statistics once
    Rebuild,
    /// Run the periodic rebuild until interrupted
    Run,
    /// Seed, rebuild and process a batch against an in-memory store
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Commands::Demo = cli.command {
        return demo().await;
    }
    let settings = Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    if let Commands::InitDb = cli.command {
        db::init_db(&pool).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let store = Arc::new(PgStore::new(pool));
    let cache = connect_cache(&settings).await;
    let dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        cache.clone(),
        settings.dispatcher,
    );
    let rebuild = RebuildJob::new(store.clone(), store.clone(), cache.clone(), settings.rebuild);
    let api = ReadApi::new(
        store.clone(),
        store.clone(),
        cache,
        dispatcher,
        settings.cache_ttls,
        settings.rebuild.trend_window_days,
    );

    match cli.command {
        Commands::InitDb | Commands::Demo => {}
        Commands::Seed => {
            let inserted = db::seed(store.as_ref()).await?;
            println!("Inserted {inserted} seed alerts.");
        }
        Commands::Import { csv } => {
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("failed to open {}", csv.display()))?;
            let inserted = db::import_csv(store.as_ref(), file).await?;
            println!("Inserted {inserted} alerts from {}.", csv.display());
        }
        Commands::Stats => print_json(&api.statistics().await?)?,
        Commands::Trends { days } => print_json(&api.trends(days).await?)?,
        Commands::TopCompanies { limit } => print_json(&api.top_companies(limit).await?)?,
        Commands::Company { name } => match api.company(&name).await? {
            Some(profile) => print_json(&profile)?,
            None => println!("No profile for {name}. Run `rebuild` first."),
        },
        Commands::Alerts {
            severity,
            status,
            region,
            company,
            since_days,
            page,
            page_size,
        } => {
            let filter = AlertFilter {
                severity,
                status,
                region,
                company_name: company,
                detected_from: since_days.map(risk::cutoff_instant),
                detected_to: None,
            };
            print_json(&api.list_alerts(&filter, PageRequest::new(page, page_size)).await?)?;
        }
        Commands::Process { alert_ids, poll_ms } => {
            let accepted = api.submit_batch(BatchRequest { alert_ids }).await?;
            print_json(&accepted)?;

            let poll = Duration::from_millis(poll_ms);
            print_json(&await_batch(&api, accepted.batch_id, poll).await?)?;
        }
        Commands::Rebuild => print_json(&rebuild.rebuild_all().await?)?,
        Commands::Run => {
            rebuild
                .run_scheduled(settings.rebuild.interval, shutdown_signal())
                .await;
            report_rebuild_status(&rebuild).await?;
        }
    }

    Ok(())
}

/// Exercise the whole pipeline without Postgres or Redis.
async fn demo() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let cache = Cache::in_memory();
    let rebuild_settings = RebuildSettings::default();
    let dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        cache.clone(),
        DispatcherSettings::default(),
    );
    let rebuild = RebuildJob::new(store.clone(), store.clone(), cache.clone(), rebuild_settings);
    let api = ReadApi::new(
        store.clone(),
        store.clone(),
        cache,
        dispatcher,
        CacheTtls::default(),
        rebuild_settings.trend_window_days,
    );

    let seeded = db::seed(store.as_ref()).await?;
    info!("Seeded {seeded} alerts into the in-memory store");
    rebuild.rebuild_all().await?;
    report_rebuild_status(&rebuild).await?;

    let listing = api
        .list_alerts(&AlertFilter::default(), PageRequest::default())
        .await?;
    let mut alert_ids: Vec<String> = listing.results.into_iter().map(|a| a.alert_id).collect();
    alert_ids.push("MISSING-1".to_string());

    let accepted = api.submit_batch(BatchRequest { alert_ids }).await?;
    print_json(&accepted)?;
    print_json(&await_batch(&api, accepted.batch_id, Duration::from_millis(50)).await?)?;

    print_json(&api.statistics().await?)?;
    print_json(&api.top_companies(api::DEFAULT_TOP_COMPANIES).await?)?;
    Ok(())
}

async fn await_batch(
    api: &ReadApi,
    batch_id: BatchHandle,
    poll: Duration,
) -> anyhow::Result<BatchReport> {
    loop {
        let report = api
            .batch_status(batch_id)
            .await
            .context("batch record expired before completion")?;
        if report.state == BatchState::Completed {
            return Ok(report);
        }
        info!(
            "Batch {batch_id}: {} pending, {} running",
            report.pending, report.running
        );
        tokio::time::sleep(poll).await;
    }
}

async fn report_rebuild_status(rebuild: &RebuildJob) -> anyhow::Result<()> {
    info!("Rebuild job state: {:?}", rebuild.state().await);
    if let Some(report) = rebuild.last_report().await {
        print_json(&report)?;
    }
    Ok(())
}

async fn connect_cache(settings: &Settings) -> Cache {
    let Some(redis_url) = settings.redis_url.as_deref() else {
        info!("REDIS_URL not set, using in-process cache");
        return Cache::in_memory();
    };

    match RedisCache::connect(redis_url, &settings.cache_key_prefix).await {
        Ok(redis) => Cache::new(Arc::new(redis)),
        Err(e) => {
            warn!("Redis unavailable ({e}), falling back to in-process cache");
            Cache::in_memory()
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
