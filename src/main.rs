//! Propboard backend.
//!
//! Aggregates player-prop projections from the upstream provider, persists
//! them, and serves a ranked, explained props board over HTTP. The listener
//! accepts connections immediately; ingestion and scorer training run as
//! background tasks and the API degrades gracefully until they warm up.

use std::sync::atomic::AtomicU16;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use propboard_backend::api::{self, AppState};
use propboard_backend::config::Config;
use propboard_backend::ensemble::ModelManager;
use propboard_backend::explain::{ExplanationConfig, ExplanationService, OllamaClient};
use propboard_backend::ingest::{HttpFetcher, IngestionEngine, RateGovernor, ResponseCache};
use propboard_backend::store::ProjectionStore;
use propboard_backend::supervisor::{self, Supervisor};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "propboard", about = "Prop projection aggregation and ranking service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full system (default).
    Serve,
    /// Run one ingestion cycle and exit. Exit code 0 if any league
    /// succeeded, 1 if all failed.
    IngestOnce,
    /// Print store statistics as JSON.
    StoreStats,
}

#[tokio::main]
async fn main() {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    // Invalid configuration and an unreachable database are startup faults:
    // fail fast with the configuration exit code.
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };
    let store = match ProjectionStore::new(&config.db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, db_path = %config.db_path, "database unavailable at startup");
            std::process::exit(2);
        }
    };

    let code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => match serve(Arc::new(config), store).await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "server exited with error");
                1
            }
        },
        Command::IngestOnce => ingest_once(&config, store).await,
        Command::StoreStats => store_stats(&store),
    };
    std::process::exit(code);
}

async fn serve(config: Arc<Config>, store: Arc<ProjectionStore>) -> Result<()> {
    info!("🏟️  propboard backend starting");

    // Scorer batches run on this pool so they never starve the I/O tasks.
    let workers = std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(4);
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build_global()
    {
        warn!(error = %e, "rayon pool already configured");
    }

    let http_client = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let cache = Arc::new(ResponseCache::new(config.cache_ttl));
    let governor = Arc::new(RateGovernor::new(
        config.request_min_spacing,
        config.backoff_schedule.clone(),
    ));
    let fetcher = Arc::new(HttpFetcher::new(http_client.clone()));
    let engine = Arc::new(IngestionEngine::new(
        fetcher,
        cache.clone(),
        governor.clone(),
        store.clone(),
        config.ingest_interval,
        config.alert_slack_webhook.clone(),
        http_client.clone(),
    ));

    let manager = Arc::new(ModelManager::with_default_scorers());

    let explainer = Arc::new(ExplanationService::new(
        OllamaClient::new(http_client.clone(), config.llm_url.clone()),
        ExplanationConfig {
            model_preference: config.llm_model_preference.clone(),
            ..Default::default()
        },
    ));

    if config.alert_email.is_some() {
        info!("alert email configured (sink not wired in this build)");
    }
    if config.sentry_dsn.is_some() {
        info!("sentry DSN configured (sink not wired in this build)");
    }

    let state = AppState {
        store: store.clone(),
        ingestion: engine.status_handle(),
        governor,
        cache: cache.clone(),
        manager: manager.clone(),
        explainer: explainer.clone(),
        config: config.clone(),
        started_at: tokio::time::Instant::now(),
        bound_port: Arc::new(AtomicU16::new(0)),
    };

    // Background work first, but nothing here blocks the listener: the first
    // ingestion cycle and scorer training proceed while requests are served
    // from the existing store.
    let mut supervisor = Supervisor::new();
    let cancel = supervisor.cancel_token();

    manager.spawn_training(&cancel);
    supervisor.spawn("ingestion", {
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });
    supervisor.spawn("model-discovery", {
        let explainer = explainer.clone();
        let cancel = cancel.clone();
        async move {
            let mut ticker = interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if explainer.primary_model().is_none() {
                            explainer.discover_models(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    });
    supervisor.spawn("cache-sweep", {
        let cache = cache.clone();
        let cancel = cancel.clone();
        async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => { cache.sweep(); }
                }
            }
        }
    });
    supervisor.spawn("session-gc", {
        let explainer = explainer.clone();
        let cancel = cancel.clone();
        async move {
            let mut ticker = interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = explainer.sweep_sessions();
                        if dropped > 0 {
                            info!(dropped, "idle chat sessions swept");
                        }
                    }
                }
            }
        }
    });
    supervisor.spawn("retention-sweep", {
        let store = store.clone();
        let cancel = cancel.clone();
        let retention_days = config.retention_days;
        async move {
            let mut ticker = interval(Duration::from_secs(24 * 3600));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                        match store.archive_started_before(cutoff) {
                            Ok(0) => {}
                            Ok(n) => {
                                info!(archived = n, retention_days, "retention sweep archived projections");
                                let _ = store.optimize();
                            }
                            Err(e) => warn!(error = %e, "retention sweep failed"),
                        }
                    }
                }
            }
        }
    });

    let (listener, port) = supervisor::bind_port_in_range(config.port_range).await?;
    state.set_port(port);
    info!(port, "🎯 API server listening");

    let app = api::router(state);
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_cancel.cancel();
        })
        .await
        .context("Server error")?;

    supervisor.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn ingest_once(config: &Config, store: Arc<ProjectionStore>) -> i32 {
    let http_client = match reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            return 1;
        }
    };

    let engine = IngestionEngine::new(
        Arc::new(HttpFetcher::new(http_client.clone())),
        Arc::new(ResponseCache::new(config.cache_ttl)),
        Arc::new(RateGovernor::new(
            config.request_min_spacing,
            config.backoff_schedule.clone(),
        )),
        store,
        config.ingest_interval,
        config.alert_slack_webhook.clone(),
        http_client,
    );

    let outcome = engine.run_cycle(&CancellationToken::new()).await;
    info!(
        leagues_ok = outcome.leagues_ok,
        leagues_failed = outcome.leagues_failed,
        upserted = outcome.projections_upserted,
        conversion_errors = outcome.conversion_errors,
        "ingestion cycle finished"
    );

    if outcome.leagues_ok > 0 {
        0
    } else {
        1
    }
}

fn store_stats(store: &ProjectionStore) -> i32 {
    match store.stats() {
        Ok(stats) => match serde_json::to_string_pretty(&stats) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                error!(error = %e, "failed to serialize stats");
                1
            }
        },
        Err(e) => {
            error!(error = %e, "failed to read store stats");
            1
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "propboard_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();
}
