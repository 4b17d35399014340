use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use mpesa_gateway::api::{self, AppState, Stores};
use mpesa_gateway::cache::{init_cache_pool, CachePoolConfig, RedisCache};
use mpesa_gateway::config::AppConfig;
use mpesa_gateway::database::{init_pool_from_config, status_code_repository::StatusCodeRepository};
use mpesa_gateway::health::{HealthChecker, HealthState, HealthStatus};
use mpesa_gateway::logging::init_tracing_with;
use mpesa_gateway::middleware::logging::{request_logging_middleware, UuidRequestId};
use mpesa_gateway::payments::{AccessTokenCache, CallbackUrls, DarajaClient, DarajaGateway};
use mpesa_gateway::status_codes::{export, seed, StatusCodeStore};
use mpesa_gateway::workers::{BulkPayoutWorker, BulkPayoutWorkerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "Mpesa-Gateway", version, about = "M-Pesa Daraja gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the status code table as Markdown
    ExportStatusCodes,
    /// Load Safaricom result codes into the status code table
    SeedStatusCodes {
        /// Drop existing Safaricom rows and renumber from 1
        #[arg(long)]
        reset: bool,
        #[arg(long, default_value = seed::DEFAULT_SEED_PATH)]
        file: PathBuf,
    },
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing_with(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting M-Pesa gateway"
    );

    let pool = init_pool_from_config(&config.database).await.map_err(|e| {
        error!("Failed to initialize database pool: {}", e);
        e
    })?;
    info!(
        max_connections = pool.options().get_max_connections(),
        "Database connection pool initialized"
    );

    match cli.command {
        Some(Command::ExportStatusCodes) => {
            let store = StatusCodeRepository::new(pool);
            let rows = store.list().await?;
            print!("{}", export::render_markdown(&rows, chrono::Utc::now()));
            return Ok(());
        }
        Some(Command::SeedStatusCodes { reset, file }) => {
            let entries = seed::load_seed_file(&file)?;
            let store = StatusCodeRepository::new(pool);
            let report = seed::seed(&store, entries, reset).await?;
            info!(
                file = %file.display(),
                reset,
                created = report.created,
                updated = report.updated,
                "Status codes seeded"
            );
            return Ok(());
        }
        None => {}
    }

    let redis_cache = match init_cache_pool(CachePoolConfig::from(&config.cache)).await {
        Ok(pool) => {
            info!(redis_url = %config.cache.redis_url, "Cache connection pool initialized");
            Some(RedisCache::new(pool))
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable, Daraja tokens will not be cached");
            None
        }
    };

    let mut daraja = DarajaClient::new(config.daraja.clone())?;
    if let Some(cache) = &redis_cache {
        daraja = daraja.with_token_cache(Arc::new(cache.clone()) as Arc<dyn AccessTokenCache>);
    }
    let gateway: Arc<dyn DarajaGateway> = Arc::new(daraja);

    let callback_urls = CallbackUrls::new(&config.server.public_base_url);
    if config.auth.internal_api_key.is_none() {
        warn!("INTERNAL_API_KEY is not set; internal routes will answer 500");
    }
    let state = AppState::new(
        Stores::postgres(pool.clone()),
        gateway,
        callback_urls.clone(),
        config.auth.internal_api_key.clone(),
    );

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let worker = BulkPayoutWorker::new(
        state.stores.bulk.clone(),
        state.dispatcher.clone(),
        callback_urls,
        BulkPayoutWorkerConfig::from_env(),
    );
    let worker_handle = tokio::spawn(worker.run(worker_shutdown_rx));

    let health_checker = HealthChecker::new(pool, redis_cache);
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .with_state(health_checker);

    let app = api::router(state).merge(health_routes).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(axum::middleware::from_fn(request_logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(
        address = %addr,
        public_base_url = %config.server.public_base_url,
        "Server listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for bulk payout worker shutdown");
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn health(
    State(checker): State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let status = checker.check_health().await;
    if status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(status)))
    } else {
        Ok(Json(status))
    }
}

async fn liveness() -> &'static str {
    "OK"
}
