// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  unigate — sharded aggregator gateway
//
//  Data plane:  axum pipeline (auth → rate limit → shard routing → forward)
//  Payments:    two-phase sessions against the aggregator network
//  Config:      Postgres-backed shard configs with a 2s poller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use unigate_api::AppState;
use unigate_core::clock::SystemTimeMeter;
use unigate_core::config::GatewayConfig;
use unigate_observability::MetricsCollector;
use unigate_payment::{AggregatorGateway, PaymentService, PaymentSettings};
use unigate_proxy::{ConfigPoller, ProxyContext, RateLimiter};
use unigate_store::shard_config::{PgShardConfigStore, ShardConfigStore};
use unigate_store::sessions::{PaymentStore, PgPaymentStore};
use unigate_store::{ApiKeyCache, KeyStore, PgKeyStore};

#[derive(Parser, Debug)]
#[command(name = "unigate", version, about = "unigate — sharded aggregator gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    unigate_observability::logger::init(&cli.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "unigate starting");

    let config = GatewayConfig::load(cli.config.as_deref())?;
    if config.payment.server_secret.is_empty() {
        warn!("payment.server_secret is empty; receive addresses are not production-safe");
    }

    // ── Database ──
    let pool = unigate_store::db::connect(&config.database).await?;
    unigate_store::db::migrate(&pool).await?;

    let keys: Arc<dyn KeyStore> = Arc::new(PgKeyStore::new(pool.clone()));
    let payments: Arc<dyn PaymentStore> = Arc::new(PgPaymentStore::new(pool.clone()));
    let shard_configs: Arc<dyn ShardConfigStore> = Arc::new(PgShardConfigStore::new(pool.clone()));

    // ── Shared infrastructure ──
    let clock = SystemTimeMeter::shared();
    let metrics = Arc::new(MetricsCollector::new()?);
    let cache = Arc::new(ApiKeyCache::new(keys.clone(), clock.clone(), config.cache.ttl_secs));
    let limiter = Arc::new(RateLimiter::new(clock.clone()));

    // ── Startup router: env URI is fail-fast, DB path degrades to failsafe ──
    let router = unigate_proxy::poller::startup_router(
        &shard_configs,
        config.shard_config_uri().as_deref(),
        config.shards.validate_connectivity,
        &config.node_id,
    )
    .await?
    .into_shared();

    // ── Payment workflow ──
    let gateway = Arc::new(AggregatorGateway::new(
        config.payment.server_secret.as_bytes().to_vec(),
        router.clone(),
        Duration::from_secs(config.payment.accept_timeout_secs),
        Duration::from_secs(config.payment.proof_timeout_secs),
    )?);
    let payment_service = Arc::new(PaymentService::new(
        keys.clone(),
        payments,
        gateway,
        cache.clone(),
        clock.clone(),
        metrics.clone(),
        PaymentSettings::from_config(&config.payment)?,
    ));

    // ── Request pipeline ──
    let proxy = Arc::new(ProxyContext::new(
        &config.proxy,
        router.clone(),
        cache.clone(),
        limiter.clone(),
        clock,
        metrics.clone(),
    )?);

    // ── Background tasks ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = ConfigPoller::new(
        shard_configs.clone(),
        router.clone(),
        Duration::from_secs(config.shards.poll_interval_secs),
        config.shards.validate_connectivity,
    );
    let poller_handle = tokio::spawn(poller.run(shutdown_rx.clone()));

    let sweeper_handle = tokio::spawn(payment_service.clone().run_sweeper(
        Duration::from_secs(config.payment.sweep_interval_secs),
        shutdown_rx,
    ));

    // ── HTTP surface ──
    let state = AppState {
        proxy,
        payments: payment_service,
        keys,
        shard_configs,
        cache,
        limiter,
        router,
        metrics,
        pool: Some(pool.clone()),
    };
    let app = unigate_api::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "unigate is ready — serving traffic");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Drain ──
    info!("Shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);
    let drain = Duration::from_secs(config.server.drain_secs);
    for (name, mut handle) in [("poller", poller_handle), ("sweeper", sweeper_handle)] {
        if tokio::time::timeout(drain, &mut handle).await.is_err() {
            warn!(task = name, "did not drain in time; aborting");
            handle.abort();
        }
    }
    pool.close().await;

    info!("unigate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
