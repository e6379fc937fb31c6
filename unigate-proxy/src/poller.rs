use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use unigate_core::router::{SharedRouter, ShardRouter};
use unigate_core::shard::ShardConfig;
use unigate_core::GatewayError;
use unigate_store::shard_config::ShardConfigStore;

/// Watches the shard-config store and atomically swaps the live router.
///
/// Every tick: read the record with the highest id; if strictly newer than
/// the last one published, build a router, validate it, optionally probe its
/// targets, and publish. Any failure leaves the current router in place and
/// the high-water mark unchanged, so a bad publish never replaces a good one.
pub struct ConfigPoller {
    store: Arc<dyn ShardConfigStore>,
    router: SharedRouter,
    interval: Duration,
    validate_connectivity: bool,
    probe_client: reqwest::Client,
    last_published: Option<i32>,
}

impl ConfigPoller {
    pub fn new(
        store: Arc<dyn ShardConfigStore>,
        router: SharedRouter,
        interval: Duration,
        validate_connectivity: bool,
    ) -> Self {
        let last_published = router.load().config_id();
        Self {
            store,
            router,
            interval,
            validate_connectivity,
            probe_client: probe_client(),
            last_published,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Config poller started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => self.tick().await,
                _ = shutdown.changed() => {
                    info!("Config poller stopping");
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let record = match self.store.latest().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Shard config read failed");
                return;
            }
        };

        if Some(record.id) <= self.last_published {
            return;
        }

        match self.build(&record.config, record.id).await {
            Ok(router) => {
                let shards = router.shard_count();
                self.router.store(Arc::new(router));
                self.last_published = Some(record.id);
                info!(config_id = record.id, shards, "Shard config published");
            }
            Err(e) => {
                // Keep serving the previous router; retry next tick.
                warn!(config_id = record.id, error = %e, "Shard config rejected");
            }
        }
    }

    async fn build(&self, config: &ShardConfig, id: i32) -> Result<ShardRouter, GatewayError> {
        let router = ShardRouter::from_config(config)?.with_config_id(id);
        router.validate()?;
        if self.validate_connectivity {
            probe_targets(&router, &self.probe_client).await?;
        }
        Ok(router)
    }
}

fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

/// Minimal connectivity check: every distinct target must answer an HTTP
/// request. Any status counts as reachable.
pub async fn probe_targets(
    router: &ShardRouter,
    client: &reqwest::Client,
) -> Result<(), GatewayError> {
    for url in router.all_targets() {
        client.get(&url).send().await.map_err(|e| {
            GatewayError::InvalidShardConfig(format!("shard target {url} unreachable: {e}"))
        })?;
    }
    Ok(())
}

/// Load a shard configuration from `file://`, `http://`, or `https://`.
pub async fn load_from_uri(uri: &str) -> Result<ShardConfig, GatewayError> {
    let raw = if let Some(path) = uri.strip_prefix("file://") {
        tokio::fs::read_to_string(path).await?
    } else if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri).await.map_err(|e| {
            GatewayError::InvalidShardConfig(format!("config fetch from {uri} failed: {e}"))
        })?;
        response.text().await.map_err(|e| {
            GatewayError::InvalidShardConfig(format!("config read from {uri} failed: {e}"))
        })?
    } else {
        return Err(GatewayError::InvalidShardConfig(format!(
            "unsupported config uri scheme: {uri}"
        )));
    };

    serde_json::from_str(&raw)
        .map_err(|e| GatewayError::InvalidShardConfig(format!("config parse failed: {e}")))
}

/// Resolve the startup router.
///
/// An env/config URI is authoritative and fail-fast: the loaded config is
/// validated (and probed, when enabled), persisted, and published; any
/// failure aborts startup. With no URI, the latest DB record is used, and any
/// failure on that path downgrades to the failsafe router so the admin
/// surface stays reachable to fix the configuration.
pub async fn startup_router(
    store: &Arc<dyn ShardConfigStore>,
    config_uri: Option<&str>,
    validate_connectivity: bool,
    created_by: &str,
) -> Result<ShardRouter, GatewayError> {
    if let Some(uri) = config_uri {
        let config = load_from_uri(uri).await?;
        let router = ShardRouter::from_config(&config)?;
        router.validate()?;
        if validate_connectivity {
            probe_targets(&router, &probe_client()).await?;
        }
        let id = store
            .save(&config, created_by)
            .await
            .map_err(GatewayError::from)?;
        info!(uri, config_id = id, "Shard config loaded from URI");
        return Ok(router.with_config_id(id));
    }

    let built = async {
        let record = store
            .latest()
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| GatewayError::InvalidShardConfig("no shard config stored".into()))?;
        let router = ShardRouter::from_config(&record.config)?.with_config_id(record.id);
        router.validate()?;
        if validate_connectivity {
            probe_targets(&router, &probe_client()).await?;
        }
        Ok::<_, GatewayError>((record.id, router))
    }
    .await;

    match built {
        Ok((id, router)) => {
            info!(config_id = id, "Shard config loaded from database");
            Ok(router)
        }
        Err(e) => {
            error!(error = %e, "Shard config load failed; failsafe router installed");
            Ok(ShardRouter::Failsafe)
        }
    }
}
