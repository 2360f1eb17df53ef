//! Encoder worker binary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use encnode_gateway::{Gateway, GatewayClient};
use encnode_jobstore::{JobStore, RedisJobStore, RedisStoreConfig};
use encnode_models::TargetNode;
use encnode_storage::{
    FallbackLedger, KuboNode, KuboNodeConfig, LazyPinQueue, LazyQueueConfig, LocalPinStore, PinDriver,
    StorageNode, TankEngine, TieredNode,
};
use encnode_worker::metrics::install_prometheus;
use encnode_worker::{
    CleanupTask, CommandEncoder, CompletionReporter, Coordinator, EncodeCache, JobProcessor, WorkerConfig,
    WorkerError, WorkerResult,
};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("encnode=info".parse().expect("valid directive"))
        .add_directive("hyper=warn".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting encnode-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Err(e) = run(config).await {
        error!("Worker error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn kubo(url: &str, timeout: Duration) -> WorkerResult<Arc<dyn StorageNode>> {
    let node = KuboNode::new(KuboNodeConfig::new(url).with_timeout(timeout))?;
    Ok(Arc::new(node))
}

async fn run(config: WorkerConfig) -> WorkerResult<()> {
    if let Some(port) = config.metrics_port {
        install_prometheus(port)?;
    }
    tokio::fs::create_dir_all(config.state_dir()).await?;
    tokio::fs::create_dir_all(config.jobs_dir()).await?;

    let store: Option<Arc<dyn JobStore>> = match RedisStoreConfig::from_env() {
        Some(store_config) => Some(Arc::new(RedisJobStore::new(store_config)?)),
        None => {
            warn!("REDIS_URL not set; rescue and direct-path completion disabled");
            None
        }
    };
    let gateway: Option<Arc<dyn Gateway>> = match GatewayClient::from_env(&config.worker_id)? {
        Some(client) => Some(Arc::new(client)),
        None => {
            warn!("GATEWAY_URL not set; gateway polling disabled");
            None
        }
    };
    if store.is_none() && gateway.is_none() {
        return Err(WorkerError::config_error(
            "neither a gateway nor a job store is configured",
        ));
    }

    let nodes = &config.nodes;
    let timeout = nodes.request_timeout;
    let primary = TieredNode::new(TargetNode::Primary, "primary", kubo(&nodes.primary_url, timeout)?);
    let secondaries = nodes
        .secondary_urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            Ok(TieredNode::new(
                TargetNode::Secondary,
                format!("secondary-{}", i + 1),
                kubo(url, timeout)?,
            ))
        })
        .collect::<WorkerResult<Vec<_>>>()?;
    let local = TieredNode::new(TargetNode::Local, "local", kubo(&nodes.local_url, timeout)?);

    let ledger = Arc::new(FallbackLedger::new(config.ledger_path()));
    let local_pins = Arc::new(LocalPinStore::open(config.local_pins_path()).await?);
    let tank = Arc::new(
        TankEngine::new(config.tank.clone(), primary.clone(), PinDriver::default())
            .with_secondaries(secondaries)
            .with_local(local.clone())
            .with_local_archive(ledger, local_pins.clone()),
    );

    let encoder = Arc::new(CommandEncoder::new(
        config.encoder_command.clone(),
        config.ipfs_gateway_url.clone(),
        config.encode_timeout,
    ));
    let cache = Arc::new(EncodeCache::open(config.cache_dir(), config.encode_cache_max_entries).await?);
    let reporter = Arc::new(CompletionReporter::new(
        config.worker_id.clone(),
        gateway.clone(),
        store.clone(),
        config.job_max_attempts,
    ));

    let mut processor = JobProcessor::new(
        config.worker_id.clone(),
        config.jobs_dir(),
        encoder,
        cache.clone(),
        tank.clone(),
        reporter,
    );
    let lazy_queue = if config.lazy_pinning {
        let queue = LazyPinQueue::open(LazyQueueConfig::from_env(&config.state_dir()), tank.clone()).await?;
        processor = processor.with_lazy_queue(queue.clone());
        Some(queue)
    } else {
        None
    };
    if let Some(store) = &store {
        processor = processor.with_store(store.clone());
    }
    if let Some(gateway) = &gateway {
        processor = processor.with_gateway(gateway.clone());
    }

    let mut coordinator = Coordinator::new(config.clone(), Arc::new(processor));
    if let Some(store) = store {
        coordinator = coordinator.with_store(store);
    }
    if let Some(gateway) = gateway {
        coordinator = coordinator.with_gateway(gateway);
    }
    let coordinator = Arc::new(coordinator);

    let mut background = Vec::new();
    if let Some(queue) = lazy_queue {
        background.push(tokio::spawn(queue.run(coordinator.subscribe_shutdown())));
    }
    let mut cleanup = CleanupTask::new(config.cleanup_interval, config.jobs_dir()).with_cache(cache);
    if config.tank.local_fallback_enabled {
        if config.nodes.local_shares_remote() {
            warn!(
                local_url = %config.nodes.local_url,
                "Local node is also a remote tier; local pins will not be pruned"
            );
        } else {
            cleanup = cleanup.with_local_pins(local_pins, primary, local);
        }
    }
    let cleanup_shutdown = coordinator.subscribe_shutdown();
    background.push(tokio::spawn(async move { cleanup.run(cleanup_shutdown).await }));

    // Setup signal handler
    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                coordinator.shutdown();
            }
        });
    }

    coordinator.run().await?;

    for task in background {
        if tokio::time::timeout(config.shutdown_timeout, task).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }
    Ok(())
}
