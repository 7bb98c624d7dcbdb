use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use jan_gateway::cache::{CacheService, NoopCache, RedisCache};
use jan_gateway::config::Config;
use jan_gateway::control::ControlPlane;
use jan_gateway::gateway::{auth::KeyTable, start_gateway, AppState};
use jan_gateway::registry::{spawn_refresh, ModelRegistry};
use jan_gateway::responses::ResponsesService;
use jan_gateway::router::InferenceRouter;
use jan_gateway::store::SqliteStore;
use jan_gateway::stream::InFlight;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "jan-gateway", version, about = "OpenAI-compatible LLM inference gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway (default)
    Start,
    /// Validate the configuration file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| jan_gateway::gateway_home().join("config.yaml"));

    info!(path = %config_path.display(), "loading configuration");
    let cfg = Config::load(&config_path).await?;

    if matches!(cli.command, Some(Command::CheckConfig)) {
        println!("configuration ok: {}", config_path.display());
        return Ok(());
    }

    // --- Cache ---
    let cache: Arc<dyn CacheService> = match &cfg.cache.redis_url {
        Some(url) => {
            let redis = RedisCache::new(url, &cfg.cache.key_prefix)?;
            match redis.health_check().await {
                Ok(()) => info!("redis cache connected"),
                Err(e) => warn!(error = %e, "redis unreachable at startup, continuing"),
            }
            Arc::new(redis)
        }
        None => {
            warn!("no redis_url configured, running with the no-op cache");
            Arc::new(NoopCache)
        }
    };

    // --- Store + services ---
    let store = Arc::new(SqliteStore::open(&cfg.store.resolved_path())?);
    let service = Arc::new(ResponsesService::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));

    // --- Model registry ---
    let registry = Arc::new(ModelRegistry::new());
    let _refresh_sched = spawn_refresh(registry.clone(), &cfg.registry, cache.clone()).await?;

    // --- Router + control plane ---
    let router = Arc::new(InferenceRouter::from_config(
        &cfg,
        registry.clone(),
        cache.clone(),
    ));
    // Cluster deployment is an external collaborator; without an
    // orchestrator client the control plane reports a precondition
    // failure on every call.
    let control = Arc::new(ControlPlane::new(None, cache.clone()));

    let keys = Arc::new(KeyTable::from_config(&cfg.auth));

    let shutdown = CancellationToken::new();
    let in_flight = InFlight::new();

    let state = AppState {
        service,
        router,
        control,
        cache,
        keys,
        shutdown: shutdown.clone(),
        in_flight: in_flight.clone(),
    };

    let gateway = start_gateway(cfg.server.addr, state).await?;
    info!(
        addr = %gateway.addr,
        providers = cfg.providers.len(),
        registry_endpoints = cfg.registry.endpoints.len(),
        "jan-gateway ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down");

    // Fan the shutdown token out to in-flight streams, give them a
    // bounded drain window, then stop the serve task.
    shutdown.cancel();
    let sessions = in_flight.count();
    if sessions > 0 {
        info!(sessions, "waiting for in-flight streams to drain");
    }
    if tokio::time::timeout(std::time::Duration::from_secs(10), in_flight.drained())
        .await
        .is_err()
    {
        warn!(
            sessions = in_flight.count(),
            "drain window elapsed, aborting remaining sessions"
        );
    }
    gateway.handle.abort();
    info!("shutdown complete");

    Ok(())
}
