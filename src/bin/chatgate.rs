use std::path::PathBuf;
use std::sync::Arc;

use chatgate::OpenAICompatible;
use chatgate::gateway::http::router;
use chatgate::gateway::{
    GatewayConfig, GatewayHttpState, HistoryStore, MemoryQuotaStore, MemoryTurnStore,
    OrchestrationPipeline, PhraseFilter, QuotaLedger, QuotaStore, TurnCache, TurnStore,
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chatgate")]
#[command(about = "Chat gateway with per-user token quotas and conversation history")]
#[command(version)]
struct Cli {
    /// Gateway config file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// SQLite database for the quota ledger and durable history
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Redis URL for the quota ledger and the history cache
    #[arg(long, env = "REDIS_URL")]
    redis: Option<String>,

    /// Key prefix for everything written to Redis
    #[arg(long, default_value = "chatgate")]
    redis_prefix: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Export spans over OTLP/HTTP
    #[arg(long)]
    otel: bool,

    /// OTLP endpoint (implies --otel)
    #[arg(long)]
    otel_endpoint: Option<String>,
}

impl Cli {
    /// `--redis`/`REDIS_URL`, or a `host:port` in `REDIS_ADDR`.
    fn redis_url(&self) -> Option<String> {
        if let Some(url) = self.redis.as_deref().filter(|url| !url.trim().is_empty()) {
            return Some(url.trim().to_string());
        }
        std::env::var("REDIS_ADDR")
            .ok()
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .map(|addr| format!("redis://{addr}/"))
    }
}

struct Backends {
    quota: Arc<dyn QuotaStore>,
    turns: Arc<dyn TurnStore>,
    cache: Option<Arc<dyn TurnCache>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _otel_guard = attach_telemetry(&cli)?;

    let mut config = match cli.config.as_ref() {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;

    let backends = build_backends(&cli).await?;

    let ledger = Arc::new(QuotaLedger::new(backends.quota, &config.quota));
    let mut history = HistoryStore::new(backends.turns, config.history.clone());
    if let Some(cache) = backends.cache {
        history = history.with_cache(cache);
    }

    let api_key_set = std::env::var(&config.provider.api_key_env)
        .is_ok_and(|value| !value.trim().is_empty());
    if !api_key_set {
        tracing::warn!(
            env = %config.provider.api_key_env,
            "provider api key is not set; generation calls will be unauthenticated"
        );
    }
    let generator = Arc::new(OpenAICompatible::from_settings(&config.provider));
    let filter = Arc::new(PhraseFilter::new(&config.filter)?);

    let pipeline = Arc::new(OrchestrationPipeline::new(
        filter,
        ledger,
        generator,
        Arc::new(history),
        &config,
    ));
    let app = router(GatewayHttpState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    tracing::info!(
        listen = %cli.listen,
        model = %config.provider.model,
        limit = config.quota.limit,
        "chatgate listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn build_backends(cli: &Cli) -> Result<Backends, Box<dyn std::error::Error>> {
    let mut backends = Backends {
        quota: Arc::new(MemoryQuotaStore::new()),
        turns: Arc::new(MemoryTurnStore::new()),
        cache: None,
    };

    if let Some(path) = cli.sqlite.as_ref() {
        attach_sqlite(path, &mut backends).await?;
    }
    if let Some(url) = cli.redis_url() {
        attach_redis(&url, &cli.redis_prefix, &mut backends).await?;
    }
    Ok(backends)
}

#[cfg(feature = "store-sqlite")]
async fn attach_sqlite(
    path: &std::path::Path,
    backends: &mut Backends,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = chatgate::gateway::SqliteStore::new(path);
    store.init().await?;
    let store = Arc::new(store);
    backends.quota = store.clone();
    backends.turns = store;
    tracing::info!(path = %path.display(), "sqlite store attached");
    Ok(())
}

#[cfg(not(feature = "store-sqlite"))]
async fn attach_sqlite(
    _path: &std::path::Path,
    _backends: &mut Backends,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("--sqlite requires `--features store-sqlite`".into())
}

#[cfg(feature = "store-redis")]
async fn attach_redis(
    url: &str,
    prefix: &str,
    backends: &mut Backends,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = chatgate::gateway::RedisStore::new(url)?.with_prefix(prefix);
    store.ping().await?;
    let store = Arc::new(store);
    backends.quota = store.clone();
    backends.cache = Some(store);
    tracing::info!(prefix, "redis store attached");
    Ok(())
}

#[cfg(not(feature = "store-redis"))]
async fn attach_redis(
    _url: &str,
    _prefix: &str,
    _backends: &mut Backends,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("--redis requires `--features store-redis`".into())
}

#[cfg(feature = "otel")]
fn attach_telemetry(
    cli: &Cli,
) -> Result<Option<chatgate::gateway::telemetry::OtelGuard>, Box<dyn std::error::Error>> {
    if !cli.otel && cli.otel_endpoint.is_none() {
        chatgate::gateway::telemetry::init_logging(cli.json_logs)?;
        return Ok(None);
    }
    Ok(Some(chatgate::gateway::telemetry::init_tracing(
        "chatgate",
        cli.otel_endpoint.as_deref(),
        cli.json_logs,
    )?))
}

#[cfg(not(feature = "otel"))]
fn attach_telemetry(cli: &Cli) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if cli.otel || cli.otel_endpoint.is_some() {
        return Err("otel requires `--features otel`".into());
    }
    chatgate::gateway::telemetry::init_logging(cli.json_logs)?;
    Ok(None)
}
