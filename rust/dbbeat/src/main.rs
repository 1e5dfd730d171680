//! dbbeat - Main Entry Point
//!
//! Runs the database-backed beat service until Ctrl+C or SIGTERM.

use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dbbeat::config::{AppConfig, ConfigValidator, ConfigurationError, LogFormat};
use dbbeat::gate::{ChangeStampStore, InMemoryChangeStamp, RedisChangeStamp};
use dbbeat::sink::{LogTaskSink, RedisTaskSink, TaskSink};
use dbbeat::{
    BeatService, ChangeGate, DatabaseScheduler, EntryContext, SharedClock, SqliteScheduleStore,
    SystemClock, log_banner, seeds,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "dbbeat")]
#[command(about = "Database-backed periodic task scheduler")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "DBBEAT_CONFIG")]
    config: Option<String>,

    /// SQLite schedule database (overrides database.path).
    #[arg(long, env = "DBBEAT_DATABASE")]
    database: Option<String>,

    /// Redis URL for change detection and task delivery.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Log level (overrides logging.level; RUST_LOG wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty or json.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Skip the built-in beat table.
    #[arg(long)]
    no_seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_unchecked(args.config.as_deref())?;
    if let Some(path) = args.database {
        config.database.path = path;
    }
    if args.redis_url.is_some() {
        config.redis.url = args.redis_url;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if args.no_seed {
        config.scheduler.seed_builtin = false;
    }

    init_tracing(&config.logging.level, config.logging.format);
    log_banner!(format!("dbbeat v{}", env!("CARGO_PKG_VERSION")));

    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
    let tz = config.timezone()?;
    tracing::info!(
        timezone = %tz,
        database = %config.database.path,
        redis = config.redis.url.is_some(),
        "Configuration loaded"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let (stamps, sink) = init_delivery(&config).await?;

    let store = Arc::new(SqliteScheduleStore::new(&config.database.path).await?);
    let gate = ChangeGate::new(stamps, Arc::clone(&clock), tz);
    let scheduler = DatabaseScheduler::new(store, gate, EntryContext::new(clock, tz))
        .with_result_expires(config.scheduler.result_expires());
    let beat = BeatService::new(scheduler, sink)
        .with_max_interval(config.scheduler.max_interval())
        .with_sync_every(config.scheduler.sync_every());

    let seed = if config.scheduler.seed_builtin {
        seeds::default_beat_schedule()
    } else {
        seeds::BeatTable::new()
    };

    beat.run(&seed, shutdown_signal()).await?;

    tracing::info!("dbbeat shut down gracefully");
    Ok(())
}

/// Change stamps and task sink: Redis-backed when configured, in-process otherwise.
async fn init_delivery(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn ChangeStampStore>, Arc<dyn TaskSink>)> {
    let Some(url) = config.redis.url.as_deref() else {
        tracing::warn!("No Redis URL configured: using in-process change stamps and logging sink");
        return Ok((Arc::new(InMemoryChangeStamp::new()), Arc::new(LogTaskSink)));
    };

    let redis = init_redis(url).await.map_err(|e| {
        ConfigurationError::unreachable(
            "Redis",
            url,
            e.to_string(),
            "Is the Redis server running and reachable from this host?",
        )
    })?;
    let stamps = RedisChangeStamp::new(redis.clone(), &config.scheduler.redis_prefix);
    tracing::info!(key = %stamps.key(), "Redis change detection enabled");
    let sink = RedisTaskSink::new(redis, config.scheduler.default_queue.clone());
    Ok((Arc::new(stamps), Arc::new(sink)))
}

async fn init_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    Ok(conn)
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
