mod intake;
mod store;

use anyhow::Context;
use intake::{RedisIntake, RedisReplies};
use prajna_common::config::Config;
use prajna_engine::{backend, Executor, ExecutorSettings, Judge, JobRunner, LanguageConfigManager, ProblemStore};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use store::RedisStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("PRAJNA_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Prajna worker booting...");

    let config = Config::from_env().context("Invalid worker configuration")?;

    let languages = LanguageConfigManager::load_or_builtin(&config.languages_path)
        .map_err(|e| {
            error!("Failed to load language configurations: {}", e);
            e
        })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    // Built once, shared by every run
    let backend = backend::from_config(&config)
        .await
        .with_context(|| format!("Failed to initialize {:?} isolation backend", config.backend))?;

    let executor = Arc::new(Executor::new(
        backend,
        languages,
        ExecutorSettings::from_config(&config),
    ));
    let judge = Arc::new(Judge::new(executor, ProblemStore::new(&config.problems_root)));

    let client = redis::Client::open(config.redis_url.as_str())?;
    // Two connections: the blocking pop gets one to itself
    let conn = ConnectionManager::new(client.clone()).await?;
    let mut source = RedisIntake::new(ConnectionManager::new(client).await?);
    info!("Connected to Redis: {}", config.redis_url);

    let store = Arc::new(RedisStore::new(conn.clone(), config.result_ttl_secs));
    let runner = JobRunner::start(judge, store, config.workers, config.queue_capacity);

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received shutdown signal, draining queue...");
                let _ = stop.send(true);
            }
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl-C handler");
                // Keep the sender alive so intake keeps running
                std::future::pending::<()>().await;
            }
        }
    });

    intake::intake_loop(&mut source, RedisReplies::new(conn), &runner, shutdown).await;

    runner.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
