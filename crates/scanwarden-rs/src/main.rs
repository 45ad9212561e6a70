use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use scanwarden::{
    api::{router, AppState},
    cache::ResultCache,
    config::AppConfig,
    db::{self, Database, SettingsStore},
    executor::JobExecutor,
    notify::TelegramNotifier,
    runner::TokioProcessRunner,
    scheduler::Scheduler,
    telemetry::init_tracing,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let database = Database::new(pool);

    let interrupted = database.fail_interrupted_jobs().await?;
    if interrupted > 0 {
        warn!(count = interrupted, "jobs left running by a previous process were marked failed");
    }

    let cache = Arc::new(ResultCache::default());
    let runner = Arc::new(TokioProcessRunner::new(config.allowed_binaries()));
    let executor = JobExecutor::new(database.clone(), runner, cache.clone(), config.executor_config());

    let store: Arc<dyn SettingsStore> = Arc::new(database);
    let notifier = Arc::new(TelegramNotifier::new(store.clone()));
    let scheduler = Scheduler::new(store, executor.clone(), notifier).with_offset(*Local::now().offset());

    let shutdown = CancellationToken::new();
    tokio::spawn(scheduler.clone().run_loop(config.tick_interval(), shutdown.clone()));

    let state = AppState {
        executor,
        scheduler,
        cache,
        config: config.clone(),
        shutdown: shutdown.clone(),
    };

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "scanwarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for shutdown signal");
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
