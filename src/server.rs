/// Server setup and initialization
///
/// Wires together all components: storage, registry, execution store, engine,
/// worker pool, backoff controller, feature flags, cron scheduler and HTTP routes.

use crate::{
    api::{create_router, AppState},
    config::Config,
    runtime::{
        backoff::{BackoffController, SqliteBackoffStore},
        engine::Engine,
        executor::BuiltinNodeRegistry,
        flags::StaticFeatureFlags,
        pause::PauseHub,
        queue::{JobQueue, WorkerPool},
        scheduler::{CronSchedulerService, TriggerRunner},
    },
    store::{database, SqliteExecutionStore},
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Create the main Axum application with all routes
///
/// Also starts the cron scheduler and relaunches jobs a previous process left
/// unfinished, so the returned router fronts a fully running engine.
pub async fn create_app(config: Config) -> Result<Router> {
    let pool = database::connect(&config.database.path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    tracing::info!("📋 Initializing schemas");
    let workflow_storage = WorkflowStorage::new(pool.clone());
    workflow_storage.init_schema().await?;
    let execution_store = SqliteExecutionStore::new(pool.clone());
    execution_store.init_schema().await?;
    let backoff_store = SqliteBackoffStore::new(pool.clone());
    backoff_store.init_schema().await?;
    let job_queue = JobQueue::new(pool.clone());
    job_queue.init_schema().await?;

    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(workflow_storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(Engine::new(
        Arc::new(execution_store),
        Arc::new(BuiltinNodeRegistry::new()),
        Arc::new(PauseHub::new(config.engine.pause_timeout())),
    ));
    let worker_pool = Arc::new(WorkerPool::new(
        engine,
        Some(job_queue),
        config.engine.max_concurrent_executions,
    ));

    let relaunched = worker_pool.recover(registry.clone()).await?;
    if relaunched > 0 {
        tracing::info!("♻️ Relaunched {} unfinished execution jobs", relaunched);
    }

    tracing::info!("⏰ Initializing cron scheduler service");
    let backoff = Arc::new(BackoffController::new(Arc::new(backoff_store), config.backoff.clone()));
    let flags = Arc::new(StaticFeatureFlags::new(config.feature_flags.clone()));
    let runner = Arc::new(TriggerRunner::new(
        registry.clone(),
        Arc::clone(&worker_pool),
        backoff,
        flags,
    ));
    let scheduler = Arc::new(
        CronSchedulerService::new(
            runner,
            config.scheduler.reconcile_interval(),
            config.scheduler.job_retention_days,
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );
    scheduler.start().await?;

    let state = AppState {
        registry,
        storage: Some(workflow_storage),
        pool: worker_pool,
        scheduler: Some(scheduler),
    };

    tracing::info!("📡 Creating HTTP router");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_router(state));

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowrun server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
