use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepflow_core::{HandlerRegistry, SystemClock, TaskResult};
use stepflow_engine::{Worker, WorkerConfig};
use stepflow_storage::{ExecutionStore, PostgresExecutionStore, MIGRATOR};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepflow_worker=debug,stepflow_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("stepflow-worker starting...");

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!("Database connection established");

    // Handlers are provided by the embedding host; the bare worker ships a
    // single no-op resource so pipelines can be smoke-tested end to end
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", |input, _ctx| async move { TaskResult::success(input) });

    let store: Arc<dyn ExecutionStore> = Arc::new(PostgresExecutionStore::new(pool));
    let worker = Arc::new(Worker::new(
        store,
        Arc::new(registry),
        Arc::new(SystemClock),
        WorkerConfig::from_env(),
    ));
    worker.start();
    tracing::info!("Worker loops running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    worker.shutdown().await;

    Ok(())
}
