use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod pagination;
mod validation;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};


use workflows::{
    ActionRegistry, HttpMessageGateway, PgAudienceResolver, PgCouponService, PgNotificationCreator,
    PgWorkflowStore, WorkflowEngine, WorkflowService,
};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub service: Arc<WorkflowService>,
    pub engine: Arc<WorkflowEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url, database::PoolConfig::from_env()).await?;

    database::migrate(&db_pool).await?;

    if !config.message_gateway.is_configured() {
        tracing::warn!("MESSAGE_GATEWAY_URL is not set; message actions will fail");
    }

    let store = Arc::new(PgWorkflowStore::new(db_pool.clone()));
    let dispatcher = Arc::new(ActionRegistry::standard(
        Arc::new(HttpMessageGateway::new(&config.message_gateway)?),
        Arc::new(PgCouponService::new(db_pool.clone())),
        Arc::new(PgNotificationCreator::new(db_pool.clone())),
    ));
    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(PgAudienceResolver::new(db_pool.clone())),
        dispatcher,
        &config.workflow,
    ));
    let service = Arc::new(WorkflowService::new(store.clone(), store, engine.clock()));

    let mut scheduler =
        jobs::JobScheduler::new(engine.clone(), jobs::JobConfig::from(&config.workflow)).await?;
    scheduler.start().await?;
    // Catch up slots missed while the server was down
    if let Err(e) = scheduler.run_job_now(jobs::WORKFLOW_TICK_JOB).await {
        tracing::warn!("Startup workflow tick failed: {}", e);
    }

    let app_state = Arc::new(AppState { db_pool, service, engine });
    let app = handlers::api_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
