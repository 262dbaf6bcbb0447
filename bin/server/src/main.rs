use flowdeck_server::{
    config::ServerConfig,
    db::{PgFlowStore, PgRunLog, PgRunStore},
    routes,
    state::AppState,
};
use flowdeck_workflow::{
    FlowService, FlowStore, HttpToolService, InMemoryFlowStore, InMemoryRunLog, InMemoryRunStore,
    InMemoryUserDirectory, RunLogRecorder, RunStore,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Stores = (
    Arc<dyn FlowStore>,
    Arc<dyn RunStore>,
    Arc<dyn RunLogRecorder>,
);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let (flows, runs, run_log) = match &config.database_url {
        Some(database_url) => postgres_stores(database_url).await,
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            memory_stores()
        }
    };

    let service = Arc::new(FlowService::new(
        flows,
        runs,
        run_log,
        Arc::new(InMemoryUserDirectory::new()),
        Arc::new(HttpToolService::new(config.tool_service.base_url.clone())),
        config.engine.clone(),
    ));
    let app = routes::router(Arc::new(AppState::new(service.clone())));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down, cancelling active runs");
            service.shutdown().await;
        })
        .await
        .expect("server error");
}

async fn postgres_stores(database_url: &str) -> Stores {
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .expect("failed to connect to database");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    (
        Arc::new(PgFlowStore::new(db_pool.clone())),
        Arc::new(PgRunStore::new(db_pool.clone())),
        Arc::new(PgRunLog::new(db_pool)),
    )
}

fn memory_stores() -> Stores {
    (
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryRunStore::new()),
        Arc::new(InMemoryRunLog::new()),
    )
}
