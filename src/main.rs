use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use webhook_pipeline::{
    config::{PipelineConfig, ServerConfig},
    handlers,
    orchestrator::WebhookOrchestrator,
    processor::{EventProcessor, LoggingProcessor},
    state::AppState,
    store::SqliteStore,
    sweeper::Sweeper,
    verifier::SvixVerifier,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = ServerConfig::from_env();
    let pipeline = PipelineConfig::from_env();

    let secret = server
        .signing_secret
        .as_deref()
        .ok_or("WEBHOOK_SIGNING_SECRET must be set")?;
    let verifier = Arc::new(SvixVerifier::new(secret)?);

    let store = Arc::new(SqliteStore::connect(&server.database_url).await?);
    let sweeper_config = pipeline.sweeper.clone();
    let orchestrator = Arc::new(WebhookOrchestrator::new(pipeline, store, verifier));
    let processor: Arc<dyn EventProcessor> = Arc::new(LoggingProcessor);

    if server.admin_token.is_none() {
        tracing::warn!("WEBHOOK_ADMIN_TOKEN not set, admin API is unauthenticated");
    }

    let sweeper = Sweeper::start(
        Arc::clone(&orchestrator),
        Arc::clone(&processor),
        sweeper_config,
    );

    let state = AppState {
        orchestrator,
        processor,
        admin_token: server.admin_token,
    };
    let app = handlers::router(state);

    let addr: SocketAddr = server.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, database_url = %server.database_url, "webhook pipeline listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    sweeper.shutdown().await;
    Ok(())
}
