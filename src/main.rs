use nucleus::internal::{
    api::{create_router, AppState},
    config::KernelConfig,
    kernel::Kernel,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ADDR: &str = "127.0.0.1:8787";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "nucleus=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = KernelConfig::load();
    let kernel = Kernel::from_config(&config)?;

    let mut state = AppState::new(kernel);
    if let Ok(token) = std::env::var("NUCLEUS_API_TOKEN") {
        state = state.with_bearer_token(token);
    }
    let app = create_router(state).layer(CorsLayer::permissive());

    let addr: SocketAddr = std::env::var("NUCLEUS_API_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;
    tracing::info!("nucleus kernel API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
