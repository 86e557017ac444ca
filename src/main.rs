// Server entrypoint: storage init, gateway startup, REST + websocket routes.
use anyhow::Context;
use chathub_server::api;
use chathub_server::config::Config;
use chathub_server::gateway::seed_default_gateway;
use chathub_server::shutdown::shutdown_signal;
use chathub_server::state::AppState;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();
    let state = Arc::new(AppState::new(&config)?);

    seed_default_gateway(&state.storage, config.seed_gateway_url.as_deref()).await?;
    state.gateways.start().await?;

    let app = api::build_router(state.clone())
        .layer(build_cors(&config))
        .layer(TraceLayer::new_for_http());

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("chathub server listening on http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("server exited abnormally: {err}");
    }

    state.gateways.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_cors(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match config.cors.allow_origins.as_ref() {
        Some(origins) if origins.iter().any(|value| value == "*") => cors.allow_origin(Any),
        Some(origins) => {
            let values = origins
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            cors.allow_origin(AllowOrigin::list(values))
        }
        None => cors.allow_origin(Any),
    }
}
