use std::sync::Arc;

use driver_dispatch::api;
use driver_dispatch::config::Config;
use driver_dispatch::engine::session::SessionDeps;
use driver_dispatch::error::AppError;
use driver_dispatch::observability::metrics::Metrics;
use driver_dispatch::repository::http::HttpOrderRepository;
use driver_dispatch::state::AppState;
use driver_dispatch::transport::ws::WsTransportFactory;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let repository = HttpOrderRepository::new(
        config.dispatch_api_url.clone(),
        config.api_token.clone(),
        config.session.request_timeout,
    )?;

    let metrics = Arc::new(Metrics::new());
    let transports = WsTransportFactory {
        base_url: config.dispatch_socket_url.clone(),
        token: config.api_token.clone(),
        policy: config.session.reconnect.clone(),
        metrics: metrics.clone(),
    };

    let shared_state = Arc::new(AppState::new(
        SessionDeps {
            repository: Arc::new(repository),
            transports: Arc::new(transports),
        },
        config.session.clone(),
        metrics,
    ));

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        dispatch_api = %config.dispatch_api_url,
        dispatch_socket = %config.dispatch_socket_url,
        "driver dispatch started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.close_all().await;
    tracing::info!("all driver sessions closed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
