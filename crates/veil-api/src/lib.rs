pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// All API routes, nested under `/api`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/metrics", get(handlers::handle_metrics))
        .route("/peers", get(handlers::handle_peers))
        .route("/store", get(handlers::handle_store))
        .route("/transfers", get(handlers::handle_transfers))
        .route("/transfers/cancel", post(handlers::handle_cancel))
        .route("/publish", post(handlers::handle_publish))
        .route(
            "/publish/upload",
            post(handlers::handle_upload).layer(DefaultBodyLimit::max(256 * 1024 * 1024)),
        )
        .route("/fetch", post(handlers::handle_fetch))
        .route("/seed", post(handlers::handle_seed))
        .route("/bootstrap", get(handlers::handle_bootstrap))
        .route("/bootstrap/enable", post(handlers::handle_enable))
        .route("/bootstrap/disable", post(handlers::handle_disable))
        .route("/communities", get(handlers::handle_discover))
        .route("/communities/join", post(handlers::handle_join))
        .route("/communities/joined", get(handlers::handle_joined))
        .route("/communities/leave", post(handlers::handle_leave))
        .route(
            "/settings",
            get(handlers::handle_settings).post(handlers::handle_settings_set),
        )
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
