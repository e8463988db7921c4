//! HTTP transport: thin mapping between the wire and the control plane.

mod routes;
mod state;

pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::control::ControlPlane;
use crate::errors::GatewayResult;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/verify/natural_language", post(routes::verify_natural_language))
        .route("/verify/logic", post(routes::verify_logic))
        .route("/verify/stats", post(routes::verify_stats))
        .route("/verify/fact", post(routes::verify_fact))
        .route("/verify/code", post(routes::verify_code))
        .route("/verify/sql", post(routes::verify_sql))
        .route("/verify/image", post(routes::verify_image))
        .route("/verify/reasoning", post(routes::verify_reasoning))
        .route("/verify/consensus", post(routes::verify_consensus))
        .route("/agents/register", post(routes::register_agent))
        .route("/agents/:id/verify", post(routes::agent_verify))
        .route("/history", get(routes::history))
        .route("/metrics", get(routes::global_metrics))
        .route("/metrics/:org_id", get(routes::tenant_metrics))
        .route("/attestation/keys", get(routes::attestation_keys))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(control: Arc<ControlPlane>, listen_addr: &str) -> GatewayResult<()> {
    let max_inflight = control.config().max_inflight;
    let state = AppState::new(control, max_inflight);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|err| crate::errors::GatewayError::Internal(format!("bind failed: {err}")))?;
    info!(addr = %listen_addr, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| crate::errors::GatewayError::Internal(format!("server failed: {err}")))
}
