//! HTTP gateway: the OpenAI-compatible `/v1` surface.
//!
//! Serves:
//! - `POST /v1/chat/completions` — passthrough chat (JSON or SSE)
//! - `POST /v1/responses` and friends — the responses surface
//! - `GET /v1/models` + the model control plane
//! - `GET /healthz`

pub mod auth;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::cache::CacheService;
use crate::control::ControlPlane;
use crate::responses::ResponsesService;
use crate::router::InferenceRouter;
use crate::stream::InFlight;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ResponsesService>,
    pub router: Arc<InferenceRouter>,
    pub control: Arc<ControlPlane>,
    pub cache: Arc<dyn CacheService>,
    pub keys: Arc<auth::KeyTable>,
    /// Gateway-wide shutdown token; every stream session derives its
    /// cancel token from it.
    pub shutdown: CancellationToken,
    /// Live streaming sessions, drained before shutdown completes.
    pub in_flight: InFlight,
}

/// Handle returned by [`start_gateway`].
pub struct Gateway {
    /// Server task handle.
    pub handle: JoinHandle<()>,
    /// The address the server is actually listening on.
    pub addr: SocketAddr,
}

/// Assemble the `/v1` router with auth and CORS applied.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat/completions", post(handlers::chat::chat_completions))
        .route("/responses", post(handlers::responses::create_response))
        .route(
            "/responses/:response_id",
            get(handlers::responses::get_response).delete(handlers::responses::delete_response),
        )
        .route(
            "/responses/:response_id/cancel",
            post(handlers::responses::cancel_response),
        )
        .route(
            "/responses/:response_id/input_items",
            get(handlers::responses::list_input_items),
        )
        .route(
            "/models",
            get(handlers::models::list_models).post(handlers::models::create_model),
        )
        .route("/models/status", get(handlers::models::models_status))
        .route("/models/gpus", get(handlers::models::gpu_resources))
        .route(
            "/models/:model_name",
            axum::routing::delete(handlers::models::delete_model),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .nest("/v1", api)
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve. Pass port 0 for an ephemeral port; the bound
/// address is returned on the handle.
pub async fn start_gateway(addr: SocketAddr, state: AppState) -> std::io::Result<Gateway> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {e}");
        }
    });

    info!(%bound_addr, "gateway started");

    Ok(Gateway {
        handle,
        addr: bound_addr,
    })
}
