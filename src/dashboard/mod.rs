use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::manager::actor::CoreHandle;
use crate::manager::protocol::{Ack, QUEUE_FULL};

/// HTTP view of the Manager: the status snapshot and job intake.
pub fn router(core: CoreHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/jobs", post(submit_handler))
        .layer(cors)
        .with_state(core)
}

pub async fn run_dashboard(listener: TcpListener, core: CoreHandle, token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Starting dashboard server");
    }

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, router(core))
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(Ack::error("manager is shutting down")),
    )
        .into_response()
}

async fn status_handler(State(core): State<CoreHandle>) -> Response {
    match core.status().await {
        Ok(status) => Json(status).into_response(),
        Err(_) => unavailable(),
    }
}

async fn submit_handler(State(core): State<CoreHandle>, body: Bytes) -> Response {
    let ack = match core.submit(body).await {
        Ok(ack) => ack,
        Err(_) => return unavailable(),
    };

    let code = if !ack.is_error() {
        StatusCode::OK
    } else if ack.reason.as_deref() == Some(QUEUE_FULL) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_REQUEST
    };
    (code, Json(ack)).into_response()
}
