//! Server side of the node-to-node HTTP hop.
//!
//! Routes:
//! - `POST /v1/remote`: MsgPack [`RemoteMessage`] body. Answers 202 once a
//!   tell is queued and 200 once an ask is processed.
//! - `GET /health`: node address, members, and registered roles as JSON.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use apm_core::{DispatchMode, RemoteMessage};
use bytes::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use super::transport::REMOTE_PATH;
use crate::error::WorkerError;
use crate::worker::ClusterWorkerContext;

/// Largest accepted request body. A record is a few hundred bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct RemoteState {
    context: Arc<ClusterWorkerContext>,
    start_time: Instant,
}

/// Builds the router peers deliver records to.
pub fn remote_router(context: Arc<ClusterWorkerContext>, max_body_bytes: usize) -> Router {
    let state = RemoteState {
        context,
        start_time: Instant::now(),
    };
    Router::new()
        .route(REMOTE_PATH, post(remote_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves [`remote_router`] on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server hits a fatal I/O error.
pub async fn serve(
    listener: TcpListener,
    context: Arc<ClusterWorkerContext>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "serving remote dispatch");
    let router = remote_router(context, DEFAULT_MAX_BODY_BYTES);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn remote_handler(State(state): State<RemoteState>, body: Bytes) -> Response {
    let message = match RemoteMessage::decode(&body) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "rejecting undecodable remote message");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    let mode = message.mode;
    match state.context.receive(message).await {
        Ok(()) if mode == DispatchMode::Tell => StatusCode::ACCEPTED.into_response(),
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (status_for(&err), err.to_string()).into_response(),
    }
}

fn status_for(err: &WorkerError) -> StatusCode {
    match err {
        WorkerError::WorkerNotFound { .. } => StatusCode::NOT_FOUND,
        WorkerError::Wire(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health_handler(State(state): State<RemoteState>) -> Json<serde_json::Value> {
    let context = &state.context;
    Json(json!({
        "address": context.local_address().to_string(),
        "members": context.members().len(),
        "roles": context.role_names(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
