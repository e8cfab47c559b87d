//! JSON-over-HTTP transport: one POST route per RPC.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::post;
use axum::{Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use treefed_proto::{
    routes, ConnectedClientsResponse, GlobalModelRequest, GlobalModelResponse, JoinRequest, JoinResponse,
    ModelInfoResponse, ResetSessionResponse, ServerStatusResponse, SubmitMetricsRequest, SubmitMetricsResponse,
    SubmitWeightsRequest, SubmitWeightsResponse, TrainingStatsResponse,
};

use crate::{CallContext, FederatedLearningService};

/// Upper bound on one request body; base64 inflates a maximal payload by a third.
pub const MAX_REQUEST_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listen address {addr}: {source}")]
    Address { addr: String, source: std::net::AddrParseError },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },
    #[error("rpc server failed: {0}")]
    Serve(#[source] std::io::Error),
}

pub fn router(service: FederatedLearningService) -> Router {
    Router::new()
        .route(routes::JOIN_TRAINING, post(join_training))
        .route(routes::SEND_MODEL_WEIGHTS, post(send_model_weights))
        .route(routes::GET_GLOBAL_MODEL, post(get_global_model))
        .route(routes::SEND_METRICS, post(send_metrics))
        .route(routes::GET_SERVER_STATUS, post(get_server_status))
        .route(routes::GET_CONNECTED_CLIENTS, post(get_connected_clients))
        .route(routes::GET_TRAINING_STATS, post(get_training_stats))
        .route(routes::GET_MODEL_INFO, post(get_model_info))
        .route(routes::RESET_SESSION, post(reset_session))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(service)
}

pub async fn bind(addr: &str) -> Result<TcpListener, TransportError> {
    let addr: SocketAddr =
        addr.parse().map_err(|source| TransportError::Address { addr: addr.to_string(), source })?;
    TcpListener::bind(addr).await.map_err(|source| TransportError::Bind { addr, source })
}

/// Serves the RPC routes until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: FederatedLearningService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), TransportError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "rpc_server_listening");
    }
    axum::serve(listener, router(service)).with_graceful_shutdown(shutdown).await.map_err(TransportError::Serve)
}

async fn join_training(State(svc): State<FederatedLearningService>, Json(req): Json<JoinRequest>) -> Json<JoinResponse> {
    Json(svc.join(req))
}

async fn send_model_weights(
    State(svc): State<FederatedLearningService>,
    Json(req): Json<SubmitWeightsRequest>,
) -> Json<SubmitWeightsResponse> {
    Json(svc.submit_weights(req))
}

/// Runs the barrier in its own task. If the peer hangs up, hyper drops this
/// future and the guard cancels the call context the task is watching.
async fn get_global_model(
    State(svc): State<FederatedLearningService>,
    Json(req): Json<GlobalModelRequest>,
) -> Json<GlobalModelResponse> {
    let ctx = CallContext::new();
    let _cancel = ctx.cancel_on_drop();
    let task = tokio::spawn(async move { svc.request_global_model(req, ctx).await });
    match task.await {
        Ok(resp) => Json(resp),
        Err(e) => {
            error!(error = %e, "global_model_task_failed");
            Json(GlobalModelResponse::failure())
        }
    }
}

async fn send_metrics(
    State(svc): State<FederatedLearningService>,
    Json(req): Json<SubmitMetricsRequest>,
) -> Json<SubmitMetricsResponse> {
    Json(svc.submit_metrics(req))
}

async fn get_server_status(State(svc): State<FederatedLearningService>) -> Json<ServerStatusResponse> {
    Json(svc.server_status())
}

async fn get_connected_clients(State(svc): State<FederatedLearningService>) -> Json<ConnectedClientsResponse> {
    Json(svc.connected_clients())
}

async fn get_training_stats(State(svc): State<FederatedLearningService>) -> Json<TrainingStatsResponse> {
    Json(svc.training_stats())
}

async fn get_model_info(State(svc): State<FederatedLearningService>) -> Json<ModelInfoResponse> {
    Json(svc.model_info())
}

async fn reset_session(State(svc): State<FederatedLearningService>) -> Json<ResetSessionResponse> {
    Json(svc.reset_session())
}
