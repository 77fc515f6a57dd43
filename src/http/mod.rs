use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    command::{ClusterCommand, CommandEnvelope, CommandOutput, JoinCommand, registry},
    raft::{
        app::{ProposeError, RaftFacade},
        http_rpc::{RaftRpcState, build_raft_rpc_router},
        types::{CommandResponse, NodeId, TypeConfig},
    },
    state::{ClusterConfiguration, ClusterStore},
};

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AppState {
    pub node_id: NodeId,
    pub node_name: String,
    pub store: Arc<RwLock<ClusterStore>>,
    pub raft: Arc<dyn RaftFacade>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Maps the stable code carried by [`CommandResponse::Err`].
    fn from_apply_code(code: &str, message: String) -> Self {
        match code {
            "invalid_request" => Self::invalid_request(message),
            "not_found" => Self::not_found(message),
            "conflict" => Self::conflict(message),
            _ => Self::internal(message),
        }
    }
}

impl From<ProposeError> for ApiError {
    fn from(value: ProposeError) -> Self {
        let status = match &value {
            ProposeError::Encode(_) => StatusCode::BAD_REQUEST,
            ProposeError::NoLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProposeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProposeError::Forward(_) => StatusCode::BAD_GATEWAY,
            ProposeError::Raft(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(value.code(), status, value.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    name: String,
    connection_string: String,
    #[serde(default)]
    protobuf_connection_string: String,
}

#[derive(Debug, Serialize)]
struct ClusterInfoResponse {
    node_id: NodeId,
    node_name: String,
    role: &'static str,
    leader_id: Option<NodeId>,
    term: u64,
    last_applied_index: Option<u64>,
}

/// Public API under `/api`; with `raft_rpc` the peer-facing `/raft/*` routes are
/// served from the same listener.
pub fn build_router(state: AppState, raft_rpc: Option<openraft::Raft<TypeConfig>>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/cluster/info", get(cluster_info))
        .route("/cluster/config", get(cluster_config))
        .route("/cluster/join", post(cluster_join))
        .route("/commands", get(list_commands).post(submit_command))
        .fallback(fallback_not_found);

    let mut app = Router::new().nest("/api", api);
    if let Some(raft) = raft_rpc {
        app = app.merge(build_raft_rpc_router(RaftRpcState { raft }));
    }
    app.layer(Extension(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn cluster_info(Extension(state): Extension<AppState>) -> Json<ClusterInfoResponse> {
    let metrics = state.raft.metrics().borrow().clone();
    let role = match metrics.state {
        openraft::ServerState::Leader => "leader",
        openraft::ServerState::Candidate => "candidate",
        openraft::ServerState::Learner => "learner",
        _ => "follower",
    };
    Json(ClusterInfoResponse {
        node_id: state.node_id,
        node_name: state.node_name.clone(),
        role,
        leader_id: metrics.current_leader,
        term: metrics.current_term,
        last_applied_index: metrics.last_applied.map(|l| l.index),
    })
}

/// This replica's copy; a follower may briefly lag the leader.
async fn cluster_config(Extension(state): Extension<AppState>) -> Json<ClusterConfiguration> {
    Json(state.store.read().await.config().clone())
}

async fn list_commands() -> Json<Items<&'static str>> {
    Json(Items {
        items: registry().names().collect(),
    })
}

async fn submit_command(
    Extension(state): Extension<AppState>,
    ApiJson(envelope): ApiJson<CommandEnvelope>,
) -> Result<Json<CommandOutput>, ApiError> {
    let cmd = registry()
        .decode(&envelope)
        .map_err(|e| ApiError::invalid_request(e.to_string()))?;
    propose(&state, cmd).await.map(Json)
}

async fn cluster_join(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<CommandOutput>, ApiError> {
    info!(peer = %req.name, connection_string = %req.connection_string, "join requested");
    let cmd = JoinCommand::new(req.name, req.connection_string, req.protobuf_connection_string);
    propose(&state, cmd.into()).await.map(Json)
}

async fn propose(state: &AppState, cmd: ClusterCommand) -> Result<CommandOutput, ApiError> {
    match state.raft.propose(cmd).await? {
        CommandResponse::Ok { output } => Ok(output),
        CommandResponse::Err { code, message } => Err(ApiError::from_apply_code(&code, message)),
    }
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
