use axum::{Json, Router, extract::State, routing::post};
use openraft::error::RaftError;
use tracing::debug;

use crate::{
    command::CommandEnvelope,
    raft::types::{CommandResponse, NodeId, TypeConfig},
};

#[derive(Clone)]
pub struct RaftRpcState {
    pub raft: openraft::Raft<TypeConfig>,
}

/// Routes peers call: the three Raft RPCs plus `/raft/propose`, which followers
/// use to hand a client proposal to the leader.
pub fn build_raft_rpc_router(state: RaftRpcState) -> Router {
    Router::new()
        .route("/raft/append", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/snapshot", post(install_snapshot))
        .route("/raft/propose", post(propose))
        .with_state(state)
}

async fn append_entries(
    State(state): State<RaftRpcState>,
    Json(req): Json<openraft::raft::AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<openraft::raft::AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.raft.append_entries(req).await)
}

async fn vote(
    State(state): State<RaftRpcState>,
    Json(req): Json<openraft::raft::VoteRequest<NodeId>>,
) -> Json<Result<openraft::raft::VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.raft.vote(req).await)
}

async fn install_snapshot(
    State(state): State<RaftRpcState>,
    Json(req): Json<openraft::raft::InstallSnapshotRequest<TypeConfig>>,
) -> Json<
    Result<
        openraft::raft::InstallSnapshotResponse<NodeId>,
        RaftError<NodeId, openraft::error::InstallSnapshotError>,
    >,
> {
    Json(state.raft.install_snapshot(req).await)
}

/// Never forwards again: a node that lost leadership in between reports it.
async fn propose(
    State(state): State<RaftRpcState>,
    Json(envelope): Json<CommandEnvelope>,
) -> Json<Result<CommandResponse, String>> {
    debug!(command = %envelope.name, "proposal forwarded by follower");
    Json(
        state
            .raft
            .client_write(envelope)
            .await
            .map(|resp| resp.data)
            .map_err(|e| e.to_string()),
    )
}
