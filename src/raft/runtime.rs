use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::RwLock;

use crate::{
    raft::{
        app::RealRaft,
        membership::{MembershipHandle, WorkerOptions, spawn_membership_worker},
        network_http::HttpNetworkFactory,
        storage::{FileLogStore, FileStateMachine},
        types::{NodeId, TypeConfig},
    },
    state::ClusterStore,
};

/// Timing and identity for one Raft node.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub cluster_name: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub heartbeat_interval: Duration,
    pub propose_timeout: Duration,
}

impl RaftOptions {
    /// Election timeouts scale with the heartbeat so a slow link does not cause
    /// constant re-elections.
    fn openraft_config(&self) -> anyhow::Result<openraft::Config> {
        let heartbeat = u64::try_from(self.heartbeat_interval.as_millis())
            .context("heartbeat interval out of range")?;
        openraft::Config {
            cluster_name: self.cluster_name.clone(),
            heartbeat_interval: heartbeat,
            election_timeout_min: heartbeat * 3,
            election_timeout_max: heartbeat * 6,
            install_snapshot_timeout: heartbeat.max(200) * 15,
            ..Default::default()
        }
        .validate()
        .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))
    }

    /// A pending peer is retried every few heartbeats; one admission may take as
    /// long as a proposal.
    fn membership_worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            retry_interval: (self.heartbeat_interval * 5).max(Duration::from_millis(250)),
            admit_timeout: self.propose_timeout,
        }
    }
}

/// Opens the stores, starts the Raft core and its membership worker.
pub async fn start_raft(
    data_dir: &Path,
    options: &RaftOptions,
    store: Arc<RwLock<ClusterStore>>,
    network: HttpNetworkFactory,
) -> anyhow::Result<RealRaft> {
    let config = Arc::new(options.openraft_config()?);

    let (membership, peer_updates) = MembershipHandle::channel();
    let log_store = FileLogStore::open(data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let state_machine =
        FileStateMachine::open(data_dir, options.node_name.clone(), store, membership)
            .await
            .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft = openraft::Raft::<TypeConfig>::new(
        options.node_id,
        config,
        network,
        log_store,
        state_machine,
    )
    .await
    .context("start raft")?;

    spawn_membership_worker(
        raft.clone(),
        options.node_id,
        peer_updates,
        options.membership_worker_options(),
    );

    // Cluster bootstrap is left to the caller.
    Ok(RealRaft::new(raft, options.propose_timeout))
}
