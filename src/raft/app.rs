use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Context;
use openraft::{StoredMembership, error::ClientWriteError, error::ForwardToLeader};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::debug;

use crate::{
    command::{ApplyContext, ClusterCommand, CommandEnvelope, Peer, registry},
    raft::{
        membership::PeerTable,
        types::{CommandResponse, NodeId, NodeMeta, TypeConfig},
    },
    state::ClusterStore,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type RaftMetrics = openraft::RaftMetrics<NodeId, NodeMeta>;

#[derive(Debug)]
pub enum ProposeError {
    Encode(serde_json::Error),
    /// No leader is known, or it advertises no address to forward to.
    NoLeader { leader_id: Option<NodeId> },
    /// The entry may still commit; only the wait was abandoned.
    Timeout { after: Duration },
    Forward(String),
    Raft(String),
}

impl ProposeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encode(_) => "invalid_request",
            Self::NoLeader { .. } => "no_leader",
            Self::Timeout { .. } => "timeout",
            Self::Forward(_) => "forward_failed",
            Self::Raft(_) => "internal",
        }
    }
}

impl std::fmt::Display for ProposeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode command: {e}"),
            Self::NoLeader {
                leader_id: Some(id),
            } => write!(f, "leader {id} has no known address"),
            Self::NoLeader { leader_id: None } => write!(f, "no leader elected"),
            Self::Timeout { after } => {
                write!(f, "commit not observed within {}s", after.as_secs())
            }
            Self::Forward(msg) => write!(f, "forward to leader: {msg}"),
            Self::Raft(msg) => write!(f, "raft client_write: {msg}"),
        }
    }
}

impl std::error::Error for ProposeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

/// How the HTTP layer submits commands to the cluster.
pub trait RaftFacade: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<RaftMetrics>;

    /// Appends `cmd` to the log and waits until the local replica applied it.
    fn propose(&self, cmd: ClusterCommand) -> BoxFuture<'_, Result<CommandResponse, ProposeError>>;
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<RaftMetrics>,
    client: reqwest::Client,
    propose_timeout: Duration,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>, propose_timeout: Duration) -> Self {
        let metrics = raft.metrics();
        Self {
            raft,
            metrics,
            client: reqwest::Client::new(),
            propose_timeout,
        }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    pub async fn initialize_single_node_if_needed(
        &self,
        node_id: NodeId,
        node_meta: NodeMeta,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            return Ok(());
        }
        self.raft
            .initialize(BTreeMap::from([(node_id, node_meta)]))
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        Ok(())
    }

    async fn write_or_forward(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<CommandResponse, ProposeError> {
        let err = match self.raft.client_write(envelope.clone()).await {
            Ok(resp) => return Ok(resp.data),
            Err(err) => err,
        };
        let Some(ClientWriteError::ForwardToLeader(forward)) = err.api_error() else {
            return Err(ProposeError::Raft(err.to_string()));
        };

        let metrics = self.metrics.borrow().clone();
        let Some(leader) = leader_raft_endpoint(forward, &metrics) else {
            return Err(ProposeError::NoLeader {
                leader_id: forward.leader_id,
            });
        };
        debug!(leader = %leader, command = %envelope.name, "forwarding proposal to leader");
        forward_propose(&self.client, &leader, &envelope).await
    }
}

impl RaftFacade for RealRaft {
    fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics.clone()
    }

    fn propose(&self, cmd: ClusterCommand) -> BoxFuture<'_, Result<CommandResponse, ProposeError>> {
        Box::pin(async move {
            let envelope = cmd.encode().map_err(ProposeError::Encode)?;
            tokio::time::timeout(self.propose_timeout, self.write_or_forward(envelope))
                .await
                .map_err(|_| ProposeError::Timeout {
                    after: self.propose_timeout,
                })?
        })
    }
}

fn leader_raft_endpoint(
    forward: &ForwardToLeader<NodeId, NodeMeta>,
    metrics: &RaftMetrics,
) -> Option<String> {
    if let Some(node) = forward.leader_node.as_ref()
        && !node.raft_endpoint.is_empty()
    {
        return Some(node.raft_endpoint.clone());
    }
    let leader_id = forward.leader_id.or(metrics.current_leader)?;
    metrics
        .membership_config
        .membership()
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .map(|(_id, node)| node.raft_endpoint.clone())
        .filter(|endpoint| !endpoint.is_empty())
}

async fn forward_propose(
    client: &reqwest::Client,
    leader_base_url: &str,
    envelope: &CommandEnvelope,
) -> Result<CommandResponse, ProposeError> {
    let url = format!("{}/raft/propose", leader_base_url.trim_end_matches('/'));
    let body: Result<CommandResponse, String> = client
        .post(url)
        .json(envelope)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| ProposeError::Forward(e.to_string()))?
        .json()
        .await
        .map_err(|e| ProposeError::Forward(e.to_string()))?;
    body.map_err(ProposeError::Forward)
}

/// Raft facade that applies commands straight to a local store, for router tests.
///
/// Commands still go through encode, registry decode and [`ClusterCommand::apply`],
/// so the observable results match a single-node cluster.
#[derive(Clone)]
pub struct LocalRaft {
    node_name: String,
    store: Arc<RwLock<ClusterStore>>,
    peers: Arc<Mutex<BTreeMap<String, Peer>>>,
    metrics: watch::Receiver<RaftMetrics>,
}

impl LocalRaft {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<RwLock<ClusterStore>>,
        metrics: watch::Receiver<RaftMetrics>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            peers: Arc::new(Mutex::new(BTreeMap::new())),
            metrics,
        }
    }
}

impl RaftFacade for LocalRaft {
    fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics.clone()
    }

    fn propose(&self, cmd: ClusterCommand) -> BoxFuture<'_, Result<CommandResponse, ProposeError>> {
        Box::pin(async move {
            let envelope = cmd.encode().map_err(ProposeError::Encode)?;
            let cmd = registry()
                .decode(&envelope)
                .map_err(|e| ProposeError::Raft(e.to_string()))?;

            let mut peers = self.peers.lock().await;
            let mut store = self.store.write().await;
            let membership = StoredMembership::default();
            let mut server = PeerTable::new(&self.node_name, &mut peers, &membership);
            let mut ctx = ApplyContext {
                config: store.config_mut(),
                server: &mut server,
            };
            let resp = match cmd.apply(&mut ctx) {
                Ok(output) => CommandResponse::Ok { output },
                Err(err) => {
                    return Ok(CommandResponse::Err {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
            };
            store
                .save()
                .map_err(|e| ProposeError::Raft(e.to_string()))?;
            Ok(resp)
        })
    }
}
