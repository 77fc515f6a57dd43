use serde::{Deserialize, Serialize};

use super::{ApplyContext, ApplyError, ClusterCommand, Command, CommandOutput};
use crate::raft::types::NodeId;

/// Consensus-side primitives a command may use while applied.
///
/// Only [`JoinCommand`] calls [`ConsensusServer::add_peer`]; every other command stays
/// inside the configuration store.
pub trait ConsensusServer {
    /// Local node name, for logging.
    fn name(&self) -> &str;

    fn add_peer(
        &mut self,
        name: &str,
        connection_string: &str,
        protobuf_connection_string: &str,
    ) -> Result<Peer, MembershipError>;
}

/// A voting member admitted through the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: NodeId,
    pub name: String,
    pub connection_string: String,
    pub protobuf_connection_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    InvalidPeerName {
        name: String,
    },
    PeerConflict {
        name: String,
        existing_connection_string: String,
    },
    NodeIdsExhausted,
}

impl MembershipError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPeerName { .. } => "invalid_request",
            Self::PeerConflict { .. } | Self::NodeIdsExhausted => "conflict",
        }
    }
}

impl std::fmt::Display for MembershipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPeerName { name } => write!(f, "invalid peer name: {name:?}"),
            Self::PeerConflict {
                name,
                existing_connection_string,
            } => write!(
                f,
                "peer {name} already joined with connection string {existing_connection_string}"
            ),
            Self::NodeIdsExhausted => write!(f, "no node id left to assign"),
        }
    }
}

impl std::error::Error for MembershipError {}

/// Admits a node to the consensus group. The name is the peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCommand {
    pub name: String,
    pub connection_string: String,
    #[serde(default)]
    pub protobuf_connection_string: String,
}

impl JoinCommand {
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        protobuf_connection_string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            protobuf_connection_string: protobuf_connection_string.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.name
    }
}

impl Command for JoinCommand {
    const NAME: &'static str = "raft:join";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        let peer = ctx.server.add_peer(
            &self.name,
            &self.connection_string,
            &self.protobuf_connection_string,
        )?;
        Ok(CommandOutput::Joined { peer })
    }
}

impl From<JoinCommand> for ClusterCommand {
    fn from(value: JoinCommand) -> Self {
        Self::Join(value)
    }
}
