//! Replicated commands: the only way cluster metadata changes.
//!
//! A command is proposed on one node, written to the Raft log as a
//! [`CommandEnvelope`], decoded through the [`registry`] on every replica and applied
//! in log order against the replica's own configuration store.

pub mod join;
pub mod metadata;
pub mod registry;

use std::fmt::Debug;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{domain::NewShardData, state::ClusterConfigStore};

pub use join::{ConsensusServer, JoinCommand, MembershipError, Peer};
pub use metadata::{
    AddPotentialServerCommand, ChangeDbUserPasswordCommand, CreateContinuousQueryCommand,
    CreateDatabaseCommand, CreateShardsCommand, DeleteContinuousQueryCommand, DropDatabaseCommand,
    DropShardCommand, SaveClusterAdminCommand, SaveDbUserCommand,
    SetContinuousQueryTimestampCommand,
};
pub use registry::{
    CommandEnvelope, CommandRegistry, DecodeError, RegistryError, init_registry, registry,
};

/// A named, serializable mutation of cluster state.
pub trait Command: Clone + Debug + Serialize + DeserializeOwned + Into<ClusterCommand> {
    /// Wire tag and registry key. Historical log entries carry it, so it never changes.
    const NAME: &'static str;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Must depend only on the payload and the state reachable through `ctx`.
    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError>;

    fn encode(&self) -> Result<CommandEnvelope, serde_json::Error> {
        Ok(CommandEnvelope {
            name: Self::NAME.to_string(),
            payload: serde_json::to_value(self)?,
        })
    }
}

/// Everything a command may touch while being applied.
pub struct ApplyContext<'a> {
    pub config: &'a mut dyn ClusterConfigStore,
    pub server: &'a mut dyn ConsensusServer,
}

/// Result handed back to the proposer. Other replicas drop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandOutput {
    Applied,
    Shards { shards: Vec<NewShardData> },
    Joined { peer: Peer },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    Domain(crate::domain::DomainError),
    Membership(MembershipError),
}

impl ApplyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Domain(e) => e.code(),
            Self::Membership(e) => e.code(),
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{e}"),
            Self::Membership(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Membership(e) => Some(e),
        }
    }
}

impl From<crate::domain::DomainError> for ApplyError {
    fn from(value: crate::domain::DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<MembershipError> for ApplyError {
    fn from(value: MembershipError) -> Self {
        Self::Membership(value)
    }
}

/// Closed set of every command that may appear in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommand {
    CreateDatabase(CreateDatabaseCommand),
    DropDatabase(DropDatabaseCommand),
    SaveDbUser(SaveDbUserCommand),
    ChangeDbUserPassword(ChangeDbUserPasswordCommand),
    SaveClusterAdmin(SaveClusterAdminCommand),
    AddPotentialServer(AddPotentialServerCommand),
    CreateContinuousQuery(CreateContinuousQueryCommand),
    DeleteContinuousQuery(DeleteContinuousQueryCommand),
    SetContinuousQueryTimestamp(SetContinuousQueryTimestampCommand),
    CreateShards(CreateShardsCommand),
    DropShard(DropShardCommand),
    Join(JoinCommand),
}

impl ClusterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateDatabase(c) => c.name(),
            Self::DropDatabase(c) => c.name(),
            Self::SaveDbUser(c) => c.name(),
            Self::ChangeDbUserPassword(c) => c.name(),
            Self::SaveClusterAdmin(c) => c.name(),
            Self::AddPotentialServer(c) => c.name(),
            Self::CreateContinuousQuery(c) => c.name(),
            Self::DeleteContinuousQuery(c) => c.name(),
            Self::SetContinuousQueryTimestamp(c) => c.name(),
            Self::CreateShards(c) => c.name(),
            Self::DropShard(c) => c.name(),
            Self::Join(c) => c.name(),
        }
    }

    pub fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        match self {
            Self::CreateDatabase(c) => c.apply(ctx),
            Self::DropDatabase(c) => c.apply(ctx),
            Self::SaveDbUser(c) => c.apply(ctx),
            Self::ChangeDbUserPassword(c) => c.apply(ctx),
            Self::SaveClusterAdmin(c) => c.apply(ctx),
            Self::AddPotentialServer(c) => c.apply(ctx),
            Self::CreateContinuousQuery(c) => c.apply(ctx),
            Self::DeleteContinuousQuery(c) => c.apply(ctx),
            Self::SetContinuousQueryTimestamp(c) => c.apply(ctx),
            Self::CreateShards(c) => c.apply(ctx),
            Self::DropShard(c) => c.apply(ctx),
            Self::Join(c) => c.apply(ctx),
        }
    }

    pub fn encode(&self) -> Result<CommandEnvelope, serde_json::Error> {
        match self {
            Self::CreateDatabase(c) => c.encode(),
            Self::DropDatabase(c) => c.encode(),
            Self::SaveDbUser(c) => c.encode(),
            Self::ChangeDbUserPassword(c) => c.encode(),
            Self::SaveClusterAdmin(c) => c.encode(),
            Self::AddPotentialServer(c) => c.encode(),
            Self::CreateContinuousQuery(c) => c.encode(),
            Self::DeleteContinuousQuery(c) => c.encode(),
            Self::SetContinuousQueryTimestamp(c) => c.encode(),
            Self::CreateShards(c) => c.encode(),
            Self::DropShard(c) => c.encode(),
            Self::Join(c) => c.encode(),
        }
    }

    /// True for the one command allowed to change consensus membership.
    pub fn is_membership_change(&self) -> bool {
        matches!(self, Self::Join(_))
    }
}
