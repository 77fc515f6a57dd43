//! Commands that mutate the cluster configuration store.
//!
//! Each one calls exactly one [`ClusterConfigStore`](crate::state::ClusterConfigStore)
//! method with its own fields. JSON field names match what older nodes wrote to the
//! log, which is why some structs are PascalCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ApplyContext, ApplyError, ClusterCommand, Command, CommandOutput};
use crate::domain::{
    ClusterAdmin, ClusterServer, ContinuousQueryId, DbUser, NewShardData, ServerId, ShardId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabaseCommand {
    pub name: String,
    pub replication_factor: u8,
}

impl CreateDatabaseCommand {
    pub fn new(name: impl Into<String>, replication_factor: u8) -> Self {
        Self {
            name: name.into(),
            replication_factor,
        }
    }
}

impl Command for CreateDatabaseCommand {
    const NAME: &'static str = "create_db";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config
            .create_database(&self.name, self.replication_factor)?;
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropDatabaseCommand {
    pub name: String,
}

impl DropDatabaseCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Command for DropDatabaseCommand {
    const NAME: &'static str = "drop_db";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config.drop_database(&self.name)?;
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveDbUserCommand {
    pub user: DbUser,
}

impl SaveDbUserCommand {
    pub fn new(user: DbUser) -> Self {
        Self { user }
    }
}

impl Command for SaveDbUserCommand {
    const NAME: &'static str = "save_db_user";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config.save_db_user(&self.user)?;
        debug!(
            node = ctx.server.name(),
            db = %self.user.db,
            user = %self.user.name,
            deleted = self.user.is_deleted,
            "saved db user"
        );
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeDbUserPasswordCommand {
    pub database: String,
    pub username: String,
    pub hash: String,
}

impl ChangeDbUserPasswordCommand {
    pub fn new(
        database: impl Into<String>,
        username: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            username: username.into(),
            hash: hash.into(),
        }
    }
}

impl Command for ChangeDbUserPasswordCommand {
    const NAME: &'static str = "change_db_user_password";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        debug!(
            node = ctx.server.name(),
            db = %self.database,
            user = %self.username,
            "changing db user password"
        );
        ctx.config
            .change_db_user_password(&self.database, &self.username, &self.hash)?;
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveClusterAdminCommand {
    pub user: ClusterAdmin,
}

impl SaveClusterAdminCommand {
    pub fn new(user: ClusterAdmin) -> Self {
        Self { user }
    }
}

impl Command for SaveClusterAdminCommand {
    const NAME: &'static str = "save_cluster_admin_user";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config.save_cluster_admin(&self.user)?;
        Ok(CommandOutput::Applied)
    }
}

/// Registers a node as a shard owner candidate before it owns any shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddPotentialServerCommand {
    pub server: ClusterServer,
}

impl AddPotentialServerCommand {
    pub fn new(server: ClusterServer) -> Self {
        Self { server }
    }
}

impl Command for AddPotentialServerCommand {
    const NAME: &'static str = "add_server";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config.add_potential_server(&self.server)?;
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContinuousQueryCommand {
    pub database: String,
    pub query: String,
}

impl CreateContinuousQueryCommand {
    pub fn new(database: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            query: query.into(),
        }
    }
}

impl Command for CreateContinuousQueryCommand {
    const NAME: &'static str = "create_cq";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config
            .create_continuous_query(&self.database, &self.query)?;
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteContinuousQueryCommand {
    pub database: String,
    pub id: ContinuousQueryId,
}

impl DeleteContinuousQueryCommand {
    pub fn new(database: impl Into<String>, id: ContinuousQueryId) -> Self {
        Self {
            database: database.into(),
            id,
        }
    }
}

impl Command for DeleteContinuousQueryCommand {
    const NAME: &'static str = "delete_cq";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config
            .delete_continuous_query(&self.database, self.id)?;
        Ok(CommandOutput::Applied)
    }
}

/// Global high-water mark for continuous query runs. The proposer picks the
/// timestamp; replicas never read their own clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetContinuousQueryTimestampCommand {
    pub timestamp: DateTime<Utc>,
}

impl SetContinuousQueryTimestampCommand {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp }
    }
}

impl Command for SetContinuousQueryTimestampCommand {
    const NAME: &'static str = "set_cq_ts";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config
            .set_continuous_query_timestamp(self.timestamp)?;
        Ok(CommandOutput::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateShardsCommand {
    pub shards: Vec<NewShardData>,
}

impl CreateShardsCommand {
    pub fn new(shards: Vec<NewShardData>) -> Self {
        Self { shards }
    }
}

impl Command for CreateShardsCommand {
    const NAME: &'static str = "create_shards";

    /// Returns the shards as stored, with ids and server assignments resolved.
    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        let created = ctx.config.add_shards(&self.shards)?;
        Ok(CommandOutput::Shards {
            shards: created.iter().map(|s| s.to_new_shard_data()).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DropShardCommand {
    pub shard_id: ShardId,
    #[serde(default)]
    pub server_ids: Vec<ServerId>,
}

impl DropShardCommand {
    pub fn new(shard_id: ShardId, server_ids: Vec<ServerId>) -> Self {
        Self {
            shard_id,
            server_ids,
        }
    }
}

impl Command for DropShardCommand {
    const NAME: &'static str = "drop_shard";

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<CommandOutput, ApplyError> {
        ctx.config.drop_shard(self.shard_id, &self.server_ids)?;
        Ok(CommandOutput::Applied)
    }
}

impl From<CreateDatabaseCommand> for ClusterCommand {
    fn from(value: CreateDatabaseCommand) -> Self {
        Self::CreateDatabase(value)
    }
}

impl From<DropDatabaseCommand> for ClusterCommand {
    fn from(value: DropDatabaseCommand) -> Self {
        Self::DropDatabase(value)
    }
}

impl From<SaveDbUserCommand> for ClusterCommand {
    fn from(value: SaveDbUserCommand) -> Self {
        Self::SaveDbUser(value)
    }
}

impl From<ChangeDbUserPasswordCommand> for ClusterCommand {
    fn from(value: ChangeDbUserPasswordCommand) -> Self {
        Self::ChangeDbUserPassword(value)
    }
}

impl From<SaveClusterAdminCommand> for ClusterCommand {
    fn from(value: SaveClusterAdminCommand) -> Self {
        Self::SaveClusterAdmin(value)
    }
}

impl From<AddPotentialServerCommand> for ClusterCommand {
    fn from(value: AddPotentialServerCommand) -> Self {
        Self::AddPotentialServer(value)
    }
}

impl From<CreateContinuousQueryCommand> for ClusterCommand {
    fn from(value: CreateContinuousQueryCommand) -> Self {
        Self::CreateContinuousQuery(value)
    }
}

impl From<DeleteContinuousQueryCommand> for ClusterCommand {
    fn from(value: DeleteContinuousQueryCommand) -> Self {
        Self::DeleteContinuousQuery(value)
    }
}

impl From<SetContinuousQueryTimestampCommand> for ClusterCommand {
    fn from(value: SetContinuousQueryTimestampCommand) -> Self {
        Self::SetContinuousQueryTimestamp(value)
    }
}

impl From<CreateShardsCommand> for ClusterCommand {
    fn from(value: CreateShardsCommand) -> Self {
        Self::CreateShards(value)
    }
}

impl From<DropShardCommand> for ClusterCommand {
    fn from(value: DropShardCommand) -> Self {
        Self::DropShard(value)
    }
}
