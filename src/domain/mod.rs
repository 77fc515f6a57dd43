use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ServerId = u32;
pub type ShardId = u32;
pub type ContinuousQueryId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidDatabaseName {
        name: String,
    },
    InvalidReplicationFactor {
        replication_factor: u8,
    },
    InvalidUserName {
        name: String,
    },
    InvalidServerName {
        name: String,
    },
    InvalidShardRange {
        database: String,
    },
    DatabaseExists {
        name: String,
    },
    MissingDatabase {
        name: String,
    },
    MissingDbUser {
        db: String,
        name: String,
    },
    MissingServer {
        server_id: ServerId,
    },
    MissingShard {
        shard_id: ShardId,
    },
    MissingContinuousQuery {
        db: String,
        id: ContinuousQueryId,
    },
    ServerIdConflict {
        server_id: ServerId,
    },
    ShardIdConflict {
        shard_id: ShardId,
    },
    InsufficientServers {
        database: String,
        replication_factor: u8,
        available: usize,
    },
    /// Automatic numbering ran past the largest id already taken.
    IdSpaceExhausted {
        kind: &'static str,
    },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDatabaseName { .. }
            | Self::InvalidReplicationFactor { .. }
            | Self::InvalidUserName { .. }
            | Self::InvalidServerName { .. }
            | Self::InvalidShardRange { .. }
            | Self::InsufficientServers { .. } => "invalid_request",
            Self::MissingDatabase { .. }
            | Self::MissingDbUser { .. }
            | Self::MissingServer { .. }
            | Self::MissingShard { .. }
            | Self::MissingContinuousQuery { .. } => "not_found",
            Self::DatabaseExists { .. }
            | Self::ServerIdConflict { .. }
            | Self::ShardIdConflict { .. }
            | Self::IdSpaceExhausted { .. } => "conflict",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDatabaseName { name } => write!(f, "invalid database name: {name:?}"),
            Self::InvalidReplicationFactor { replication_factor } => {
                write!(f, "invalid replication factor: {replication_factor}")
            }
            Self::InvalidUserName { name } => write!(f, "invalid user name: {name:?}"),
            Self::InvalidServerName { name } => write!(f, "invalid server name: {name:?}"),
            Self::InvalidShardRange { database } => {
                write!(f, "shard start time must be before end time: database={database}")
            }
            Self::DatabaseExists { name } => write!(f, "database {name} exists"),
            Self::MissingDatabase { name } => write!(f, "database {name} doesn't exist"),
            Self::MissingDbUser { db, name } => write!(f, "user not found: {db}:{name}"),
            Self::MissingServer { server_id } => write!(f, "server not found: {server_id}"),
            Self::MissingShard { shard_id } => write!(f, "shard not found: {shard_id}"),
            Self::MissingContinuousQuery { db, id } => {
                write!(f, "continuous query not found: db={db} id={id}")
            }
            Self::ServerIdConflict { server_id } => {
                write!(f, "server id already in use: {server_id}")
            }
            Self::ShardIdConflict { shard_id } => write!(f, "shard id already in use: {shard_id}"),
            Self::InsufficientServers {
                database,
                replication_factor,
                available,
            } => write!(
                f,
                "not enough servers for database {database}: replication_factor={replication_factor} available={available}"
            ),
            Self::IdSpaceExhausted { kind } => write!(f, "no {kind} id left to assign"),
        }
    }
}

impl std::error::Error for DomainError {}

/// A database-scoped user. The hash is opaque to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbUser {
    pub name: String,
    pub db: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub read_from: Vec<String>,
    #[serde(default)]
    pub write_to: Vec<String>,
    /// Saving a user with this flag set removes it.
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAdmin {
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub is_deleted: bool,
}

/// A node known to the coordinator as a data/replication target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterServer {
    /// 0 asks the store to assign the next free id.
    #[serde(default)]
    pub id: ServerId,
    pub raft_name: String,
    #[serde(default)]
    pub raft_connection_string: String,
    #[serde(default)]
    pub protobuf_connection_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub id: ContinuousQueryId,
    pub query: String,
}

/// Shard descriptor as proposed by a client and as reported back after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewShardData {
    /// 0 asks the store to assign the next free id.
    #[serde(default)]
    pub id: ShardId,
    pub database: String,
    #[serde(default)]
    pub space_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Empty asks the store to place the shard.
    #[serde(default)]
    pub server_ids: Vec<ServerId>,
}

/// Shard as held by the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardData {
    pub id: ShardId,
    pub database: String,
    pub space_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub server_ids: Vec<ServerId>,
}

impl ShardData {
    pub fn to_new_shard_data(&self) -> NewShardData {
        NewShardData {
            id: self.id,
            database: self.database.clone(),
            space_name: self.space_name.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            server_ids: self.server_ids.clone(),
        }
    }
}

pub fn validate_database_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::InvalidDatabaseName {
            name: name.to_string(),
        });
    }
    Ok(())
}

pub fn validate_replication_factor(replication_factor: u8) -> Result<(), DomainError> {
    if replication_factor == 0 {
        return Err(DomainError::InvalidReplicationFactor { replication_factor });
    }
    Ok(())
}

pub fn validate_user_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::InvalidUserName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_empty_names() {
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("  ").is_err());
        assert!(validate_database_name("metrics").is_ok());
        assert!(validate_user_name("").is_err());
        assert!(validate_user_name("alice").is_ok());
    }

    #[test]
    fn validation_rejects_zero_replication_factor() {
        assert!(validate_replication_factor(0).is_err());
        assert!(validate_replication_factor(1).is_ok());
        assert!(validate_replication_factor(u8::MAX).is_ok());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            DomainError::DatabaseExists {
                name: "x".to_string()
            }
            .code(),
            "conflict"
        );
        assert_eq!(DomainError::MissingShard { shard_id: 1 }.code(), "not_found");
        assert_eq!(
            DomainError::InvalidReplicationFactor {
                replication_factor: 0
            }
            .code(),
            "invalid_request"
        );
    }

    #[test]
    fn database_exists_message_names_database() {
        let err = DomainError::DatabaseExists {
            name: "metrics".to_string(),
        };
        assert_eq!(err.to_string(), "database metrics exists");
    }
}
