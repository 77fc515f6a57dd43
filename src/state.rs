use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ClusterAdmin, ClusterServer, ContinuousQuery, ContinuousQueryId, DbUser, DomainError,
    NewShardData, ServerId, ShardData, ShardId, validate_database_name,
    validate_replication_factor, validate_user_name,
};

pub const SCHEMA_VERSION: u32 = 1;

const CONFIG_FILE_NAME: &str = "cluster_config.json";

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

/// Mutation surface that replicated commands are allowed to touch.
///
/// Every method is called from the single apply thread. Implementations must be
/// deterministic: the same call sequence on equal stores yields equal stores and
/// the same errors.
pub trait ClusterConfigStore {
    fn create_database(&mut self, name: &str, replication_factor: u8) -> Result<(), DomainError>;

    fn drop_database(&mut self, name: &str) -> Result<(), DomainError>;

    fn save_db_user(&mut self, user: &DbUser) -> Result<(), DomainError>;

    fn change_db_user_password(
        &mut self,
        db: &str,
        username: &str,
        hash: &str,
    ) -> Result<(), DomainError>;

    fn save_cluster_admin(&mut self, admin: &ClusterAdmin) -> Result<(), DomainError>;

    fn add_potential_server(&mut self, server: &ClusterServer) -> Result<(), DomainError>;

    fn create_continuous_query(&mut self, db: &str, query: &str) -> Result<(), DomainError>;

    fn delete_continuous_query(
        &mut self,
        db: &str,
        id: ContinuousQueryId,
    ) -> Result<(), DomainError>;

    fn set_continuous_query_timestamp(&mut self, timestamp: DateTime<Utc>)
    -> Result<(), DomainError>;

    /// Creates all shards or none of them.
    fn add_shards(&mut self, shards: &[NewShardData]) -> Result<Vec<ShardData>, DomainError>;

    fn drop_shard(&mut self, shard_id: ShardId, server_ids: &[ServerId])
    -> Result<(), DomainError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub replication_factor: u8,
}

/// Cluster-wide metadata held identically by every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub schema_version: u32,
    #[serde(default)]
    pub databases: BTreeMap<String, Database>,
    /// db -> user name -> user
    #[serde(default)]
    pub db_users: BTreeMap<String, BTreeMap<String, DbUser>>,
    #[serde(default)]
    pub cluster_admins: BTreeMap<String, ClusterAdmin>,
    #[serde(default)]
    pub servers: BTreeMap<ServerId, ClusterServer>,
    /// db -> query id -> query
    #[serde(default)]
    pub continuous_queries: BTreeMap<String, BTreeMap<ContinuousQueryId, ContinuousQuery>>,
    #[serde(default)]
    pub continuous_query_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shards: BTreeMap<ShardId, ShardData>,
    #[serde(default)]
    pub last_shard_id: ShardId,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self::empty()
    }
}

impl ClusterConfiguration {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            databases: BTreeMap::new(),
            db_users: BTreeMap::new(),
            cluster_admins: BTreeMap::new(),
            servers: BTreeMap::new(),
            continuous_queries: BTreeMap::new(),
            continuous_query_timestamp: None,
            shards: BTreeMap::new(),
            last_shard_id: 0,
        }
    }

    pub fn check_schema(&self) -> Result<(), StoreError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                got: self.schema_version,
            });
        }
        Ok(())
    }

    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases.get(name)
    }

    pub fn db_user(&self, db: &str, name: &str) -> Option<&DbUser> {
        self.db_users.get(db).and_then(|users| users.get(name))
    }

    pub fn shards_for_database(&self, db: &str) -> Vec<&ShardData> {
        self.shards.values().filter(|s| s.database == db).collect()
    }

    pub fn server_by_name(&self, raft_name: &str) -> Option<&ClusterServer> {
        self.servers.values().find(|s| s.raft_name == raft_name)
    }

    /// Picks `replication_factor` servers round-robin over the registered servers,
    /// starting at an offset derived from the shard id.
    fn place_shard(
        &self,
        shard_id: ShardId,
        database: &str,
        replication_factor: u8,
    ) -> Result<Vec<ServerId>, DomainError> {
        let ids: Vec<ServerId> = self.servers.keys().copied().collect();
        let wanted = usize::from(replication_factor);
        if ids.len() < wanted {
            return Err(DomainError::InsufficientServers {
                database: database.to_string(),
                replication_factor,
                available: ids.len(),
            });
        }
        let start = (shard_id.saturating_sub(1) as usize) % ids.len();
        Ok(ids.iter().cycle().skip(start).take(wanted).copied().collect())
    }
}

/// The id after `last`, starting from 1. Ids are never reused by wrapping around.
fn next_id(last: Option<u32>, kind: &'static str) -> Result<u32, DomainError> {
    match last {
        None => Ok(1),
        Some(last) => last
            .checked_add(1)
            .ok_or(DomainError::IdSpaceExhausted { kind }),
    }
}

impl ClusterConfigStore for ClusterConfiguration {
    fn create_database(&mut self, name: &str, replication_factor: u8) -> Result<(), DomainError> {
        validate_database_name(name)?;
        validate_replication_factor(replication_factor)?;
        if self.databases.contains_key(name) {
            return Err(DomainError::DatabaseExists {
                name: name.to_string(),
            });
        }
        self.databases.insert(
            name.to_string(),
            Database {
                name: name.to_string(),
                replication_factor,
            },
        );
        Ok(())
    }

    fn drop_database(&mut self, name: &str) -> Result<(), DomainError> {
        if self.databases.remove(name).is_none() {
            return Err(DomainError::MissingDatabase {
                name: name.to_string(),
            });
        }
        self.db_users.remove(name);
        self.continuous_queries.remove(name);
        self.shards.retain(|_id, shard| shard.database != name);
        Ok(())
    }

    fn save_db_user(&mut self, user: &DbUser) -> Result<(), DomainError> {
        validate_user_name(&user.name)?;
        if !self.databases.contains_key(&user.db) {
            return Err(DomainError::MissingDatabase {
                name: user.db.clone(),
            });
        }
        if user.is_deleted {
            if let Some(users) = self.db_users.get_mut(&user.db) {
                users.remove(&user.name);
                if users.is_empty() {
                    self.db_users.remove(&user.db);
                }
            }
            return Ok(());
        }
        self.db_users
            .entry(user.db.clone())
            .or_default()
            .insert(user.name.clone(), user.clone());
        Ok(())
    }

    fn change_db_user_password(
        &mut self,
        db: &str,
        username: &str,
        hash: &str,
    ) -> Result<(), DomainError> {
        let user = self
            .db_users
            .get_mut(db)
            .and_then(|users| users.get_mut(username))
            .ok_or_else(|| DomainError::MissingDbUser {
                db: db.to_string(),
                name: username.to_string(),
            })?;
        user.hash = hash.to_string();
        Ok(())
    }

    fn save_cluster_admin(&mut self, admin: &ClusterAdmin) -> Result<(), DomainError> {
        validate_user_name(&admin.name)?;
        if admin.is_deleted {
            self.cluster_admins.remove(&admin.name);
        } else {
            self.cluster_admins
                .insert(admin.name.clone(), admin.clone());
        }
        Ok(())
    }

    fn add_potential_server(&mut self, server: &ClusterServer) -> Result<(), DomainError> {
        if server.raft_name.trim().is_empty() {
            return Err(DomainError::InvalidServerName {
                name: server.raft_name.clone(),
            });
        }
        if self.server_by_name(&server.raft_name).is_some() {
            return Ok(());
        }
        let id = if server.id == 0 {
            next_id(self.servers.keys().next_back().copied(), "server")?
        } else {
            if self.servers.contains_key(&server.id) {
                return Err(DomainError::ServerIdConflict {
                    server_id: server.id,
                });
            }
            server.id
        };
        self.servers.insert(
            id,
            ClusterServer {
                id,
                ..server.clone()
            },
        );
        Ok(())
    }

    fn create_continuous_query(&mut self, db: &str, query: &str) -> Result<(), DomainError> {
        if !self.databases.contains_key(db) {
            return Err(DomainError::MissingDatabase {
                name: db.to_string(),
            });
        }
        let queries = self.continuous_queries.entry(db.to_string()).or_default();
        let id = next_id(queries.keys().next_back().copied(), "continuous query")?;
        queries.insert(
            id,
            ContinuousQuery {
                id,
                query: query.to_string(),
            },
        );
        Ok(())
    }

    fn delete_continuous_query(
        &mut self,
        db: &str,
        id: ContinuousQueryId,
    ) -> Result<(), DomainError> {
        let removed = self
            .continuous_queries
            .get_mut(db)
            .and_then(|queries| queries.remove(&id));
        if removed.is_none() {
            return Err(DomainError::MissingContinuousQuery {
                db: db.to_string(),
                id,
            });
        }
        Ok(())
    }

    fn set_continuous_query_timestamp(
        &mut self,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.continuous_query_timestamp = Some(timestamp);
        Ok(())
    }

    fn add_shards(&mut self, shards: &[NewShardData]) -> Result<Vec<ShardData>, DomainError> {
        // Resolve everything against the current state first; nothing is inserted
        // until every shard is valid.
        let mut next_shard_id = self.last_shard_id;
        let mut reserved = BTreeSet::new();
        let mut created = Vec::with_capacity(shards.len());

        for new_shard in shards {
            let database =
                self.databases
                    .get(&new_shard.database)
                    .ok_or_else(|| DomainError::MissingDatabase {
                        name: new_shard.database.clone(),
                    })?;
            if new_shard.start_time >= new_shard.end_time {
                return Err(DomainError::InvalidShardRange {
                    database: new_shard.database.clone(),
                });
            }

            let id = if new_shard.id == 0 {
                loop {
                    next_shard_id = next_id(Some(next_shard_id), "shard")?;
                    if !self.shards.contains_key(&next_shard_id)
                        && !reserved.contains(&next_shard_id)
                    {
                        break next_shard_id;
                    }
                }
            } else {
                if self.shards.contains_key(&new_shard.id) || reserved.contains(&new_shard.id) {
                    return Err(DomainError::ShardIdConflict { shard_id: new_shard.id });
                }
                new_shard.id
            };
            reserved.insert(id);

            let server_ids = if new_shard.server_ids.is_empty() {
                self.place_shard(id, &new_shard.database, database.replication_factor)?
            } else {
                if let Some(missing) = new_shard
                    .server_ids
                    .iter()
                    .find(|server_id| !self.servers.contains_key(server_id))
                {
                    return Err(DomainError::MissingServer {
                        server_id: *missing,
                    });
                }
                new_shard.server_ids.clone()
            };

            created.push(ShardData {
                id,
                database: new_shard.database.clone(),
                space_name: new_shard.space_name.clone(),
                start_time: new_shard.start_time,
                end_time: new_shard.end_time,
                server_ids,
            });
        }

        for shard in &created {
            self.last_shard_id = self.last_shard_id.max(shard.id);
            self.shards.insert(shard.id, shard.clone());
        }
        Ok(created)
    }

    fn drop_shard(&mut self, shard_id: ShardId, server_ids: &[ServerId]) -> Result<(), DomainError> {
        let shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(DomainError::MissingShard { shard_id })?;
        shard.server_ids.retain(|id| !server_ids.contains(id));
        if server_ids.is_empty() || shard.server_ids.is_empty() {
            self.shards.remove(&shard_id);
        }
        Ok(())
    }
}

/// JSON-file persistence for the local replica's configuration.
pub struct ClusterStore {
    path: PathBuf,
    config: ClusterConfiguration,
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ClusterStore {
    pub fn load_or_init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let path = data_dir.join(CONFIG_FILE_NAME);
        let (config, is_new) = if path.exists() {
            let bytes = fs::read(&path)?;
            let config: ClusterConfiguration = serde_json::from_slice(&bytes)?;
            config.check_schema()?;
            (config, false)
        } else {
            (ClusterConfiguration::empty(), true)
        };

        let store = Self { path, config };
        if is_new {
            store.save()?;
        }
        Ok(store)
    }

    pub fn config(&self) -> &ClusterConfiguration {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ClusterConfiguration {
        &mut self.config
    }

    /// Swaps in a configuration restored elsewhere (state machine reopen, snapshot
    /// install). The caller decides when to [`save`](Self::save).
    pub fn replace(&mut self, config: ClusterConfiguration) {
        self.config = config;
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.config)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
