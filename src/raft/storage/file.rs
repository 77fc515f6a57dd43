use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::RangeBounds,
    path::{Path, PathBuf},
    sync::Arc,
};

use openraft::entry::RaftPayload as _;
use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, LogState, RaftLogReader, Snapshot, SnapshotMeta,
    StoredMembership, Vote,
    storage::{RaftLogStorage, RaftStateMachine},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::{
    command::{ApplyContext, CommandOutput, Peer, registry},
    raft::{
        membership::{MembershipHandle, PeerTable},
        types::{CommandResponse, NodeId, NodeMeta, TypeConfig},
    },
    state::{ClusterConfiguration, ClusterStore, write_atomic},
};

type StorageResult<T> = Result<T, openraft::StorageError<NodeId>>;

#[derive(Debug, Clone)]
pub struct StorePaths {
    pub log_json: PathBuf,
    pub log_meta_json: PathBuf,
    pub sm_json: PathBuf,
    pub snapshot_meta_json: PathBuf,
    pub snapshot_data_json: PathBuf,
}

impl StorePaths {
    pub fn new(data_dir: &Path) -> Self {
        let raft_dir = data_dir.join("raft");
        let snapshot_dir = raft_dir.join("snapshots");
        Self {
            log_json: raft_dir.join("log.json"),
            log_meta_json: raft_dir.join("log_meta.json"),
            sm_json: raft_dir.join("state_machine.json"),
            snapshot_meta_json: snapshot_dir.join("current_meta.json"),
            snapshot_data_json: snapshot_dir.join("current_snapshot.json"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for path in [&self.log_json, &self.snapshot_meta_json] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct PersistedLog {
    #[serde(default)]
    last_purged_log_id: Option<LogId<NodeId>>,
    #[serde(default)]
    entries: Vec<openraft::impls::Entry<TypeConfig>>,
}

/// Vote and commit index share one file; both are tiny and written often.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct PersistedLogMeta {
    #[serde(default)]
    vote: Option<Vote<NodeId>>,
    #[serde(default)]
    committed: Option<LogId<NodeId>>,
}

#[derive(Debug, Default)]
struct LogInner {
    last_purged_log_id: Option<LogId<NodeId>>,
    entries: BTreeMap<u64, openraft::impls::Entry<TypeConfig>>,
    meta: PersistedLogMeta,
}

impl LogInner {
    fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.entries
            .values()
            .next_back()
            .map(|ent| ent.log_id)
            .or(self.last_purged_log_id)
    }

    fn to_persisted(&self) -> PersistedLog {
        PersistedLog {
            last_purged_log_id: self.last_purged_log_id,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

/// Raft log kept in memory and rewritten to a JSON file on every change.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    paths: StorePaths,
    inner: Arc<Mutex<LogInner>>,
}

impl FileLogStore {
    pub async fn open(data_dir: &Path) -> StorageResult<Self> {
        let paths = StorePaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let log = read_json::<PersistedLog>(&paths.log_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Read, e))?
            .unwrap_or_default();
        let meta = read_json::<PersistedLogMeta>(&paths.log_meta_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Read, e))?
            .unwrap_or_default();

        let inner = LogInner {
            last_purged_log_id: log.last_purged_log_id,
            entries: log
                .entries
                .into_iter()
                .map(|ent| (ent.log_id.index, ent))
                .collect(),
            meta,
        };
        Ok(Self {
            paths,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    async fn update_log<F>(&self, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut LogInner),
    {
        let persisted = {
            let mut inner = self.inner.lock().await;
            f(&mut inner);
            inner.to_persisted()
        };
        write_json(&self.paths.log_json, &persisted)
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))
    }

    async fn update_meta<F>(&self, subject: ErrorSubject<NodeId>, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut PersistedLogMeta),
    {
        let bytes = {
            let mut inner = self.inner.lock().await;
            f(&mut inner.meta);
            serde_json::to_vec_pretty(&inner.meta).map_err(std::io::Error::other)
        }
        .map_err(|e| io_err(subject.clone(), ErrorVerb::Write, e))?;
        write_bytes(&self.paths.log_meta_json, &bytes)
            .await
            .map_err(|e| io_err(subject, ErrorVerb::Write, e))
    }
}

impl RaftLogReader<TypeConfig> for FileLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + openraft::OptionalSend>(
        &mut self,
        range: RB,
    ) -> StorageResult<Vec<openraft::impls::Entry<TypeConfig>>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.range(range).map(|(_, ent)| ent.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for FileLogStore {
    type LogReader = FileLogStore;

    async fn get_log_state(&mut self) -> StorageResult<LogState<TypeConfig>> {
        let inner = self.inner.lock().await;
        Ok(LogState {
            last_purged_log_id: inner.last_purged_log_id,
            last_log_id: inner.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> StorageResult<()> {
        let vote = *vote;
        self.update_meta(ErrorSubject::Vote, |meta| meta.vote = Some(vote))
            .await
    }

    async fn read_vote(&mut self) -> StorageResult<Option<Vote<NodeId>>> {
        Ok(self.inner.lock().await.meta.vote)
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> StorageResult<()> {
        self.update_meta(ErrorSubject::Store, |meta| meta.committed = committed)
            .await
    }

    async fn read_committed(&mut self) -> StorageResult<Option<LogId<NodeId>>> {
        Ok(self.inner.lock().await.meta.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: openraft::storage::LogFlushed<TypeConfig>,
    ) -> StorageResult<()>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let res = self
            .update_log(|inner| {
                for ent in entries {
                    inner.entries.insert(ent.log_id.index, ent);
                }
            })
            .await;
        callback.log_io_completed(
            res.as_ref()
                .map(|_| ())
                .map_err(|e| std::io::Error::other(e.to_string())),
        );
        res
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> StorageResult<()> {
        self.update_log(|inner| {
            inner.entries.split_off(&log_id.index);
        })
        .await
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> StorageResult<()> {
        self.update_log(|inner| {
            inner.entries = inner.entries.split_off(&(log_id.index + 1));
            inner.last_purged_log_id = Some(log_id);
        })
        .await
    }
}

/// Everything apply produces, written as one file so a restart never sees a
/// configuration ahead of or behind `last_applied`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedStateMachine {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
    #[serde(default)]
    peers: BTreeMap<String, Peer>,
    config: ClusterConfiguration,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotPayload {
    config: ClusterConfiguration,
    #[serde(default)]
    peers: BTreeMap<String, Peer>,
}

/// Whether the state machine still accepts entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyState {
    Active,
    /// An entry could not be decoded; nothing after it is applied.
    Halted { log_index: u64, reason: String },
}

#[derive(Debug)]
struct StateMachineInner {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
    peers: BTreeMap<String, Peer>,
    state: ApplyState,
}

/// Applies committed command envelopes to the shared [`ClusterStore`].
///
/// Domain failures become [`CommandResponse::Err`] and the log moves on. A payload
/// the registry cannot decode halts the state machine: every replica must apply the
/// same sequence, so skipping the entry would fork this replica from the rest.
#[derive(Debug, Clone)]
pub struct FileStateMachine {
    node_name: String,
    store: Arc<RwLock<ClusterStore>>,
    membership: MembershipHandle,
    paths: StorePaths,
    inner: Arc<Mutex<StateMachineInner>>,
}

impl FileStateMachine {
    pub async fn open(
        data_dir: &Path,
        node_name: impl Into<String>,
        store: Arc<RwLock<ClusterStore>>,
        membership: MembershipHandle,
    ) -> StorageResult<Self> {
        let paths = StorePaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let persisted = read_json::<PersistedStateMachine>(&paths.sm_json)
            .await
            .map_err(|e| io_err(ErrorSubject::StateMachine, ErrorVerb::Read, e))?;

        // The configuration always matches `last_applied`; with nothing applied yet
        // it is empty, whatever `cluster_config.json` holds.
        let (inner, config) = match persisted {
            Some(p) => (
                StateMachineInner {
                    last_applied: p.last_applied,
                    last_membership: p.last_membership,
                    peers: p.peers,
                    state: ApplyState::Active,
                },
                p.config,
            ),
            None => (
                StateMachineInner {
                    last_applied: None,
                    last_membership: StoredMembership::default(),
                    peers: BTreeMap::new(),
                    state: ApplyState::Active,
                },
                ClusterConfiguration::empty(),
            ),
        };
        config
            .check_schema()
            .map_err(|e| sm_err(ErrorVerb::Read, e.to_string()))?;
        store.write().await.replace(config);
        membership.publish(&inner.peers);

        Ok(Self {
            node_name: node_name.into(),
            store,
            membership,
            paths,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub async fn apply_state(&self) -> ApplyState {
        self.inner.lock().await.state.clone()
    }

    pub async fn peers(&self) -> BTreeMap<String, Peer> {
        self.inner.lock().await.peers.clone()
    }

    /// Writes the applied state, then refreshes `cluster_config.json`, which only
    /// trails it as a readable copy, and hands the peer table to the worker.
    async fn persist(&self) -> StorageResult<()> {
        let persisted = {
            let inner = self.inner.lock().await;
            let config = self.store.read().await.config().clone();
            PersistedStateMachine {
                last_applied: inner.last_applied,
                last_membership: inner.last_membership.clone(),
                peers: inner.peers.clone(),
                config,
            }
        };
        write_json(&self.paths.sm_json, &persisted)
            .await
            .map_err(|e| io_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;
        self.store
            .read()
            .await
            .save()
            .map_err(|e| sm_err(ErrorVerb::Write, e.to_string()))?;
        self.membership.publish(&persisted.peers);
        Ok(())
    }

    /// Applies one normal entry. `Err` is fatal for this replica.
    async fn apply_command(
        &self,
        inner: &mut StateMachineInner,
        log_id: LogId<NodeId>,
        envelope: crate::command::CommandEnvelope,
    ) -> StorageResult<CommandResponse> {
        let cmd = match registry().decode(&envelope) {
            Ok(cmd) => cmd,
            Err(err) => {
                error!(
                    node = %self.node_name,
                    log_index = log_id.index,
                    command = %envelope.name,
                    error = %err,
                    "undecodable log entry; halting state machine"
                );
                inner.state = ApplyState::Halted {
                    log_index: log_id.index,
                    reason: err.to_string(),
                };
                return Err(sm_err(ErrorVerb::Read, err.to_string()));
            }
        };

        let mut store = self.store.write().await;
        let StateMachineInner {
            peers,
            last_membership,
            ..
        } = inner;
        let mut server = PeerTable::new(&self.node_name, peers, last_membership);
        let mut ctx = ApplyContext {
            config: store.config_mut(),
            server: &mut server,
        };

        match cmd.apply(&mut ctx) {
            Ok(output) => {
                debug!(
                    node = %self.node_name,
                    log_index = log_id.index,
                    command = cmd.name(),
                    membership = cmd.is_membership_change(),
                    "command applied"
                );
                Ok(CommandResponse::Ok { output })
            }
            Err(err) => {
                warn!(
                    node = %self.node_name,
                    log_index = log_id.index,
                    command = cmd.name(),
                    code = err.code(),
                    error = %err,
                    "command rejected"
                );
                Ok(CommandResponse::Err {
                    code: err.code().to_string(),
                    message: err.to_string(),
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct FileSnapshotBuilder {
    store: Arc<RwLock<ClusterStore>>,
    inner: Arc<Mutex<StateMachineInner>>,
    paths: StorePaths,
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for FileSnapshotBuilder {
    async fn build_snapshot(&mut self) -> StorageResult<Snapshot<TypeConfig>> {
        // Holding the inner lock keeps `last_applied` and the store contents in step.
        let inner = self.inner.lock().await;
        let config = self.store.read().await.config().clone();
        let payload = SnapshotPayload {
            config,
            peers: inner.peers.clone(),
        };
        let meta = SnapshotMeta {
            last_log_id: inner.last_applied,
            last_membership: inner.last_membership.clone(),
            snapshot_id: format!(
                "snapshot-{}",
                inner.last_applied.map(|l| l.index).unwrap_or(0)
            ),
        };
        drop(inner);

        let bytes = serde_json::to_vec_pretty(&payload).map_err(|e| {
            io_err(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                std::io::Error::other(e),
            )
        })?;

        write_json(&self.paths.snapshot_meta_json, &meta)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        write_bytes(&self.paths.snapshot_data_json, &bytes)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        Ok(Snapshot {
            meta,
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for FileStateMachine {
    type SnapshotBuilder = FileSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> StorageResult<(Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>)> {
        let inner = self.inner.lock().await;
        Ok((inner.last_applied, inner.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> StorageResult<Vec<CommandResponse>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            let mut inner = self.inner.lock().await;
            if let ApplyState::Halted { log_index, reason } = &inner.state {
                return Err(sm_err(
                    ErrorVerb::Read,
                    format!("state machine halted at log index {log_index}: {reason}"),
                ));
            }

            if let Some(membership) = entry.get_membership() {
                inner.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let resp = match entry.payload {
                EntryPayload::Normal(envelope) => {
                    match self.apply_command(&mut inner, log_id, envelope).await {
                        Ok(resp) => resp,
                        Err(err) => {
                            drop(inner);
                            // Keep what earlier entries of this batch applied.
                            self.persist().await?;
                            return Err(err);
                        }
                    }
                }
                EntryPayload::Membership(_) | EntryPayload::Blank => CommandResponse::Ok {
                    output: CommandOutput::Applied,
                },
            };

            inner.last_applied = Some(log_id);
            responses.push(resp);
        }

        self.persist().await?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        FileSnapshotBuilder {
            store: self.store.clone(),
            inner: self.inner.clone(),
            paths: self.paths.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> StorageResult<Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>> {
        Ok(Box::new(std::io::Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        mut snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> StorageResult<()> {
        use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

        let _ = snapshot.seek(std::io::SeekFrom::Start(0)).await;
        let mut buf = Vec::new();
        snapshot
            .read_to_end(&mut buf)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;

        let payload: SnapshotPayload = serde_json::from_slice(&buf).map_err(|e| {
            io_err(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Read,
                std::io::Error::other(e),
            )
        })?;

        {
            let mut inner = self.inner.lock().await;
            payload
                .config
                .check_schema()
                .map_err(|e| sm_err(ErrorVerb::Read, e.to_string()))?;
            self.store.write().await.replace(payload.config);
            inner.last_applied = meta.last_log_id;
            inner.last_membership = meta.last_membership.clone();
            inner.peers = payload.peers;
        }
        debug!(
            node = %self.node_name,
            snapshot_id = %meta.snapshot_id,
            "installed snapshot"
        );

        self.persist().await?;
        write_json(&self.paths.snapshot_meta_json, meta)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        write_bytes(&self.paths.snapshot_data_json, &buf)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> StorageResult<Option<Snapshot<TypeConfig>>> {
        let meta = read_json::<SnapshotMeta<NodeId, NodeMeta>>(&self.paths.snapshot_meta_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        let Some(meta) = meta else {
            return Ok(None);
        };
        let bytes = read_bytes(&self.paths.snapshot_data_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        }))
    }
}

fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: std::io::Error,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err)
}

fn sm_err(verb: ErrorVerb, msg: String) -> openraft::StorageError<NodeId> {
    io_err(ErrorSubject::StateMachine, verb, std::io::Error::other(msg))
}

async fn read_json<T: serde::de::DeserializeOwned + Send + 'static>(
    path: &Path,
) -> Result<Option<T>, std::io::Error> {
    let path = path.to_path_buf();
    run_blocking(move || {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let v = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
        Ok(Some(v))
    })
    .await
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), std::io::Error> {
    let bytes = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    write_bytes(path, &bytes).await
}

async fn read_bytes(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let path = path.to_path_buf();
    run_blocking(move || std::fs::read(&path)).await
}

async fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    run_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &bytes)
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> Result<T, std::io::Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, std::io::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}
