use std::{collections::BTreeSet, path::Path, sync::Arc};

use anyhow::Context as _;
use chrono::{TimeZone as _, Utc};
use pretty_assertions::assert_eq;
use tokio::{
    net::TcpListener,
    sync::{RwLock, oneshot},
    task::JoinHandle,
    time::{Duration, Instant},
};

use metad::{
    command::{
        AddPotentialServerCommand, CommandOutput, CreateDatabaseCommand, CreateShardsCommand,
        JoinCommand, Peer, init_registry,
    },
    domain::{ClusterServer, NewShardData},
    http::{AppState, build_router},
    raft::{
        NodeId, NodeMeta,
        app::{RaftFacade as _, RaftMetrics, RealRaft},
        network_http::HttpNetworkFactory,
        runtime::{RaftOptions, start_raft},
        types::CommandResponse,
    },
    state::{ClusterConfiguration, ClusterStore},
};

struct TestNode {
    node_id: NodeId,
    base_url: String,
    store: Arc<RwLock<ClusterStore>>,
    raft: RealRaft,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join
            .await
            .context("join node server task")?
            .context("node server exited with error")?;
        self.raft
            .raft()
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))?;
        Ok(())
    }
}

/// Binds first so the advertised URL is known before Raft starts. Until the
/// listener is served, connections to it hang like a node that is down.
async fn reserve_listener() -> anyhow::Result<(TcpListener, String)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind node listener")?;
    let addr = listener.local_addr().context("node local_addr")?;
    Ok((listener, format!("http://{addr}")))
}

async fn spawn_node(data_dir: &Path, node_id: NodeId, node_name: &str) -> anyhow::Result<TestNode> {
    let (listener, base_url) = reserve_listener().await?;
    start_node(listener, base_url, data_dir, node_id, node_name).await
}

async fn start_node(
    listener: TcpListener,
    base_url: String,
    data_dir: &Path,
    node_id: NodeId,
    node_name: &str,
) -> anyhow::Result<TestNode> {
    let store = Arc::new(RwLock::new(
        ClusterStore::load_or_init(data_dir).context("init store")?,
    ));
    let options = RaftOptions {
        cluster_name: "cluster-replication".to_string(),
        node_id,
        node_name: node_name.to_string(),
        heartbeat_interval: Duration::from_millis(100),
        propose_timeout: Duration::from_secs(5),
    };
    let raft = start_raft(
        data_dir,
        &options,
        store.clone(),
        HttpNetworkFactory::new(Duration::from_secs(2))?,
    )
    .await
    .context("start raft")?;

    let state = AppState {
        node_id,
        node_name: node_name.to_string(),
        store: store.clone(),
        raft: Arc::new(raft.clone()),
    };
    let router = build_router(state, Some(raft.raft()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|e| anyhow::anyhow!("axum serve: {e}"))?;
        Ok(())
    });

    Ok(TestNode {
        node_id,
        base_url,
        store,
        raft,
        shutdown_tx: Some(shutdown_tx),
        join,
    })
}

async fn wait_for_leader(
    mut rx: tokio::sync::watch::Receiver<RaftMetrics>,
    expected_leader: NodeId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            if m.state == openraft::ServerState::Leader && m.current_leader == Some(expected_leader)
            {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for leader={expected_leader}; state={:?} current_leader={:?}",
                m.state,
                m.current_leader
            );
        }

        tokio::time::timeout_at(deadline, rx.changed()).await.ok();
    }
}

/// Waits until `rx` reports a leader among `candidates`.
async fn wait_for_leader_among(
    mut rx: tokio::sync::watch::Receiver<RaftMetrics>,
    candidates: &BTreeSet<NodeId>,
    timeout: Duration,
) -> anyhow::Result<NodeId> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(leader) = rx.borrow().current_leader
            && candidates.contains(&leader)
        {
            return Ok(leader);
        }

        if Instant::now() >= deadline {
            anyhow::bail!(
                "timeout waiting for a leader among {candidates:?}; current_leader={:?}",
                rx.borrow().current_leader
            );
        }

        tokio::time::timeout_at(deadline, rx.changed()).await.ok();
    }
}

async fn wait_for_voters(
    mut rx: tokio::sync::watch::Receiver<RaftMetrics>,
    expected: BTreeSet<NodeId>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            let voters: BTreeSet<NodeId> = m.membership_config.voter_ids().collect();
            if voters == expected {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for voters={expected:?}; membership={}",
                m.membership_config
            );
        }

        tokio::time::timeout_at(deadline, rx.changed()).await.ok();
    }
}

async fn wait_for_config(
    store: &Arc<RwLock<ClusterStore>>,
    expected: &ClusterConfiguration,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if store.read().await.config() == expected {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for replicated configuration");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn join(raft: &RealRaft, name: &str, base_url: &str) -> anyhow::Result<Peer> {
    let resp = raft
        .propose(JoinCommand::new(name, base_url, "").into())
        .await?;
    let CommandResponse::Ok {
        output: CommandOutput::Joined { peer },
    } = resp
    else {
        anyhow::bail!("join {name}: unexpected response {resp:?}");
    };
    Ok(peer)
}

/// Starts nodes 1-3, bootstraps node 1 and joins the other two as voters.
async fn three_node_cluster(root: &Path) -> anyhow::Result<[TestNode; 3]> {
    let node1 = spawn_node(&root.join("node-1"), 1, "node-1").await?;
    let node2 = spawn_node(&root.join("node-2"), 2, "node-2").await?;
    let node3 = spawn_node(&root.join("node-3"), 3, "node-3").await?;

    node1
        .raft
        .initialize_single_node_if_needed(
            node1.node_id,
            NodeMeta::single_listener("node-1", node1.base_url.clone()),
        )
        .await?;
    wait_for_leader(node1.raft.metrics(), node1.node_id, Duration::from_secs(8)).await?;

    // Ids are assigned in log order, so the pre-started nodes line up with them.
    for node in [&node2, &node3] {
        let peer = join(&node1.raft, &format!("node-{}", node.node_id), &node.base_url).await?;
        assert_eq!(peer.node_id, node.node_id);
    }
    wait_for_voters(
        node1.raft.metrics(),
        BTreeSet::from([1, 2, 3]),
        Duration::from_secs(15),
    )
    .await?;

    Ok([node1, node2, node3])
}

fn server(id: u32, name: &str) -> ClusterServer {
    ClusterServer {
        id,
        raft_name: name.to_string(),
        raft_connection_string: format!("http://{name}:8090"),
        protobuf_connection_string: format!("{name}:8099"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_replicates_metadata() -> anyhow::Result<()> {
    init_registry()?;

    let tmp = tempfile::tempdir().context("tempdir")?;
    let [node1, node2, node3] = three_node_cluster(tmp.path()).await?;

    // Followers forward to the leader.
    for (id, name) in [(1, "node-1"), (2, "node-2"), (3, "node-3")] {
        let resp = node2
            .raft
            .propose(AddPotentialServerCommand::new(server(id, name)).into())
            .await?;
        assert!(resp.is_ok(), "add_server {name}: {resp:?}");
    }
    let resp = node3
        .raft
        .propose(CreateDatabaseCommand::new("metrics", 2).into())
        .await?;
    assert!(resp.is_ok(), "create_db: {resp:?}");

    let duplicate = node1
        .raft
        .propose(CreateDatabaseCommand::new("metrics", 2).into())
        .await?;
    let CommandResponse::Err { code, .. } = duplicate else {
        anyhow::bail!("duplicate create_db was accepted");
    };
    assert_eq!(code, "conflict");

    let start_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end_time = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
    let resp = node1
        .raft
        .propose(
            CreateShardsCommand::new(vec![NewShardData {
                id: 0,
                database: "metrics".to_string(),
                space_name: "default".to_string(),
                start_time,
                end_time,
                server_ids: vec![],
            }])
            .into(),
        )
        .await?;
    let CommandResponse::Ok {
        output: CommandOutput::Shards { shards },
    } = resp
    else {
        anyhow::bail!("create_shards: unexpected response {resp:?}");
    };
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].server_ids.len(), 2);

    let expected = node1.store.read().await.config().clone();
    assert_eq!(expected.servers.len(), 3);
    assert_eq!(expected.shards_for_database("metrics").len(), 1);
    for node in [&node2, &node3] {
        wait_for_config(&node.store, &expected, Duration::from_secs(8))
            .await
            .with_context(|| format!("node {}", node.node_id))?;
    }

    node3.shutdown().await?;
    node2.shutdown().await?;
    node1.shutdown().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_leader_admits_a_recorded_peer() -> anyhow::Result<()> {
    init_registry()?;

    let tmp = tempfile::tempdir().context("tempdir")?;
    let [node1, node2, node3] = three_node_cluster(tmp.path()).await?;

    // The join commits while node 4 is unreachable, so node 1 cannot promote it.
    let (listener4, url4) = reserve_listener().await?;
    let peer = join(&node1.raft, "node-4", &url4).await?;
    assert_eq!(peer.node_id, 4);
    node1.shutdown().await?;

    let leader = wait_for_leader_among(
        node2.raft.metrics(),
        &BTreeSet::from([2, 3]),
        Duration::from_secs(15),
    )
    .await?;
    let leader = if leader == node2.node_id { &node2 } else { &node3 };

    let node4 = start_node(listener4, url4, &tmp.path().join("node-4"), 4, "node-4").await?;
    wait_for_voters(
        leader.raft.metrics(),
        BTreeSet::from([1, 2, 3, 4]),
        Duration::from_secs(30),
    )
    .await?;

    let resp = node4
        .raft
        .propose(CreateDatabaseCommand::new("after-failover", 1).into())
        .await?;
    assert!(resp.is_ok(), "create_db: {resp:?}");
    let expected = leader.store.read().await.config().clone();
    wait_for_config(&node4.store, &expected, Duration::from_secs(8)).await?;
    assert!(expected.database("after-failover").is_some());

    node4.shutdown().await?;
    node3.shutdown().await?;
    node2.shutdown().await?;

    Ok(())
}
