use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use metad::{
    command::{CommandOutput, init_registry},
    config::{Cli, Command, Config},
    node_identity::NodeIdentity,
    raft::runtime::RaftOptions,
    state::ClusterStore,
};

const RAFT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let registry = init_registry().context("build command registry")?;
    info!(commands = registry.names().count(), "command registry ready");

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Init => init_node(&cli.config),
        Command::Join(args) => join_cluster(&cli.config, &args.peer).await,
    }
}

fn init_node(config: &Config) -> Result<()> {
    let identity = NodeIdentity::init_bootstrap(
        &config.data_dir,
        config.node_id,
        config.node_name.clone(),
        config.api_base_url.clone(),
    )?;
    ClusterStore::load_or_init(&config.data_dir).context("initialize cluster config store")?;
    info!(
        node_id = identity.node_id,
        node_name = %identity.node_name,
        data_dir = %config.data_dir.display(),
        "initialized bootstrap node"
    );
    Ok(())
}

async fn join_cluster(config: &Config, peer_url: &str) -> Result<()> {
    let url = format!("{}/api/cluster/join", peer_url.trim_end_matches('/'));
    let req = serde_json::json!({
        "name": config.node_name,
        "connection_string": config.api_base_url,
        "protobuf_connection_string": config.data_endpoint,
    });

    let output = reqwest::Client::new()
        .post(url)
        .json(&req)
        .send()
        .await
        .context("send join request")?
        .error_for_status()
        .context("join request rejected")?
        .json::<CommandOutput>()
        .await
        .context("parse join response")?;

    let CommandOutput::Joined { peer } = output else {
        anyhow::bail!("unexpected join response: {output:?}");
    };
    let identity = NodeIdentity::init_joined(
        &config.data_dir,
        peer.node_id,
        peer.name,
        config.api_base_url.clone(),
    )?;
    ClusterStore::load_or_init(&config.data_dir).context("initialize cluster config store")?;
    info!(
        node_id = identity.node_id,
        node_name = %identity.node_name,
        "joined cluster; start the node with `metad run`"
    );
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let identity = NodeIdentity::load(&config.data_dir)?;
    let store = ClusterStore::load_or_init(&config.data_dir).context("open cluster config store")?;
    let store = Arc::new(RwLock::new(store));

    let options = RaftOptions {
        cluster_name: config.cluster_name.clone(),
        node_id: identity.node_id,
        node_name: identity.node_name.clone(),
        heartbeat_interval: config.heartbeat_interval(),
        propose_timeout: config.propose_timeout(),
    };
    let network = metad::raft::network_http::HttpNetworkFactory::new(RAFT_CONNECT_TIMEOUT)?;
    let raft =
        metad::raft::runtime::start_raft(&config.data_dir, &options, store.clone(), network).await?;

    if identity.is_bootstrap_node {
        raft.initialize_single_node_if_needed(identity.node_id, identity.node_meta())
            .await?;
    }

    let state = metad::http::AppState {
        node_id: identity.node_id,
        node_name: identity.node_name.clone(),
        store,
        raft: Arc::new(raft.clone()),
    };
    let app = metad::http::build_router(state, Some(raft.raft())).layer(TraceLayer::new_for_http());

    info!(
        bind = %config.bind,
        node_id = identity.node_id,
        data_dir = %config.data_dir.display(),
        "starting metad"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = raft.raft().shutdown().await {
        warn!(error = %err, "raft shutdown");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
