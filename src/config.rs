use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "metad",
    about = "Replicated cluster metadata coordinator",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the node: HTTP API, Raft RPC and state machine (default).
    Run,

    /// Create the node identity for the first node of a new cluster.
    Init,

    /// Ask a running cluster to admit this node, then record the assigned id.
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Base URL of any node already in the cluster.
    #[arg(long, value_name = "URL")]
    pub peer: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "METAD_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8090"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "METAD_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Raft node id used by `init`; joined nodes get theirs from the cluster.
    #[arg(
        long,
        global = true,
        env = "METAD_NODE_ID",
        value_name = "ID",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub node_id: u64,

    #[arg(
        long,
        global = true,
        env = "METAD_NODE_NAME",
        value_name = "NAME",
        default_value = "node-1"
    )]
    pub node_name: String,

    /// URL other nodes reach this node at; serves both `/api` and `/raft`.
    #[arg(
        long,
        global = true,
        env = "METAD_API_BASE_URL",
        value_name = "ORIGIN",
        default_value = "http://127.0.0.1:8090"
    )]
    pub api_base_url: String,

    /// Data-plane address advertised to the cluster when joining.
    #[arg(
        long,
        global = true,
        env = "METAD_DATA_ENDPOINT",
        value_name = "ADDR",
        default_value = ""
    )]
    pub data_endpoint: String,

    #[arg(
        long,
        global = true,
        env = "METAD_CLUSTER_NAME",
        value_name = "NAME",
        default_value = "metad"
    )]
    pub cluster_name: String,

    #[arg(
        long = "propose-timeout-secs",
        global = true,
        env = "METAD_PROPOSE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub propose_timeout_secs: u64,

    #[arg(
        long = "heartbeat-interval-ms",
        global = true,
        env = "METAD_HEARTBEAT_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(50..=10_000)
    )]
    pub heartbeat_interval_ms: u64,
}

impl Config {
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_secs(self.propose_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["metad"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.bind, SocketAddr::from(([127, 0, 0, 1], 8090)));
        assert_eq!(cli.config.data_dir, PathBuf::from("./data"));
        assert_eq!(cli.config.node_id, 1);
        assert_eq!(cli.config.node_name, "node-1");
        assert_eq!(cli.config.cluster_name, "metad");
        assert_eq!(cli.config.propose_timeout(), Duration::from_secs(10));
        assert_eq!(cli.config.heartbeat_interval(), Duration::from_millis(500));
    }

    #[test]
    fn join_takes_a_peer_url() {
        let cli = Cli::try_parse_from([
            "metad",
            "join",
            "--peer",
            "http://node-1:8090",
            "--node-name",
            "node-2",
        ])
        .unwrap();
        let Some(Command::Join(args)) = cli.command else {
            panic!("expected join");
        };
        assert_eq!(args.peer, "http://node-1:8090");
        assert_eq!(cli.config.node_name, "node-2");
    }

    #[test]
    fn rejects_zero_node_id() {
        let err = Cli::try_parse_from(["metad", "--node-id", "0"]).unwrap_err();
        assert!(err.to_string().contains("--node-id"));
    }

    #[test]
    fn rejects_invalid_propose_timeout_secs() {
        let err = Cli::try_parse_from(["metad", "--propose-timeout-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--propose-timeout-secs"));
        assert!(msg.contains("1..=300"));
    }

    #[test]
    fn rejects_invalid_heartbeat_interval_ms() {
        let err = Cli::try_parse_from(["metad", "--heartbeat-interval-ms", "10"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--heartbeat-interval-ms"));
        assert!(msg.contains("50..=10000"));
    }
}
