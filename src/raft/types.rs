use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::command::{CommandEnvelope, CommandOutput};

pub type NodeId = u64;

/// Node metadata stored in the Raft membership config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub name: String,

    /// Base URL of the node's HTTP API.
    pub api_base_url: String,

    /// Base URL the Raft RPC routes (`/raft/*`) are served from.
    pub raft_endpoint: String,
}

impl NodeMeta {
    /// Metadata for a node whose API and Raft RPC share one listener.
    pub fn single_listener(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            name: name.into(),
            api_base_url: base_url.clone(),
            raft_endpoint: base_url,
        }
    }
}

/// What the state machine hands back for each applied entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok { output: CommandOutput },
    Err { code: String, message: String },
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// OpenRaft type configuration: the log carries command envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = CommandEnvelope;
    type R = CommandResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
