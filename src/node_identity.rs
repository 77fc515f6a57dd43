use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::raft::types::{NodeId, NodeMeta};

pub const NODE_IDENTITY_SCHEMA_VERSION: u32 = 1;

const NODE_IDENTITY_FILE_NAME: &str = "node.json";

/// Who this node is inside the cluster. Written once by `init` or `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub schema_version: u32,
    pub node_id: NodeId,
    pub node_name: String,
    pub api_base_url: String,
    /// `true` for the node that initialized the cluster; only it may
    /// bootstrap single-node membership.
    pub is_bootstrap_node: bool,
}

impl NodeIdentity {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(NODE_IDENTITY_FILE_NAME)
    }

    pub fn init_bootstrap(
        data_dir: &Path,
        node_id: NodeId,
        node_name: String,
        api_base_url: String,
    ) -> anyhow::Result<Self> {
        Self::create(data_dir, node_id, node_name, api_base_url, true)
    }

    /// Records the id the cluster assigned in reply to a join request.
    pub fn init_joined(
        data_dir: &Path,
        node_id: NodeId,
        node_name: String,
        api_base_url: String,
    ) -> anyhow::Result<Self> {
        Self::create(data_dir, node_id, node_name, api_base_url, false)
    }

    fn create(
        data_dir: &Path,
        node_id: NodeId,
        node_name: String,
        api_base_url: String,
        is_bootstrap_node: bool,
    ) -> anyhow::Result<Self> {
        let path = Self::path(data_dir);
        if path.exists() {
            anyhow::bail!("node identity already exists at {}", path.display());
        }
        let identity = Self {
            schema_version: NODE_IDENTITY_SCHEMA_VERSION,
            node_id,
            node_name,
            api_base_url,
            is_bootstrap_node,
        };
        identity.save(data_dir)?;
        Ok(identity)
    }

    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        let path = Self::path(data_dir);
        let bytes = serde_json::to_vec_pretty(self).context("serialize node identity")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = Self::path(data_dir);
        let bytes = fs::read(&path).with_context(|| {
            format!(
                "read {} (run `metad init` or `metad join` first)",
                path.display()
            )
        })?;
        let identity: Self = serde_json::from_slice(&bytes).context("parse node identity")?;
        if identity.schema_version != NODE_IDENTITY_SCHEMA_VERSION {
            anyhow::bail!(
                "node identity schema_version mismatch: expected {}, got {}",
                NODE_IDENTITY_SCHEMA_VERSION,
                identity.schema_version
            );
        }
        Ok(identity)
    }

    pub fn node_meta(&self) -> NodeMeta {
        NodeMeta::single_listener(self.node_name.clone(), self.api_base_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn init_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let created = NodeIdentity::init_bootstrap(
            tmp.path(),
            1,
            "node-1".to_string(),
            "http://127.0.0.1:8090".to_string(),
        )
        .unwrap();
        let loaded = NodeIdentity::load(tmp.path()).unwrap();
        assert_eq!(loaded, created);
        assert!(loaded.is_bootstrap_node);
        assert_eq!(loaded.node_meta().raft_endpoint, "http://127.0.0.1:8090");
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        NodeIdentity::init_joined(tmp.path(), 4, "node-4".to_string(), String::new()).unwrap();
        let err = NodeIdentity::init_bootstrap(tmp.path(), 1, "node-1".to_string(), String::new())
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(NodeIdentity::load(tmp.path()).unwrap().node_id, 4);
    }

    #[test]
    fn load_rejects_unknown_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let mut identity =
            NodeIdentity::init_joined(tmp.path(), 2, "node-2".to_string(), String::new()).unwrap();
        identity.schema_version = 99;
        identity.save(tmp.path()).unwrap();
        let err = NodeIdentity::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("schema_version mismatch"));
    }

    #[test]
    fn missing_identity_points_at_init() {
        let tmp = tempfile::tempdir().unwrap();
        let err = NodeIdentity::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("metad init"));
    }
}
