//! Consensus membership driven by committed `raft:join` entries.
//!
//! Applying a join only records the peer in the replicated [`PeerTable`]. The
//! network side (adding the learner and promoting it to voter) runs on the leader
//! in a separate task fed by [`MembershipHandle`], so `apply` never waits on RPCs.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use openraft::{ChangeMembers, StoredMembership};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    command::{ConsensusServer, MembershipError, Peer},
    raft::types::{NodeId, NodeMeta, TypeConfig},
};

/// [`ConsensusServer`] over the state machine's peer table.
///
/// Node ids are derived from the replicated state only, so every replica assigns
/// the same id to the same join entry.
pub struct PeerTable<'a> {
    node_name: &'a str,
    peers: &'a mut BTreeMap<String, Peer>,
    membership: &'a StoredMembership<NodeId, NodeMeta>,
}

impl<'a> PeerTable<'a> {
    pub fn new(
        node_name: &'a str,
        peers: &'a mut BTreeMap<String, Peer>,
        membership: &'a StoredMembership<NodeId, NodeMeta>,
    ) -> Self {
        Self {
            node_name,
            peers,
            membership,
        }
    }

    fn next_node_id(&self) -> Result<NodeId, MembershipError> {
        let from_peers = self.peers.values().map(|p| p.node_id);
        let from_membership = self.membership.membership().nodes().map(|(id, _)| *id);
        from_peers
            .chain(from_membership)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or(MembershipError::NodeIdsExhausted)
    }
}

impl ConsensusServer for PeerTable<'_> {
    fn name(&self) -> &str {
        self.node_name
    }

    fn add_peer(
        &mut self,
        name: &str,
        connection_string: &str,
        protobuf_connection_string: &str,
    ) -> Result<Peer, MembershipError> {
        if name.trim().is_empty() {
            return Err(MembershipError::InvalidPeerName {
                name: name.to_string(),
            });
        }

        if let Some(existing) = self.peers.get(name) {
            if existing.connection_string == connection_string {
                return Ok(existing.clone());
            }
            return Err(MembershipError::PeerConflict {
                name: name.to_string(),
                existing_connection_string: existing.connection_string.clone(),
            });
        }

        // A node that bootstrapped the cluster is a member without ever joining.
        let member_id = self
            .membership
            .membership()
            .nodes()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| *id);
        let node_id = match member_id {
            Some(id) => id,
            None => self.next_node_id()?,
        };

        let peer = Peer {
            node_id,
            name: name.to_string(),
            connection_string: connection_string.to_string(),
            protobuf_connection_string: protobuf_connection_string.to_string(),
        };
        self.peers.insert(peer.name.clone(), peer.clone());
        Ok(peer)
    }
}

/// Publishes the replicated peer table to the membership worker.
#[derive(Debug, Clone, Default)]
pub struct MembershipHandle {
    tx: Option<watch::Sender<BTreeMap<String, Peer>>>,
}

/// Receiving side of [`MembershipHandle::channel`], consumed by the worker.
#[derive(Debug)]
pub struct PeerUpdates {
    rx: watch::Receiver<BTreeMap<String, Peer>>,
}

impl PeerUpdates {
    #[cfg(test)]
    pub(crate) fn current(&self) -> BTreeMap<String, Peer> {
        self.rx.borrow().clone()
    }
}

impl MembershipHandle {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// The state machine is built before the Raft instance exists, so the worker is
    /// attached afterwards with [`spawn_membership_worker`].
    pub fn channel() -> (Self, PeerUpdates) {
        let (tx, rx) = watch::channel(BTreeMap::new());
        (Self { tx: Some(tx) }, PeerUpdates { rx })
    }

    /// Wakes the worker only when the table actually changed.
    pub fn publish(&self, peers: &BTreeMap<String, Peer>) {
        if let Some(tx) = &self.tx {
            tx.send_if_modified(|current| {
                if current == peers {
                    return false;
                }
                *current = peers.clone();
                true
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Pause between reconcile passes while some peer is still not a voter.
    pub retry_interval: Duration,
    /// Upper bound for one learner catch-up plus promotion.
    pub admit_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(500),
            admit_timeout: Duration::from_secs(10),
        }
    }
}

/// Keeps consensus membership in line with the replicated peer table.
///
/// Every recorded peer that is not a voter is admitted by whichever node is leader.
/// A pass runs when the table changes, when this node gains leadership, and
/// periodically, so an admission cut short by a failure or a leader change is
/// picked up again.
pub fn spawn_membership_worker(
    raft: openraft::Raft<TypeConfig>,
    node_id: NodeId,
    updates: PeerUpdates,
    options: WorkerOptions,
) {
    tokio::spawn(membership_task(raft, node_id, updates.rx, options));
}

async fn membership_task(
    raft: openraft::Raft<TypeConfig>,
    node_id: NodeId,
    mut peers: watch::Receiver<BTreeMap<String, Peer>>,
    options: WorkerOptions,
) {
    let mut metrics = raft.metrics();
    let mut was_leader = false;
    let mut periodic = tokio::time::interval_at(
        Instant::now() + options.retry_interval,
        options.retry_interval,
    );
    periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = peers.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = metrics.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_leader = metrics.borrow_and_update().current_leader == Some(node_id);
                if is_leader == was_leader {
                    continue;
                }
                was_leader = is_leader;
                if is_leader {
                    debug!(node_id, "became leader; reconciling peers");
                }
            }
            _ = periodic.tick() => {}
        }

        let table = peers.borrow_and_update().clone();
        reconcile_peers(&raft, node_id, &table, &options).await;
    }
}

async fn reconcile_peers(
    raft: &openraft::Raft<TypeConfig>,
    node_id: NodeId,
    peers: &BTreeMap<String, Peer>,
    options: &WorkerOptions,
) {
    let pending = {
        let metrics = raft.metrics();
        let m = metrics.borrow();
        if m.current_leader != Some(node_id) {
            return;
        }
        missing_voters(peers, &m.membership_config)
    };

    for peer in pending {
        match tokio::time::timeout(options.admit_timeout, admit_peer(raft, &peer)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(peer = %peer.name, node_id = peer.node_id, error = %err, "peer admission failed; will retry");
            }
            Err(_) => {
                warn!(peer = %peer.name, node_id = peer.node_id, "peer admission timed out; will retry");
            }
        }
    }
}

/// Recorded peers that are not voters yet, in node id order.
pub fn missing_voters(
    peers: &BTreeMap<String, Peer>,
    membership: &StoredMembership<NodeId, NodeMeta>,
) -> Vec<Peer> {
    let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
    let mut missing: Vec<Peer> = peers
        .values()
        .filter(|peer| !voters.contains(&peer.node_id))
        .cloned()
        .collect();
    missing.sort_by_key(|peer| peer.node_id);
    missing
}

async fn admit_peer(raft: &openraft::Raft<TypeConfig>, peer: &Peer) -> anyhow::Result<()> {
    let node = NodeMeta::single_listener(peer.name.clone(), peer.connection_string.clone());
    raft.add_learner(peer.node_id, node, true).await?;
    raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([peer.node_id])), true)
        .await?;
    info!(peer = %peer.name, node_id = peer.node_id, "peer promoted to voter");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use openraft::{LogId, Membership};
    use pretty_assertions::assert_eq;

    use super::*;

    fn bootstrap_membership() -> StoredMembership<NodeId, NodeMeta> {
        let nodes = BTreeMap::from([(
            1,
            NodeMeta::single_listener("node-1", "http://127.0.0.1:8090"),
        )]);
        let membership = Membership::new(vec![BTreeSet::from([1])], nodes);
        StoredMembership::new(
            Some(LogId::new(openraft::CommittedLeaderId::new(1, 1), 1)),
            membership,
        )
    }

    #[test]
    fn ids_follow_the_highest_known_node() {
        let membership = bootstrap_membership();
        let mut peers = BTreeMap::new();
        let mut table = PeerTable::new("node-1", &mut peers, &membership);

        let a = table.add_peer("node-2", "http://n2:8090", "n2:8099").unwrap();
        let b = table.add_peer("node-3", "http://n3:8090", "").unwrap();
        assert_eq!(a.node_id, 2);
        assert_eq!(b.node_id, 3);
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn identical_rejoin_is_idempotent() {
        let membership = StoredMembership::default();
        let mut peers = BTreeMap::new();
        let mut table = PeerTable::new("node-1", &mut peers, &membership);

        let first = table.add_peer("node-2", "http://n2:8090", "").unwrap();
        let again = table.add_peer("node-2", "http://n2:8090", "").unwrap();
        assert_eq!(first, again);
        assert_eq!(first.node_id, 1);
    }

    #[test]
    fn rejoin_with_other_address_conflicts() {
        let membership = StoredMembership::default();
        let mut peers = BTreeMap::new();
        let mut table = PeerTable::new("node-1", &mut peers, &membership);

        table.add_peer("node-2", "http://n2:8090", "").unwrap();
        let err = table.add_peer("node-2", "http://elsewhere:8090", "").unwrap_err();
        assert_eq!(
            err,
            MembershipError::PeerConflict {
                name: "node-2".to_string(),
                existing_connection_string: "http://n2:8090".to_string(),
            }
        );
    }

    #[test]
    fn bootstrap_member_keeps_its_id() {
        let membership = bootstrap_membership();
        let mut peers = BTreeMap::new();
        let mut table = PeerTable::new("node-1", &mut peers, &membership);

        let peer = table.add_peer("node-1", "http://127.0.0.1:8090", "").unwrap();
        assert_eq!(peer.node_id, 1);
    }

    #[test]
    fn empty_name_is_rejected() {
        let membership = StoredMembership::default();
        let mut peers = BTreeMap::new();
        let mut table = PeerTable::new("node-1", &mut peers, &membership);

        let err = table.add_peer(" ", "http://n2:8090", "").unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert!(peers.is_empty());
    }

    fn peer(node_id: NodeId) -> Peer {
        Peer {
            node_id,
            name: format!("node-{node_id}"),
            connection_string: format!("http://n{node_id}:8090"),
            protobuf_connection_string: String::new(),
        }
    }

    #[tokio::test]
    async fn publish_wakes_worker_only_on_change() {
        let (handle, mut updates) = MembershipHandle::channel();
        let table = BTreeMap::from([("node-2".to_string(), peer(2))]);

        handle.publish(&table);
        assert!(updates.rx.has_changed().unwrap());
        assert_eq!(*updates.rx.borrow_and_update(), table);

        handle.publish(&table);
        assert!(!updates.rx.has_changed().unwrap());

        MembershipHandle::noop().publish(&table);
    }

    #[test]
    fn recorded_peers_outside_the_voter_set_are_pending() {
        // Node 4 was recorded and added as a learner, but its promotion never ran.
        let nodes = BTreeMap::from([
            (1, NodeMeta::single_listener("node-1", "http://n1:8090")),
            (2, NodeMeta::single_listener("node-2", "http://n2:8090")),
            (4, NodeMeta::single_listener("node-4", "http://n4:8090")),
        ]);
        let membership = StoredMembership::new(
            Some(LogId::new(openraft::CommittedLeaderId::new(2, 2), 9)),
            Membership::new(vec![BTreeSet::from([1, 2])], nodes),
        );
        let peers = BTreeMap::from([
            ("node-4".to_string(), peer(4)),
            ("node-2".to_string(), peer(2)),
            ("node-3".to_string(), peer(3)),
        ]);

        let pending = missing_voters(&peers, &membership);
        assert_eq!(
            pending.iter().map(|p| p.node_id).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(missing_voters(&BTreeMap::new(), &membership).is_empty());
    }

    #[test]
    fn node_ids_do_not_wrap() {
        let nodes = BTreeMap::from([(
            NodeId::MAX,
            NodeMeta::single_listener("node-max", "http://max:8090"),
        )]);
        let membership = StoredMembership::new(
            None,
            Membership::new(vec![BTreeSet::from([NodeId::MAX])], nodes),
        );
        let mut peers = BTreeMap::new();
        let mut table = PeerTable::new("node-max", &mut peers, &membership);

        let err = table.add_peer("node-2", "http://n2:8090", "").unwrap_err();
        assert_eq!(err, MembershipError::NodeIdsExhausted);
        assert_eq!(err.code(), "conflict");
        assert!(peers.is_empty());
    }
}
