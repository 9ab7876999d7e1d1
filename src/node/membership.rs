use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::node::heartbeat::SequenceState;
use crate::node::messages::MemberRecord;
use crate::node::node_id::NodeId;
use crate::node::ring::Ring;

/// A known cluster member
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub is_leader: bool,
    discovered_at: Instant,
}

impl Node {
    fn new(id: NodeId, discovered_at: Instant) -> Self {
        Self {
            id,
            is_leader: false,
            discovered_at,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.id.address
    }
}

/// What `MembershipTable::register` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    Updated,
    /// Known address, new process: sequence state reset and leader flag dropped
    Reincarnated,
}

/// Everything this node believes about the cluster.
///
/// Only the coordinator task touches a table, so nothing here is synchronised.
/// Invariants: every heartbeat stamp and every sequence entry belongs to a
/// registered node, the local node always has both a node entry and a stamp,
/// and at most one node carries the leader flag.
#[derive(Debug)]
pub struct MembershipTable {
    local: NodeId,
    nodes: HashMap<SocketAddr, Node>,
    heartbeats: HashMap<SocketAddr, Instant>,
    sequences: HashMap<SocketAddr, SequenceState>,
    leader: Option<SocketAddr>,
}

impl MembershipTable {
    pub fn new(local: NodeId, now: Instant) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local.address, Node::new(local, now));
        let mut heartbeats = HashMap::new();
        heartbeats.insert(local.address, now);

        Self {
            local,
            nodes,
            heartbeats,
            sequences: HashMap::new(),
            leader: None,
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Insert or refresh a node by address.
    ///
    /// The local entry is never replaced; a foreign claim on our own address is
    /// reported as an update and otherwise ignored.
    pub fn register(&mut self, id: NodeId, now: Instant) -> Registration {
        if id.address == self.local.address {
            return Registration::Updated;
        }

        match self.nodes.get_mut(&id.address) {
            None => {
                self.nodes.insert(id.address, Node::new(id, now));
                Registration::Inserted
            }
            Some(node) if node.id.instance == id.instance => {
                node.id = id;
                Registration::Updated
            }
            Some(node) => {
                *node = Node::new(id, now);
                self.sequences.remove(&id.address);
                if self.leader == Some(id.address) {
                    self.leader = None;
                }
                Registration::Reincarnated
            }
        }
    }

    /// Forget a peer entirely; the local node cannot be removed
    pub fn remove(&mut self, address: &SocketAddr) -> Option<Node> {
        if *address == self.local.address {
            return None;
        }
        self.heartbeats.remove(address);
        self.sequences.remove(address);
        if self.leader == Some(*address) {
            self.leader = None;
        }
        self.nodes.remove(address)
    }

    pub fn lookup(&self, address: &SocketAddr) -> Option<&Node> {
        self.nodes.get(address)
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn members(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true: the local node is always a member
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Move the leader flag to `address`. Returns whether the leader changed.
    pub fn make_leader(&mut self, address: &SocketAddr) -> bool {
        if !self.nodes.contains_key(address) || self.leader == Some(*address) {
            return false;
        }
        if let Some(previous) = self.leader.take() {
            if let Some(node) = self.nodes.get_mut(&previous) {
                node.is_leader = false;
            }
        }
        if let Some(node) = self.nodes.get_mut(address) {
            node.is_leader = true;
        }
        self.leader = Some(*address);
        true
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.leader
            .and_then(|address| self.nodes.get(&address))
            .map(|node| node.id)
    }

    pub fn is_self_leader(&self) -> bool {
        self.leader == Some(self.local.address)
    }

    /// Canonical ring order: every address with a heartbeat stamp
    pub fn sorted_addresses(&self) -> Vec<SocketAddr> {
        let mut addresses: Vec<SocketAddr> = self.heartbeats.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn ring(&self) -> Ring {
        Ring::new(self.heartbeats.keys().copied().collect())
    }

    /// Stamp a known node. Stamps only move forward; unknown addresses are ignored.
    pub fn register_heartbeat(&mut self, address: &SocketAddr, at: Instant) -> bool {
        if !self.nodes.contains_key(address) {
            return false;
        }
        let stamp = self.heartbeats.entry(*address).or_insert(at);
        if at > *stamp {
            *stamp = at;
        }
        true
    }

    pub fn has_heartbeat(&self, address: &SocketAddr) -> bool {
        self.heartbeats.contains_key(address)
    }

    pub fn last_heartbeat(&self, address: &SocketAddr) -> Option<Instant> {
        self.heartbeats.get(address).copied()
    }

    /// Time since we last heard from `address`
    pub fn age(&self, address: &SocketAddr, now: Instant) -> Option<Duration> {
        self.last_heartbeat(address)
            .map(|stamp| now.saturating_duration_since(stamp))
    }

    /// Peers silent for longer than `timeout`.
    ///
    /// A node that never heartbeated is judged by when it was discovered.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut expired: Vec<SocketAddr> = self
            .nodes
            .values()
            .filter(|node| node.address() != self.local.address)
            .filter(|node| {
                let stamp = self
                    .heartbeats
                    .get(&node.address())
                    .copied()
                    .unwrap_or(node.discovered_at);
                now.saturating_duration_since(stamp) > timeout
            })
            .map(Node::address)
            .collect();
        expired.sort();
        expired
    }

    pub fn sequence(&self, address: &SocketAddr) -> Option<&SequenceState> {
        self.sequences.get(address)
    }

    /// Sequence state for a known peer, created on first use
    pub fn sequence_mut(&mut self, address: &SocketAddr) -> Option<&mut SequenceState> {
        if *address == self.local.address || !self.nodes.contains_key(address) {
            return None;
        }
        Some(self.sequences.entry(*address).or_default())
    }

    /// Member list with stamp ages, as sent in `HELLO_REPLY`
    pub fn snapshot(&self, now: Instant) -> Vec<MemberRecord> {
        let mut records: Vec<MemberRecord> = self
            .nodes
            .values()
            .map(|node| MemberRecord {
                id: node.id,
                is_leader: node.is_leader,
                age_ms: self
                    .age(&node.address(), now)
                    .map(|age| age.as_millis() as u64),
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Checks the table invariants; used by tests
    pub fn is_consistent(&self) -> bool {
        let local = self.local.address;
        let leaders: Vec<SocketAddr> = self
            .nodes
            .values()
            .filter(|node| node.is_leader)
            .map(Node::address)
            .collect();

        self.heartbeats.keys().all(|a| self.nodes.contains_key(a))
            && self.sequences.keys().all(|a| self.nodes.contains_key(a))
            && self.nodes.contains_key(&local)
            && self.heartbeats.contains_key(&local)
            && leaders.len() <= 1
            && leaders.first().copied() == self.leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::node_id::InstanceId;

    fn id(port: u16, instance: u64) -> NodeId {
        NodeId::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            InstanceId::new(instance),
        )
    }

    fn table() -> (MembershipTable, Instant) {
        let now = Instant::now();
        (MembershipTable::new(id(9000, 1), now), now)
    }

    #[test]
    fn test_new_table_contains_local() {
        let (table, _) = table();
        assert_eq!(table.len(), 1);
        assert!(table.has_heartbeat(&id(9000, 1).address));
        assert!(table.current_leader().is_none());
        assert!(table.is_consistent());
    }

    #[test]
    fn test_register_is_idempotent() {
        let (mut table, now) = table();
        let peer = id(9001, 5);

        assert_eq!(table.register(peer, now), Registration::Inserted);
        assert_eq!(table.register(peer, now), Registration::Updated);
        assert_eq!(table.len(), 2);
        // registering never stamps a heartbeat
        assert!(!table.has_heartbeat(&peer.address));
        assert_eq!(table.sorted_addresses(), vec![id(9000, 1).address]);
    }

    #[test]
    fn test_reincarnation_resets_state() {
        let (mut table, now) = table();
        let peer = id(9001, 5);
        table.register(peer, now);
        table.register_heartbeat(&peer.address, now);
        table.sequence_mut(&peer.address).unwrap();
        assert!(table.make_leader(&peer.address));

        let restarted = id(9001, 6);
        assert_eq!(table.register(restarted, now), Registration::Reincarnated);
        assert!(table.current_leader().is_none());
        assert!(table.sequence(&peer.address).is_none());
        assert_eq!(table.lookup(&peer.address).unwrap().id, restarted);
        assert!(table.is_consistent());
    }

    #[test]
    fn test_local_node_cannot_be_removed_or_replaced() {
        let (mut table, now) = table();
        let local = table.local();

        assert!(table.remove(&local.address).is_none());
        assert_eq!(table.register(id(9000, 99), now), Registration::Updated);
        assert_eq!(table.lookup(&local.address).unwrap().id, local);
    }

    #[test]
    fn test_remove_clears_every_map() {
        let (mut table, now) = table();
        let peer = id(9001, 5);
        table.register(peer, now);
        table.register_heartbeat(&peer.address, now);
        table.sequence_mut(&peer.address).unwrap();
        table.make_leader(&peer.address);

        assert!(table.remove(&peer.address).is_some());
        assert!(table.remove(&peer.address).is_none());
        assert!(!table.has_heartbeat(&peer.address));
        assert!(table.sequence(&peer.address).is_none());
        assert!(table.current_leader().is_none());
        assert!(table.is_consistent());
    }

    #[test]
    fn test_make_leader_moves_flag() {
        let (mut table, now) = table();
        let peer = id(9001, 5);
        table.register(peer, now);

        assert!(table.make_leader(&peer.address));
        assert!(!table.make_leader(&peer.address), "already leader");
        let local = table.local();
        assert!(table.make_leader(&local.address));
        assert!(table.is_self_leader());
        assert!(!table.lookup(&peer.address).unwrap().is_leader);
        assert!(!table.make_leader(&id(9999, 1).address), "unknown address");
        assert!(table.is_consistent());
    }

    #[test]
    fn test_heartbeats_only_for_known_nodes_and_never_regress() {
        let (mut table, now) = table();
        let peer = id(9001, 5);
        assert!(!table.register_heartbeat(&peer.address, now));

        table.register(peer, now);
        let later = now + Duration::from_millis(500);
        assert!(table.register_heartbeat(&peer.address, later));
        table.register_heartbeat(&peer.address, now);
        assert_eq!(table.last_heartbeat(&peer.address), Some(later));
    }

    #[test]
    fn test_expired_peers() {
        let (mut table, now) = table();
        let fresh = id(9001, 5);
        let stale = id(9002, 5);
        let silent = id(9003, 5);
        for peer in [fresh, stale, silent] {
            table.register(peer, now);
        }
        table.register_heartbeat(&stale.address, now);
        table.register_heartbeat(&fresh.address, now + Duration::from_millis(900));

        let later = now + Duration::from_millis(1001);
        assert_eq!(
            table.expired(later, Duration::from_millis(1000)),
            vec![stale.address, silent.address]
        );
    }

    #[test]
    fn test_snapshot_reports_ages() {
        let (mut table, now) = table();
        let peer = id(9001, 5);
        let quiet = id(9002, 5);
        table.register(peer, now);
        table.register(quiet, now);
        table.register_heartbeat(&peer.address, now);
        table.make_leader(&peer.address);

        let records = table.snapshot(now + Duration::from_millis(250));
        assert_eq!(records.len(), 3);
        let peer_record = records.iter().find(|r| r.id == peer).unwrap();
        assert!(peer_record.is_leader);
        assert_eq!(peer_record.age_ms, Some(250));
        let quiet_record = records.iter().find(|r| r.id == quiet).unwrap();
        assert_eq!(quiet_record.age_ms, None);
    }
}
