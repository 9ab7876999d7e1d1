/// Commands are sent to the coordinator task inside a single node.
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::node::node_id::NodeId;
use crate::transport::FrozenTransportStats;

/// Commands that can be sent to the cluster coordinator
#[derive(Debug)]
pub enum ClusterCommand {
    /// Report the coordinator's view of the cluster
    GetStatus {
        resp_chan: oneshot::Sender<ClusterStatus>,
    },
    /// Opaque state the leader hands to joining nodes
    SetSnapshot { snapshot: Option<Value> },
    /// Broadcast application state to every peer
    BroadcastDelta {
        delta: Value,
        resp_chan: oneshot::Sender<Result<()>>,
    },
    /// Start a candidacy now
    StartElection,
    Shutdown,
}

/// Application-level traffic surfaced to handle subscribers
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterEvent {
    /// Snapshot attached to the `HELLO_REPLY` we received while joining
    Snapshot { from: SocketAddr, snapshot: Value },
    Delta { from: SocketAddr, delta: Value },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MemberStatus {
    pub id: NodeId,
    pub is_leader: bool,
    pub in_ring: bool,
    /// Milliseconds since the last heartbeat, if one was ever seen
    pub age_ms: Option<u64>,
    pub sent: u64,
    pub received: u64,
    pub held_back: usize,
}

/// Cluster view reported by `GET /cluster`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ClusterStatus {
    pub node: NodeId,
    pub leader: Option<NodeId>,
    pub is_leader: bool,
    pub ring: Vec<SocketAddr>,
    pub members: Vec<MemberStatus>,
    pub election_in_progress: bool,
    pub heartbeat_seq: u64,
    pub transport: FrozenTransportStats,
    pub started_at: DateTime<Utc>,
}
