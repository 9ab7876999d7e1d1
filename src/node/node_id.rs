use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Process-lifetime token, regenerated on every start so that a restarted
/// node is never confused with its former incarnation at the same address.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, PartialOrd, Ord, Eq, Hash,
)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Identity of a cluster node.
///
/// The derived ordering (address first, then instance) is the election rank:
/// total, and unique even when two nodes share a port on different hosts.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct NodeId {
    pub address: SocketAddr,
    pub instance: InstanceId,
}

impl NodeId {
    pub fn new(address: SocketAddr, instance: InstanceId) -> Self {
        Self { address, instance }
    }

    /// Identity for a freshly started process
    pub fn generate(address: SocketAddr) -> Self {
        Self::new(address, InstanceId::random())
    }

    /// Whether a datagram from `source` carrying `port` originated here
    pub fn is_origin_of(&self, source: SocketAddr, port: u16) -> bool {
        source.ip() == self.address.ip() && port == self.address.port()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.instance)
    }
}
