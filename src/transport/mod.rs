//! Datagram transports
//!
//! `UdpTransport` is the real network: a unicast socket plus a shared
//! broadcast listener. `MemoryNetwork` connects nodes inside one process and
//! drives the cluster scenario tests under paused tokio time.
pub mod memory;
pub mod receiver;
pub mod stats;
pub mod traits;
pub mod udp_transport;

use std::net::SocketAddr;

use bytes::Bytes;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use receiver::UdpReceiver;
pub use stats::{FrozenTransportStats, TransportStats};
pub use traits::Sender;
pub use udp_transport::UdpTransport;

/// Bound on datagrams queued for the coordinator
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// A raw datagram as received, before any decoding
#[derive(Clone, Debug)]
pub struct Datagram {
    pub data: Bytes,
    pub source: SocketAddr,
}
