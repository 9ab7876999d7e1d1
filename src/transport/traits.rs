//! Transport traits for the cluster's datagram traffic
//!
//! The coordinator only ever sends through [`Sender`]; inbound datagrams
//! arrive on an `mpsc` channel of [`Datagram`]s filled by the transport's
//! listener tasks.
use std::net::SocketAddr;

use async_trait::async_trait;

use super::stats::FrozenTransportStats;
use crate::error::Result;

/// Trait for sending datagrams to peers in the cluster
#[async_trait]
pub trait Sender: Send + Sync {
    /// Address peers see this transport's datagrams coming from
    fn local_addr(&self) -> SocketAddr;

    /// Send to one peer's identity address
    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()>;

    /// Send to every node in the broadcast domain, including ourselves
    async fn broadcast(&self, data: &[u8]) -> Result<()>;

    /// Heartbeat fan-out; multicast where configured, broadcast otherwise
    async fn fan_out(&self, data: &[u8]) -> Result<()> {
        self.broadcast(data).await
    }

    /// Get transport statistics for monitoring
    fn stats(&self) -> FrozenTransportStats;
}
