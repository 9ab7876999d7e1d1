//! UDP Transport Implementation
//!
//! Two sockets per node:
//! - the unicast socket, bound to the node's identity address, receives
//!   directed messages and sends everything (broadcast enabled)
//! - the broadcast listener, bound to the well-known broadcast port on all
//!   interfaces with address reuse so several nodes can share one host; it
//!   also joins the multicast group when one is configured
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::receiver::UdpReceiver;
use super::stats::{FrozenTransportStats, TransportStats};
use super::traits::Sender;
use super::Datagram;
use crate::error::Result;
use crate::settings::TransportConfig;
use crate::transport_error;

#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast_socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: TransportConfig,
    stats: Arc<TransportStats>,
}

impl UdpTransport {
    /// Bind both sockets. Failure here is fatal for the node.
    pub async fn bind(config: &TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen_udp)
            .await
            .map_err(|e| transport_error!("Failed to bind {}: {}", config.listen_udp, e))?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        let broadcast_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.broadcast.port()));
        let broadcast_socket = bind_shared(broadcast_addr).map_err(|e| {
            transport_error!("Failed to bind broadcast port {}: {}", broadcast_addr, e)
        })?;

        if let Some(group) = config.multicast {
            let interface = match config.listen_udp.ip() {
                IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            broadcast_socket
                .join_multicast_v4(*group.ip(), interface)
                .map_err(|e| transport_error!("Failed to join multicast group {}: {}", group, e))?;
            info!("[{}] Joined multicast group {}", local_addr, group);
        }

        info!(
            "[{}] UDP transport bound, broadcast {} on {}",
            local_addr,
            config.broadcast,
            broadcast_socket.local_addr()?
        );

        Ok(Self {
            socket: Arc::new(socket),
            broadcast_socket: Arc::new(broadcast_socket),
            local_addr,
            config: config.clone(),
            stats: Arc::new(TransportStats::default()),
        })
    }

    /// Port the broadcast listener actually bound
    pub fn broadcast_port(&self) -> Result<u16> {
        Ok(self.broadcast_socket.local_addr()?.port())
    }

    /// Spawn one listener per socket, all feeding `tx`
    pub fn start_receiving(&self, tx: mpsc::Sender<Datagram>) -> Result<Vec<JoinHandle<()>>> {
        let mut listeners = Vec::with_capacity(2);
        for socket in [&self.socket, &self.broadcast_socket] {
            let receiver = UdpReceiver::new(Arc::clone(socket), Arc::clone(&self.stats))?;
            listeners.push(receiver.start(tx.clone()));
        }
        Ok(listeners)
    }

    async fn send(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        let result = self.socket.send_to(data, target).await;
        self.stats.record_send(&result);
        result
            .map(|_| ())
            .map_err(|e| transport_error!("Send to {} failed: {}", target, e))
    }
}

#[async_trait]
impl Sender for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        self.send(target, data).await
    }

    async fn broadcast(&self, data: &[u8]) -> Result<()> {
        self.send(SocketAddr::V4(self.config.broadcast), data).await
    }

    async fn fan_out(&self, data: &[u8]) -> Result<()> {
        match self.config.multicast {
            Some(group) => self.send(SocketAddr::V4(group), data).await,
            None => self.broadcast(data).await,
        }
    }

    fn stats(&self) -> FrozenTransportStats {
        self.stats.freeze()
    }
}

/// Bind a UDP socket that other processes on this host may bind too
fn bind_shared(address: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(socket.into())
}
