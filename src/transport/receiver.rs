//! UDP Receiver
//!
//! Reads datagrams off one socket and forwards them, undecoded, to the
//! coordinator's inbound channel.
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::stats::TransportStats;
use super::Datagram;

// Largest UDP payload
const RECV_BUFFER_SIZE: usize = 65536;

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    stats: Arc<TransportStats>,
}

impl UdpReceiver {
    pub fn new(socket: Arc<UdpSocket>, stats: Arc<TransportStats>) -> std::io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Forward datagrams into `tx` until the channel closes
    pub fn start(self, tx: mpsc::Sender<Datagram>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];

            loop {
                match self.socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        let datagram = Datagram {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            source,
                        };
                        if tx.send(datagram).await.is_err() {
                            debug!("Listener on {} stopping: channel closed", self.local_addr);
                            break;
                        }
                    }
                    Err(e) => {
                        self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("UDP receive error on {}: {}", self.local_addr, e);
                    }
                }
            }
        })
    }
}
