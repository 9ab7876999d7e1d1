//! In-process network for deterministic cluster tests.
//!
//! Every attached address gets a bounded inbox. Sends never fail: a datagram
//! for a detached address or a full inbox is dropped, as UDP would. A loss
//! filter can discard chosen datagrams on top of that.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::stats::{FrozenTransportStats, TransportStats};
use super::traits::Sender;
use super::{Datagram, INBOUND_CHANNEL_CAPACITY};
use crate::error::{ClusterError, Result};

/// Decides from the sender and the raw bytes whether a datagram is lost
type LossFilter = Box<dyn FnMut(SocketAddr, &[u8]) -> bool + Send>;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Datagram>>>>,
    loss: Arc<Mutex<Option<LossFilter>>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("inboxes", &self.inboxes)
            .finish_non_exhaustive()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network at `address`
    pub fn attach(&self, address: SocketAddr) -> Result<(MemoryTransport, mpsc::Receiver<Datagram>)> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.lock()?.insert(address, tx);
        let transport = MemoryTransport {
            address,
            network: self.clone(),
            stats: Arc::new(TransportStats::default()),
        };
        Ok((transport, rx))
    }

    /// Cut `address` off; it neither receives nor can be reached any more
    pub fn detach(&self, address: &SocketAddr) -> Result<()> {
        self.lock()?.remove(address);
        Ok(())
    }

    /// Lose every datagram for which `filter` returns true, until cleared
    pub fn set_loss<F>(&self, filter: F) -> Result<()>
    where
        F: FnMut(SocketAddr, &[u8]) -> bool + Send + 'static,
    {
        *self.lock_loss()? = Some(Box::new(filter));
        Ok(())
    }

    pub fn clear_loss(&self) -> Result<()> {
        *self.lock_loss()? = None;
        Ok(())
    }

    pub fn attached(&self) -> Result<Vec<SocketAddr>> {
        let mut addresses: Vec<SocketAddr> = self.lock()?.keys().copied().collect();
        addresses.sort();
        Ok(addresses)
    }

    fn deliver(&self, source: SocketAddr, targets: Option<SocketAddr>, data: &[u8]) -> Result<()> {
        let inboxes = self.lock()?;
        if !inboxes.contains_key(&source) {
            return Ok(());
        }
        if let Some(lost) = self.lock_loss()?.as_mut() {
            if lost(source, data) {
                return Ok(());
            }
        }
        let data = Bytes::copy_from_slice(data);
        let send = |tx: &mpsc::Sender<Datagram>| {
            let _ = tx.try_send(Datagram {
                data: data.clone(),
                source,
            });
        };
        match targets {
            Some(target) => {
                if let Some(tx) = inboxes.get(&target) {
                    send(tx);
                }
            }
            None => inboxes.values().for_each(send),
        }
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SocketAddr, mpsc::Sender<Datagram>>>> {
        self.inboxes
            .lock()
            .map_err(|e| ClusterError::Concurrency(format!("Mutex lock fail {}", e)))
    }

    fn lock_loss(&self) -> Result<std::sync::MutexGuard<'_, Option<LossFilter>>> {
        self.loss
            .lock()
            .map_err(|e| ClusterError::Concurrency(format!("Mutex lock fail {}", e)))
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    address: SocketAddr,
    network: MemoryNetwork,
    stats: Arc<TransportStats>,
}

#[async_trait]
impl Sender for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.address
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        let result = self.network.deliver(self.address, Some(target), data);
        self.stats.record_send(&result);
        result
    }

    async fn broadcast(&self, data: &[u8]) -> Result<()> {
        let result = self.network.deliver(self.address, None, data);
        self.stats.record_send(&result);
        result
    }

    fn stats(&self) -> FrozenTransportStats {
        self.stats.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_unicast_and_broadcast() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.attach(addr(1)).unwrap();
        let (_b, mut b_rx) = network.attach(addr(2)).unwrap();

        a.send_to(addr(2), b"direct").await.unwrap();
        let datagram = b_rx.recv().await.unwrap();
        assert_eq!(&datagram.data[..], b"direct");
        assert_eq!(datagram.source, addr(1));

        a.broadcast(b"all").await.unwrap();
        assert_eq!(&b_rx.recv().await.unwrap().data[..], b"all");
        // broadcasts loop back to the sender
        assert_eq!(&a_rx.recv().await.unwrap().data[..], b"all");
        assert_eq!(a.stats().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_detached_nodes_are_silent() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.attach(addr(1)).unwrap();
        let (b, mut b_rx) = network.attach(addr(2)).unwrap();

        network.detach(&addr(1)).unwrap();
        a.broadcast(b"lost").await.unwrap();
        assert!(b_rx.try_recv().is_err());

        // sends to a detached address vanish without error
        b.send_to(addr(1), b"nobody home").await.unwrap();
        assert_eq!(network.attached().unwrap(), vec![addr(2)]);
    }

    #[tokio::test]
    async fn test_loss_filter_drops_matching_datagrams() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.attach(addr(1)).unwrap();
        let (_b, mut b_rx) = network.attach(addr(2)).unwrap();

        let mut budget = 1;
        network
            .set_loss(move |_, data| {
                let lost = budget > 0 && data.starts_with(b"vote");
                if lost {
                    budget -= 1;
                }
                lost
            })
            .unwrap();

        a.send_to(addr(2), b"vote 1").await.unwrap();
        a.send_to(addr(2), b"vote 2").await.unwrap();
        a.send_to(addr(2), b"other").await.unwrap();
        assert_eq!(&b_rx.recv().await.unwrap().data[..], b"vote 2");
        assert_eq!(&b_rx.recv().await.unwrap().data[..], b"other");

        network.clear_loss().unwrap();
        a.send_to(addr(2), b"vote 3").await.unwrap();
        assert_eq!(&b_rx.recv().await.unwrap().data[..], b"vote 3");
    }
}
