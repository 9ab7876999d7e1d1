//! A cluster node: the coordinator task plus the handle used to talk to it.
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod commands;
pub mod controller;
pub mod election;
pub mod heartbeat;
pub mod membership;
pub mod messages;
pub mod node_id;
pub mod ring;

use crate::error::{ClusterError, Result};
use crate::settings::Settings;
use crate::transport::{Datagram, Sender, UdpTransport, INBOUND_CHANNEL_CAPACITY};
pub use commands::{ClusterCommand, ClusterEvent, ClusterStatus, MemberStatus};
pub use controller::ClusterController;
pub use node_id::{InstanceId, NodeId};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cheap, cloneable access to a running node
#[derive(Clone, Debug)]
pub struct ClusterHandle {
    local: NodeId,
    command_tx: mpsc::Sender<ClusterCommand>,
    leader_rx: watch::Receiver<Option<NodeId>>,
    events_tx: broadcast::Sender<ClusterEvent>,
}

impl ClusterHandle {
    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn current_leader(&self) -> Option<SocketAddr> {
        self.leader_rx.borrow().map(|leader| leader.address)
    }

    pub fn current_leader_id(&self) -> Option<NodeId> {
        *self.leader_rx.borrow()
    }

    pub fn is_self_leader(&self) -> bool {
        *self.leader_rx.borrow() == Some(self.local)
    }

    pub fn subscribe_leader(&self) -> watch::Receiver<Option<NodeId>> {
        self.leader_rx.clone()
    }

    /// Run `callback` on a spawned task for every leader change
    pub fn on_leader_changed<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Option<NodeId>) + Send + 'static,
    {
        let mut leader_rx = self.leader_rx.clone();
        tokio::spawn(async move {
            while leader_rx.changed().await.is_ok() {
                let leader = *leader_rx.borrow_and_update();
                callback(leader);
            }
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_tx.subscribe()
    }

    /// Called with the snapshot handed over by the leader when we join
    pub fn on_state_snapshot<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SocketAddr, Value) + Send + 'static,
    {
        self.on_event(move |event| {
            if let ClusterEvent::Snapshot { from, snapshot } = event {
                callback(from, snapshot);
            }
        })
    }

    /// Called with every state delta broadcast by a peer
    pub fn on_state_delta<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SocketAddr, Value) + Send + 'static,
    {
        self.on_event(move |event| {
            if let ClusterEvent::Delta { from, delta } = event {
                callback(from, delta);
            }
        })
    }

    fn on_event<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ClusterEvent) + Send + 'static,
    {
        let mut events_rx = self.events_tx.subscribe();
        let local = self.local.address;
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[{}] Event subscriber lagged, {} events lost", local, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Opaque state attached to every `HELLO_REPLY` while we lead
    pub async fn set_state_snapshot(&self, snapshot: Value) -> Result<()> {
        self.command_tx
            .send(ClusterCommand::SetSnapshot {
                snapshot: Some(snapshot),
            })
            .await?;
        Ok(())
    }

    pub async fn broadcast_state_delta(&self, delta: Value) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(ClusterCommand::BroadcastDelta {
                delta,
                resp_chan: resp_tx,
            })
            .await?;
        resp_rx.await?
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(ClusterCommand::GetStatus { resp_chan: resp_tx })
            .await?;
        Ok(resp_rx.await?)
    }

    pub async fn start_election(&self) -> Result<()> {
        self.command_tx.send(ClusterCommand::StartElection).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(ClusterCommand::Shutdown).await?;
        Ok(())
    }
}

/// Owns the coordinator and listener tasks of one node
#[derive(Debug)]
pub struct ClusterNode {
    handle: ClusterHandle,
    coordinator: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
}

impl ClusterNode {
    /// Bind the UDP sockets and start participating in the cluster
    pub async fn start(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let transport = UdpTransport::bind(&settings.transport_config()).await?;
        let local = NodeId::generate(transport.local_addr());
        info!("[{}] Node identity {}", local.address, local);

        let (datagram_tx, datagram_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let listeners = transport.start_receiving(datagram_tx)?;

        let mut node = Self::spawn(settings, local, Arc::new(transport), datagram_rx);
        node.listeners = listeners;
        Ok(node)
    }

    /// Start a coordinator over any transport
    pub fn spawn(
        settings: Settings,
        local: NodeId,
        transport: Arc<dyn Sender>,
        datagram_rx: mpsc::Receiver<Datagram>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (leader_tx, leader_rx) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let controller =
            ClusterController::new(settings, local, transport, leader_tx, events_tx.clone());
        let coordinator = tokio::spawn(controller.start(command_rx, datagram_rx));

        Self {
            handle: ClusterHandle {
                local,
                command_tx,
                leader_rx,
                events_tx,
            },
            coordinator: Some(coordinator),
            listeners: Vec::new(),
        }
    }

    pub fn handle(&self) -> ClusterHandle {
        self.handle.clone()
    }

    pub fn local(&self) -> NodeId {
        self.handle.local
    }

    /// Stop the coordinator, wait for it, then stop the listeners
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(coordinator) = self.coordinator.take() {
            // a closed channel means the coordinator already stopped
            let _ = self.handle.shutdown().await;
            coordinator
                .await
                .map_err(|e| ClusterError::Concurrency(format!("Coordinator task failed: {}", e)))?;
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        Ok(())
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.abort();
        }
        for listener in &self.listeners {
            listener.abort();
        }
    }
}
