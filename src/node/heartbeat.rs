//! Heartbeat sequencing and failure detection.
//!
//! Each node numbers its heartbeats. A receiver delivers them strictly in
//! order per sender, parking early arrivals in a holdback queue until the gap
//! fills or the queue overflows. Delivered heartbeats carry the sender's view
//! of everybody else, which is merged so that a node keeps hearing about peers
//! it cannot reach directly.
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::node::membership::{MembershipTable, Registration};
use crate::node::messages::{AckData, HeartbeatData, PeerCounter};
use crate::node::node_id::NodeId;

/// Per-peer sequence counters plus holdback and delivery queues
#[derive(Debug, Default)]
pub struct SequenceState {
    /// How many of our heartbeats the peer reports having delivered
    sent: u64,
    /// How many of the peer's heartbeats we delivered in order
    received: u64,
    synced: bool,
    holdback: BTreeMap<u64, HeartbeatData>,
    delivery: VecDeque<HeartbeatData>,
}

/// Result of feeding one heartbeat through a `SequenceState`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequencing {
    /// This many heartbeats became deliverable
    Delivered(usize),
    HeldBack,
    Stale,
}

impl SequenceState {
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn held_back(&self) -> usize {
        self.holdback.len()
    }

    /// Raise `sent`; counters never go backwards
    pub fn acknowledge(&mut self, received: u64) {
        self.sent = self.sent.max(received);
    }

    pub fn accept(&mut self, heartbeat: HeartbeatData, holdback_limit: usize) -> Sequencing {
        let seq = heartbeat.seq;
        if !self.synced {
            self.received = seq.saturating_sub(1);
            self.synced = true;
        }

        if seq <= self.received {
            return Sequencing::Stale;
        }

        let before = self.delivery.len();
        if seq == self.received + 1 {
            self.delivery.push_back(heartbeat);
            self.received = seq;
        } else {
            self.holdback.insert(seq, heartbeat);
            if self.holdback.len() > holdback_limit {
                if let Some(oldest) = self.holdback.keys().next().copied() {
                    self.received = oldest - 1;
                }
            }
        }
        self.drain_holdback();

        match self.delivery.len() - before {
            0 => Sequencing::HeldBack,
            delivered => Sequencing::Delivered(delivered),
        }
    }

    /// Heartbeats ready to apply, in sequence order
    pub fn take_ready(&mut self) -> Vec<HeartbeatData> {
        self.delivery.drain(..).collect()
    }

    fn drain_holdback(&mut self) {
        while let Some(next) = self.holdback.remove(&(self.received + 1)) {
            self.received = next.seq;
            self.delivery.push_back(next);
        }
    }
}

/// Reply owed to the sender of a heartbeat
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatReply {
    Ack(AckData),
    NegAck(AckData),
}

#[derive(Debug)]
pub struct HeartbeatOutcome {
    pub registration: Registration,
    pub sequencing: Sequencing,
    pub reply: Option<HeartbeatReply>,
}

/// Peers evicted by one timeout sweep
#[derive(Debug, Default)]
pub struct Sweep {
    pub evicted: Vec<NodeId>,
    pub leader_evicted: bool,
    /// Only the local node is left in the ring
    pub alone: bool,
}

/// Outgoing heartbeat numbering plus the receive-side rules
#[derive(Debug)]
pub struct HeartbeatEngine {
    seq: u64,
    holdback_limit: usize,
    timeout: Duration,
    retransmit: VecDeque<HeartbeatData>,
}

impl HeartbeatEngine {
    pub fn new(holdback_limit: usize, timeout: Duration) -> Self {
        Self {
            seq: 0,
            holdback_limit,
            timeout,
            retransmit: VecDeque::with_capacity(holdback_limit),
        }
    }

    /// Sequence number of the last heartbeat built
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Build the next heartbeat and keep it for retransmission
    pub fn next_heartbeat(&mut self, table: &MembershipTable, now: Instant) -> HeartbeatData {
        let local = table.local();
        self.seq += 1;

        let peers = table
            .sorted_addresses()
            .into_iter()
            .filter(|address| *address != local.address)
            .map(|address| PeerCounter {
                address,
                received: table.sequence(&address).map_or(0, SequenceState::received),
                age_ms: table
                    .age(&address, now)
                    .map_or(0, |age| age.as_millis() as u64),
            })
            .collect();

        let heartbeat = HeartbeatData {
            instance: local.instance,
            seq: self.seq,
            leader: table.current_leader(),
            peers,
        };

        if self.retransmit.len() >= self.holdback_limit {
            self.retransmit.pop_front();
        }
        self.retransmit.push_back(heartbeat.clone());
        heartbeat
    }

    /// Register, stamp and sequence an incoming heartbeat from `from`
    pub fn on_heartbeat(
        &mut self,
        table: &mut MembershipTable,
        from: SocketAddr,
        heartbeat: HeartbeatData,
        now: Instant,
    ) -> HeartbeatOutcome {
        let local = table.local();
        let seq = heartbeat.seq;
        let registration = table.register(NodeId::new(from, heartbeat.instance), now);
        table.register_heartbeat(&from, now);

        let Some(state) = table.sequence_mut(&from) else {
            return HeartbeatOutcome {
                registration,
                sequencing: Sequencing::Stale,
                reply: None,
            };
        };
        let sequencing = state.accept(heartbeat, self.holdback_limit);
        let ready = state.take_ready();
        let received = state.received();

        for delivered in &ready {
            trace!("[{}] Delivered heartbeat {} from {}", local.address, delivered.seq, from);
            if let Some(counter) = delivered.counter_for(&local.address) {
                if let Some(state) = table.sequence_mut(&from) {
                    state.acknowledge(counter.received);
                }
            }
            merge_ages(table, from, delivered, now);
        }

        let reply = match sequencing {
            Sequencing::Stale => None,
            _ if received < seq => Some(HeartbeatReply::NegAck(AckData { received })),
            Sequencing::Delivered(_) => Some(HeartbeatReply::Ack(AckData { received })),
            Sequencing::HeldBack => None,
        };
        if let Some(HeartbeatReply::NegAck(_)) = reply {
            debug!(
                "[{}] Heartbeat gap from {}: have {}, got {}",
                local.address, from, received, seq
            );
        }

        HeartbeatOutcome {
            registration,
            sequencing,
            reply,
        }
    }

    pub fn on_ack(&self, table: &mut MembershipTable, from: &SocketAddr, ack: AckData) {
        if let Some(state) = table.sequence_mut(from) {
            state.acknowledge(ack.received);
        }
    }

    /// Heartbeats `from` is missing that are still in the retransmit buffer
    pub fn on_neg_ack(
        &self,
        table: &mut MembershipTable,
        from: &SocketAddr,
        nack: AckData,
    ) -> Vec<HeartbeatData> {
        self.on_ack(table, from, nack);
        self.retransmit
            .iter()
            .filter(|heartbeat| heartbeat.seq > nack.received)
            .cloned()
            .collect()
    }

    /// Evict every peer whose stamp is older than the failure timeout
    pub fn sweep(&self, table: &mut MembershipTable, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        for address in table.expired(now, self.timeout) {
            if let Some(node) = table.remove(&address) {
                sweep.leader_evicted |= node.is_leader;
                sweep.evicted.push(node.id);
            }
        }
        sweep.alone = table.ring().len() == 1;
        sweep
    }
}

/// Adopt fresher stamps from a peer's view of members we already track
fn merge_ages(table: &mut MembershipTable, from: SocketAddr, heartbeat: &HeartbeatData, now: Instant) {
    let local = table.local().address;
    for peer in &heartbeat.peers {
        if peer.address == local || peer.address == from || !table.has_heartbeat(&peer.address) {
            continue;
        }
        if let Some(stamp) = now.checked_sub(Duration::from_millis(peer.age_ms)) {
            table.register_heartbeat(&peer.address, stamp);
        }
    }
}
