use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::commands::{ClusterCommand, ClusterEvent, ClusterStatus, MemberStatus};
use super::election::{ElectionAction, ElectionEngine, ElectionId};
use super::heartbeat::{HeartbeatEngine, HeartbeatReply};
use super::membership::{MembershipTable, Registration};
use super::messages::{HeartbeatData, HelloData, HelloReplyData, Message, Payload, ResultData};
use super::node_id::NodeId;
use crate::error::{ClusterError, Result};
use crate::settings::Settings;
use crate::transport::{Datagram, Sender};

/// Single owner of all cluster state for one node.
///
/// Datagrams from the listeners, commands from handles and the heartbeat
/// timer are multiplexed in one loop, so membership, election rounds and
/// sequence counters are never shared.
pub struct ClusterController {
    settings: Settings,
    local: NodeId,
    table: MembershipTable,
    heartbeat: HeartbeatEngine,
    election: ElectionEngine,
    transport: Arc<dyn Sender>,
    leader_tx: watch::Sender<Option<NodeId>>,
    events_tx: broadcast::Sender<ClusterEvent>,
    snapshot: Option<Value>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("local", &self.local)
            .field("members", &self.table.len())
            .field("leader", &self.table.current_leader())
            .finish()
    }
}

impl ClusterController {
    pub fn new(
        settings: Settings,
        local: NodeId,
        transport: Arc<dyn Sender>,
        leader_tx: watch::Sender<Option<NodeId>>,
        events_tx: broadcast::Sender<ClusterEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            table: MembershipTable::new(local, now),
            heartbeat: HeartbeatEngine::new(settings.holdback_limit, settings.failure_timeout()),
            election: ElectionEngine::new(local),
            settings,
            local,
            transport,
            leader_tx,
            events_tx,
            snapshot: None,
            started: now,
            started_at: Utc::now(),
        }
    }

    /// Run until shutdown is requested or every handle is gone
    pub async fn start(
        mut self,
        mut command_rx: mpsc::Receiver<ClusterCommand>,
        mut datagram_rx: mpsc::Receiver<Datagram>,
    ) {
        info!(
            "[{}] Starting coordinator: heartbeat every {}ms, timeout {}ms",
            self.local, self.settings.delay_ms, self.settings.timeout_ms
        );
        if let Err(e) = self.announce().await {
            warn!("[{}] Failed to announce ourselves: {}", self.local.address, e);
        }

        let mut heartbeat_timer = time::interval(self.settings.heartbeat_interval());
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Datagrams from the listeners
                Some(datagram) = datagram_rx.recv() => {
                    let source = datagram.source;
                    if let Err(e) = self.handle_datagram(datagram).await {
                        warn!("[{}] Dropping datagram from {}: {}", self.local.address, source, e);
                    }
                }
                // Requests from handles
                cmd = command_rx.recv() => match cmd {
                    Some(ClusterCommand::Shutdown) | None => {
                        info!("[{}] Coordinator shutting down", self.local.address);
                        break;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd).await {
                            debug!("[{}] Error processing command: {}", self.local.address, e);
                        }
                    }
                },
                _ = heartbeat_timer.tick() => {
                    if let Err(e) = self.handle_tick().await {
                        warn!("[{}] Error during heartbeat tick: {}", self.local.address, e);
                    }
                }
            }
        }
    }

    async fn announce(&self) -> Result<()> {
        info!("[{}] Announcing on the broadcast channel", self.local.address);
        self.broadcast(Payload::Hello(HelloData {
            instance: self.local.instance,
        }))
        .await
    }

    async fn handle_command(&mut self, cmd: ClusterCommand) -> Result<()> {
        match cmd {
            ClusterCommand::GetStatus { resp_chan } => resp_chan
                .send(self.status(Instant::now()))
                .map_err(|_| ClusterError::Concurrency("Status requester went away".to_string())),
            ClusterCommand::SetSnapshot { snapshot } => {
                self.snapshot = snapshot;
                Ok(())
            }
            ClusterCommand::BroadcastDelta { delta, resp_chan } => {
                let result = self.broadcast(Payload::StateDelta(delta)).await;
                resp_chan.send(result).map_err(|_| {
                    ClusterError::Concurrency("Delta requester went away".to_string())
                })
            }
            ClusterCommand::StartElection => {
                self.start_election(Instant::now()).await;
                Ok(())
            }
            ClusterCommand::Shutdown => Ok(()),
        }
    }

    async fn handle_datagram(&mut self, datagram: Datagram) -> Result<()> {
        let message = Message::deserialize(&datagram.data)?;
        if self.local.is_origin_of(datagram.source, message.port) {
            return Ok(());
        }
        let from = SocketAddr::new(datagram.source.ip(), message.port);
        let payload = message.payload()?;
        // our own announcement seen through another interface
        let echoed = match &payload {
            Payload::Hello(hello) => hello.instance == self.local.instance,
            Payload::Heartbeat(heartbeat) => heartbeat.instance == self.local.instance,
            _ => false,
        };
        if echoed {
            return Ok(());
        }
        let now = Instant::now();

        match payload {
            Payload::Hello(hello) => self.on_hello(from, hello, now).await,
            Payload::HelloReply(reply) => {
                self.on_hello_reply(from, reply, now).await;
                Ok(())
            }
            Payload::Heartbeat(heartbeat) => self.on_heartbeat(from, heartbeat, now).await,
            Payload::HeartbeatAck(ack) => {
                self.heartbeat.on_ack(&mut self.table, &from, ack);
                Ok(())
            }
            Payload::HeartbeatNegAck(nack) => {
                let missing = self.heartbeat.on_neg_ack(&mut self.table, &from, nack);
                debug!(
                    "[{}] Resending {} heartbeats to {}",
                    self.local.address,
                    missing.len(),
                    from
                );
                for heartbeat in missing {
                    self.send(from, Payload::Heartbeat(heartbeat)).await?;
                }
                Ok(())
            }
            Payload::ElectionVote(vote) => {
                let ring = self.table.ring();
                let challenged = vote.hop.is_some()
                    && vote.candidate < self.local
                    && ring.contains(&vote.candidate.address);
                let actions = self.election.on_vote(&ring, vote, now)?;
                self.perform(actions).await;

                // a lower candidate can never win, so outbid it
                if challenged
                    && self.table.current_leader().is_none()
                    && !self.election.in_progress()
                {
                    debug!(
                        "[{}] Outranking candidate {}",
                        self.local.address, vote.candidate
                    );
                    self.start_election(now).await;
                }
                Ok(())
            }
            Payload::ElectionReply(reply) => {
                let actions = self.election.on_reply(&self.table.ring(), reply, now);
                self.perform(actions).await;
                Ok(())
            }
            Payload::ElectionResult(result) => {
                info!(
                    "[{}] Election {} won by {}",
                    self.local.address, result.gid, result.leader
                );
                self.election.on_result(now);
                self.adopt_leader(result.leader, now);
                Ok(())
            }
            Payload::StateDelta(delta) => {
                // no subscribers is fine
                let _ = self.events_tx.send(ClusterEvent::Delta { from, delta });
                Ok(())
            }
        }
    }

    async fn on_hello(&mut self, from: SocketAddr, hello: HelloData, now: Instant) -> Result<()> {
        let id = NodeId::new(from, hello.instance);
        let registration = self.table.register(id, now);
        self.log_registration(id, registration);

        // only the leader answers once there is one
        if self.table.current_leader().is_some() && !self.table.is_self_leader() {
            return Ok(());
        }

        let reply = HelloReplyData {
            members: self.table.snapshot(now),
            leader: self.table.current_leader(),
            snapshot: if self.table.is_self_leader() {
                self.snapshot.clone()
            } else {
                None
            },
        };
        debug!(
            "[{}] Welcoming {} with {} members",
            self.local.address,
            from,
            reply.members.len()
        );
        self.send(from, Payload::HelloReply(reply)).await
    }

    async fn on_hello_reply(&mut self, from: SocketAddr, reply: HelloReplyData, now: Instant) {
        for record in reply.members {
            if record.id.address == self.local.address {
                continue;
            }
            let registration = self.table.register(record.id, now);
            self.log_registration(record.id, registration);
            if let Some(stamp) = record
                .age_ms
                .and_then(|age| now.checked_sub(std::time::Duration::from_millis(age)))
            {
                self.table.register_heartbeat(&record.id.address, stamp);
            }
        }

        if let Some(leader) = reply.leader {
            self.adopt_leader(leader, now);
        }
        if let Some(snapshot) = reply.snapshot {
            let _ = self.events_tx.send(ClusterEvent::Snapshot { from, snapshot });
        }
        if self.table.current_leader().is_none() && !self.election.in_progress() {
            self.start_election(now).await;
        }
    }

    async fn on_heartbeat(
        &mut self,
        from: SocketAddr,
        heartbeat: HeartbeatData,
        now: Instant,
    ) -> Result<()> {
        let followed = heartbeat.leader;
        let instance = heartbeat.instance;
        let outcome = self
            .heartbeat
            .on_heartbeat(&mut self.table, from, heartbeat, now);
        self.log_registration(NodeId::new(from, instance), outcome.registration);

        if let Some(leader) = followed {
            self.reconcile_leader(leader, now);
        }

        match outcome.reply {
            Some(HeartbeatReply::Ack(ack)) => self.send(from, Payload::HeartbeatAck(ack)).await,
            Some(HeartbeatReply::NegAck(nack)) => {
                self.send(from, Payload::HeartbeatNegAck(nack)).await
            }
            None => Ok(()),
        }
    }

    /// Follow a peer's leader when ours is missing or outranked by it.
    ///
    /// Only a live ring member with the same incarnation we know is accepted.
    fn reconcile_leader(&mut self, leader: NodeId, now: Instant) {
        let current = self.table.current_leader();
        if current == Some(leader) || !self.table.ring().contains(&leader.address) {
            return;
        }
        if self.table.lookup(&leader.address).map(|node| node.id) != Some(leader) {
            return;
        }
        if current.map_or(true, |current| leader > current) {
            info!(
                "[{}] Peers follow {}, adopting it over {:?}",
                self.local.address, leader, current
            );
            self.election.on_result(now);
            self.adopt_leader(leader, now);
        }
    }

    /// Make `leader` ours, registering it first if needed
    fn adopt_leader(&mut self, leader: NodeId, now: Instant) {
        if leader.address == self.local.address {
            if leader != self.local {
                warn!(
                    "[{}] Ignoring leadership of our previous incarnation {}",
                    self.local.address, leader
                );
                return;
            }
        } else {
            let registration = self.table.register(leader, now);
            self.log_registration(leader, registration);
        }

        if self.table.make_leader(&leader.address) {
            info!("[{}] Appointed new leader {}", self.local.address, leader);
        }
        self.publish_leader();
    }

    async fn handle_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        self.table.register_heartbeat(&self.local.address, now);

        let sweep = self.heartbeat.sweep(&mut self.table, now);
        for node in &sweep.evicted {
            info!("[{}] Lost connection to {}", self.local.address, node);
        }
        if !sweep.evicted.is_empty() {
            self.publish_leader();
        }

        let settled = now.saturating_duration_since(self.started) >= self.settings.discovery_window();
        if sweep.alone {
            self.election.clear();
            if settled && !self.table.is_self_leader() {
                info!("[{}] No peers left, taking leadership", self.local.address);
                if let Err(e) = self.take_leadership(ElectionId::random()).await {
                    warn!("[{}] Failed to announce leadership: {}", self.local.address, e);
                }
            }
        } else if sweep.leader_evicted {
            info!("[{}] Leader lost, starting election", self.local.address);
            self.start_election(now).await;
        } else if settled && self.table.current_leader().is_none() {
            let timeout = self.settings.election_timeout();
            let stalled = self.election.abandon_stalled(now, timeout);
            if stalled > 0 {
                info!(
                    "[{}] Abandoned {} stalled election round(s)",
                    self.local.address, stalled
                );
            }
            if self.election.is_idle(now, timeout) {
                self.start_election(now).await;
            }
        }

        let heartbeat = self.heartbeat.next_heartbeat(&self.table, now);
        trace!(
            "[{}] Heartbeat {} to {} peers",
            self.local.address,
            heartbeat.seq,
            heartbeat.peers.len()
        );
        let message = Message::new(self.local.address.port(), Payload::Heartbeat(heartbeat))?;
        self.transport.fan_out(&message.serialize()?).await
    }

    async fn start_election(&mut self, now: Instant) {
        let ring = self.table.ring();
        info!(
            "[{}] Starting election over {:?}",
            self.local.address,
            ring.members()
        );
        let actions = self.election.initiate(&ring, now);
        self.perform(actions).await;
    }

    async fn perform(&mut self, actions: Vec<ElectionAction>) {
        for action in actions {
            let result = match action {
                ElectionAction::Vote { to, vote } => self.send(to, Payload::ElectionVote(vote)).await,
                ElectionAction::Reply { to, vote } => {
                    self.send(to, Payload::ElectionReply(vote)).await
                }
                ElectionAction::Elected { gid } => self.take_leadership(gid).await,
            };
            if let Err(e) = result {
                warn!("[{}] Election message failed: {}", self.local.address, e);
            }
        }
    }

    async fn take_leadership(&mut self, gid: ElectionId) -> Result<()> {
        self.election.clear();
        if self.table.make_leader(&self.local.address) {
            info!(
                "[{}] Taking leadership of {} members",
                self.local.address,
                self.table.ring().len()
            );
        }
        self.publish_leader();
        self.broadcast(Payload::ElectionResult(ResultData {
            gid,
            leader: self.local,
        }))
        .await
    }

    fn publish_leader(&self) {
        let leader = self.table.current_leader();
        self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                false
            } else {
                *current = leader;
                true
            }
        });
    }

    fn log_registration(&self, id: NodeId, registration: Registration) {
        match registration {
            Registration::Inserted => info!("[{}] Discovered {}", self.local.address, id),
            Registration::Reincarnated => {
                info!("[{}] {} restarted as {}", self.local.address, id.address, id);
                self.publish_leader();
            }
            Registration::Updated => {}
        }
    }

    async fn send(&self, to: SocketAddr, payload: Payload) -> Result<()> {
        let message = Message::new(self.local.address.port(), payload)?;
        self.transport.send_to(to, &message.serialize()?).await
    }

    async fn broadcast(&self, payload: Payload) -> Result<()> {
        let message = Message::new(self.local.address.port(), payload)?;
        self.transport.broadcast(&message.serialize()?).await
    }

    fn status(&self, now: Instant) -> ClusterStatus {
        let mut members: Vec<MemberStatus> = self
            .table
            .members()
            .map(|node| {
                let address = node.address();
                let sequence = self.table.sequence(&address);
                MemberStatus {
                    id: node.id,
                    is_leader: node.is_leader,
                    in_ring: self.table.has_heartbeat(&address),
                    age_ms: self
                        .table
                        .age(&address, now)
                        .map(|age| age.as_millis() as u64),
                    sent: sequence.map_or(0, |s| s.sent()),
                    received: sequence.map_or(0, |s| s.received()),
                    held_back: sequence.map_or(0, |s| s.held_back()),
                }
            })
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));

        ClusterStatus {
            node: self.local,
            leader: self.table.current_leader(),
            is_leader: self.table.is_self_leader(),
            ring: self.table.sorted_addresses(),
            members,
            election_in_progress: self.election.in_progress(),
            heartbeat_seq: self.heartbeat.seq(),
            transport: self.transport.stats(),
            started_at: self.started_at,
        }
    }
}
