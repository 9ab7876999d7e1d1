//! Ring leader election by phase doubling.
//!
//! A candidate sends a vote both ways round the ring. In phase `k` the vote
//! travels `2^k` hops, and the node it reaches sends a reply back. Any node
//! that outranks the candidate swallows the vote. When both directions come
//! back the candidate doubles its reach, and it wins once the reach covers
//! the whole ring. Each attempt carries a fresh `gid`, so a late message
//! from an abandoned attempt is recognised and ignored.
//!
//! The engine does no I/O. It returns [`ElectionAction`]s for the coordinator
//! to carry out.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::election_error;
use crate::error::Result;
use crate::node::messages::VoteData;
use crate::node::node_id::NodeId;
use crate::node::ring::{Direction, Ring};

/// Identifier of one election attempt
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct ElectionId(u64);

impl ElectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ElectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Progress of one of our own candidacies
#[derive(Clone, Debug)]
pub struct ElectionRound {
    pub gid: ElectionId,
    pub phase: u32,
    returned: HashSet<Direction>,
    /// Last time this round made progress
    pub updated: Instant,
}

/// Work the coordinator performs on behalf of the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionAction {
    Vote { to: SocketAddr, vote: VoteData },
    Reply { to: SocketAddr, vote: VoteData },
    /// This node won; announce it
    Elected { gid: ElectionId },
}

/// Reach of a vote in `phase`: `2^phase` hops, saturating
fn span(phase: u32) -> u64 {
    1u64.checked_shl(phase).unwrap_or(u64::MAX)
}

#[derive(Debug)]
pub struct ElectionEngine {
    local: NodeId,
    rounds: HashMap<ElectionId, ElectionRound>,
    last_activity: Option<Instant>,
}

impl ElectionEngine {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            rounds: HashMap::new(),
            last_activity: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        !self.rounds.is_empty()
    }

    pub fn rounds(&self) -> impl Iterator<Item = &ElectionRound> {
        self.rounds.values()
    }

    /// No own round is running and no election traffic was seen for `quiet`
    pub fn is_idle(&self, now: Instant, quiet: Duration) -> bool {
        self.rounds.is_empty()
            && self
                .last_activity
                .map_or(true, |at| now.saturating_duration_since(at) >= quiet)
    }

    /// Start a candidacy over `ring`
    pub fn initiate(&mut self, ring: &Ring, now: Instant) -> Vec<ElectionAction> {
        let gid = ElectionId::random();
        self.last_activity = Some(now);

        if ring.len() <= 1 {
            self.rounds.clear();
            return vec![ElectionAction::Elected { gid }];
        }

        debug!(
            "[{}] Starting election {} over {} members",
            self.local.address,
            gid,
            ring.len()
        );
        self.rounds.insert(
            gid,
            ElectionRound {
                gid,
                phase: 0,
                returned: HashSet::new(),
                updated: now,
            },
        );
        self.votes_to_neighbours(ring, gid, 0)
    }

    /// Handle a vote travelling outwards, or a reply when it carries no hop.
    ///
    /// Only votes for candidates that outrank us, or our own returning votes,
    /// count as election activity. A swallowed vote leaves `is_idle` untouched.
    pub fn on_vote(
        &mut self,
        ring: &Ring,
        vote: VoteData,
        now: Instant,
    ) -> Result<Vec<ElectionAction>> {
        let Some(hop) = vote.hop else {
            return Ok(self.on_reply(ring, vote, now));
        };
        let reach = span(vote.phase);
        if hop == 0 || u64::from(hop) > reach {
            return Err(election_error!(
                "vote for {} at hop {} is beyond the reach of phase {}",
                vote.candidate,
                hop,
                vote.phase
            ));
        }

        if !ring.contains(&vote.candidate.address) {
            debug!(
                "[{}] Dropping vote for {} outside our ring",
                self.local.address, vote.candidate
            );
            return Ok(vec![]);
        }

        match vote.candidate.cmp(&self.local) {
            std::cmp::Ordering::Less => {
                debug!(
                    "[{}] Swallowing vote for lower-ranked {}",
                    self.local.address, vote.candidate
                );
                Ok(vec![])
            }
            std::cmp::Ordering::Equal => {
                self.last_activity = Some(now);
                Ok(self.record_return(ring, vote, now))
            }
            std::cmp::Ordering::Greater => {
                self.last_activity = Some(now);
                if !self.rounds.is_empty() {
                    debug!(
                        "[{}] Abandoning own candidacy for {}",
                        self.local.address, vote.candidate
                    );
                    self.rounds.clear();
                }

                if u64::from(hop) < reach {
                    Ok(self.forward(ring, vote.direction, |to| ElectionAction::Vote {
                        to,
                        vote: VoteData {
                            hop: Some(hop.saturating_add(1)),
                            ..vote
                        },
                    }))
                } else if reach <= ring.len() as u64 {
                    let back = vote.direction.opposite();
                    Ok(self.forward(ring, back, |to| ElectionAction::Reply {
                        to,
                        vote: VoteData {
                            hop: None,
                            direction: back,
                            ..vote
                        },
                    }))
                } else {
                    Err(election_error!(
                        "vote for {} in phase {} outgrew a ring of {}",
                        vote.candidate,
                        vote.phase,
                        ring.len()
                    ))
                }
            }
        }
    }

    pub fn on_reply(&mut self, ring: &Ring, reply: VoteData, now: Instant) -> Vec<ElectionAction> {
        self.last_activity = Some(now);
        if reply.candidate == self.local {
            return self.record_return(ring, reply, now);
        }
        if !ring.contains(&reply.candidate.address) {
            debug!(
                "[{}] Dropping reply for {} outside our ring",
                self.local.address, reply.candidate
            );
            return vec![];
        }
        self.forward(ring, reply.direction, |to| ElectionAction::Reply { to, vote: reply })
    }

    /// A result supersedes every round in flight
    pub fn on_result(&mut self, now: Instant) {
        self.rounds.clear();
        self.last_activity = Some(now);
    }

    /// Drop own rounds that made no progress for `timeout`; returns how many
    pub fn abandon_stalled(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.rounds.len();
        self.rounds
            .retain(|_, round| now.saturating_duration_since(round.updated) < timeout);
        before - self.rounds.len()
    }

    pub fn clear(&mut self) {
        self.rounds.clear();
    }

    fn record_return(&mut self, ring: &Ring, vote: VoteData, now: Instant) -> Vec<ElectionAction> {
        let Some(round) = self.rounds.get_mut(&vote.gid) else {
            debug!(
                "[{}] Ignoring return for unknown election {}",
                self.local.address, vote.gid
            );
            return vec![];
        };
        if vote.phase != round.phase {
            debug!(
                "[{}] Ignoring stale phase {} of election {}",
                self.local.address, vote.phase, vote.gid
            );
            return vec![];
        }

        // a returning vote travelled out the way it is going; a reply travels back
        let outbound = match vote.hop {
            Some(_) => vote.direction,
            None => vote.direction.opposite(),
        };
        round.returned.insert(outbound);
        round.updated = now;
        if round.returned.len() < Direction::BOTH.len() {
            return vec![];
        }

        let gid = round.gid;
        if span(round.phase.saturating_add(1)) > ring.len() as u64 {
            self.rounds.clear();
            return vec![ElectionAction::Elected { gid }];
        }

        round.phase += 1;
        round.returned.clear();
        let phase = round.phase;
        debug!(
            "[{}] Election {} advancing to phase {}",
            self.local.address, gid, phase
        );
        self.votes_to_neighbours(ring, gid, phase)
    }

    fn votes_to_neighbours(&self, ring: &Ring, gid: ElectionId, phase: u32) -> Vec<ElectionAction> {
        Direction::BOTH
            .iter()
            .filter_map(|&direction| {
                ring.neighbour(&self.local.address, direction)
                    .map(|to| ElectionAction::Vote {
                        to,
                        vote: VoteData {
                            gid,
                            candidate: self.local,
                            hop: Some(1),
                            phase,
                            direction,
                        },
                    })
            })
            .collect()
    }

    fn forward<F>(&self, ring: &Ring, direction: Direction, action: F) -> Vec<ElectionAction>
    where
        F: FnOnce(SocketAddr) -> ElectionAction,
    {
        ring.neighbour(&self.local.address, direction)
            .map(action)
            .into_iter()
            .collect()
    }
}
