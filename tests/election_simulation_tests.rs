use std::collections::VecDeque;
use std::net::SocketAddr;

use proptest::prelude::*;
use ringleader::node::election::{ElectionAction, ElectionEngine};
use ringleader::node::messages::VoteData;
use ringleader::node::ring::Ring;
use ringleader::node::{InstanceId, NodeId};
use tokio::time::Instant;

enum Traffic {
    Vote(SocketAddr, VoteData),
    Reply(SocketAddr, VoteData),
}

struct Simulation {
    members: Ring,
    ids: Vec<NodeId>,
    engines: Vec<ElectionEngine>,
    winners: Vec<NodeId>,
}

impl Simulation {
    fn new(size: usize) -> Self {
        let ids: Vec<NodeId> = (0..size)
            .map(|i| {
                NodeId::new(
                    SocketAddr::from(([10, 0, 0, 1 + i as u8], 8765)),
                    InstanceId::new(7),
                )
            })
            .collect();
        Self {
            members: Ring::new(ids.iter().map(|id| id.address).collect()),
            engines: ids.iter().map(|id| ElectionEngine::new(*id)).collect(),
            ids,
            winners: Vec::new(),
        }
    }

    fn index_of(&self, address: SocketAddr) -> usize {
        self.ids
            .iter()
            .position(|id| id.address == address)
            .expect("message to a node outside the simulation")
    }

    /// Start candidacies in the given order, then deliver every message FIFO
    fn run(&mut self, initiators: &[usize]) {
        let now = Instant::now();
        let mut queue = VecDeque::new();

        for &i in initiators {
            let actions = self.engines[i].initiate(&self.members, now);
            self.enqueue(i, actions, &mut queue);
        }

        let mut steps = 0;
        while let Some(traffic) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "election traffic never settled");
            let (to, actions) = match traffic {
                Traffic::Vote(to, vote) => {
                    let i = self.index_of(to);
                    (i, self.engines[i].on_vote(&self.members, vote, now).unwrap())
                }
                Traffic::Reply(to, reply) => {
                    let i = self.index_of(to);
                    (i, self.engines[i].on_reply(&self.members, reply, now))
                }
            };
            self.enqueue(to, actions, &mut queue);
        }
    }

    fn enqueue(&mut self, from: usize, actions: Vec<ElectionAction>, queue: &mut VecDeque<Traffic>) {
        for action in actions {
            match action {
                ElectionAction::Vote { to, vote } => queue.push_back(Traffic::Vote(to, vote)),
                ElectionAction::Reply { to, vote } => queue.push_back(Traffic::Reply(to, vote)),
                ElectionAction::Elected { .. } => {
                    self.winners.push(self.ids[from]);
                    // the broadcast result ends everybody's rounds
                    let now = Instant::now();
                    for engine in &mut self.engines {
                        engine.on_result(now);
                    }
                }
            }
        }
    }

    fn highest(&self) -> NodeId {
        *self.ids.iter().max().unwrap()
    }
}

#[test]
fn test_everyone_initiating_elects_the_highest() {
    for size in 1..=8 {
        let mut sim = Simulation::new(size);
        let everyone: Vec<usize> = (0..size).collect();
        sim.run(&everyone);
        assert_eq!(sim.winners, vec![sim.highest()], "ring of {}", size);
    }
}

#[test]
fn test_reverse_start_order_elects_the_highest() {
    let mut sim = Simulation::new(6);
    sim.run(&[5, 4, 3, 2, 1, 0]);
    assert_eq!(sim.winners, vec![sim.highest()]);
    assert!(sim.engines.iter().all(|engine| !engine.in_progress()));
}

#[test]
fn test_result_is_idempotent() {
    let mut sim = Simulation::new(4);
    sim.run(&[3]);
    assert_eq!(sim.winners.len(), 1);

    let now = Instant::now();
    for engine in &mut sim.engines {
        engine.on_result(now);
        engine.on_result(now);
        assert!(!engine.in_progress());
    }
}

#[test]
fn test_without_the_highest_nobody_wins() {
    let mut sim = Simulation::new(5);
    sim.run(&[0, 1, 2, 3]);
    assert!(sim.winners.is_empty());
}

proptest! {
    #[test]
    fn test_at_most_one_winner_property(
        size in 1usize..10,
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..10)
    ) {
        let mut sim = Simulation::new(size);
        let mut initiators: Vec<usize> = Vec::new();
        for pick in &picks {
            let i = pick.index(size);
            if !initiators.contains(&i) {
                initiators.push(i);
            }
        }
        sim.run(&initiators);

        let top = size - 1;
        if initiators.contains(&top) {
            prop_assert_eq!(sim.winners.clone(), vec![sim.highest()]);
        } else {
            prop_assert!(sim.winners.is_empty());
        }
    }
}
