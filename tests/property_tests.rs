use std::net::SocketAddr;
use std::time::Duration;

use proptest::prelude::*;
use ringleader::node::heartbeat::{HeartbeatEngine, SequenceState, Sequencing};
use ringleader::node::membership::MembershipTable;
use ringleader::node::messages::HeartbeatData;
use ringleader::node::ring::{Direction, Ring};
use ringleader::node::{InstanceId, NodeId};
use tokio::time::Instant;

fn addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 8765))
}

#[derive(Clone, Debug)]
enum Op {
    Register(u8, u64),
    Heartbeat(u8),
    Remove(u8),
    MakeLeader(u8),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, 0u64..3).prop_map(|(host, instance)| Op::Register(host, instance)),
        (0u8..6).prop_map(Op::Heartbeat),
        (0u8..6).prop_map(Op::Remove),
        (0u8..6).prop_map(Op::MakeLeader),
        (0u64..500).prop_map(Op::Advance),
    ]
}

fn heartbeat(seq: u64) -> HeartbeatData {
    HeartbeatData {
        instance: InstanceId::new(1),
        seq,
        leader: None,
        peers: vec![],
    }
}

proptest! {
    #[test]
    fn test_membership_stays_consistent_property(ops in prop::collection::vec(op(), 0..60)) {
        let start = Instant::now();
        let local = NodeId::new(addr(0), InstanceId::new(0));
        let mut table = MembershipTable::new(local, start);
        let engine = HeartbeatEngine::new(4, Duration::from_millis(300));
        let mut now = start;

        for op in ops {
            match op {
                Op::Register(host, instance) => {
                    table.register(NodeId::new(addr(host), InstanceId::new(instance)), now);
                }
                Op::Heartbeat(host) => {
                    table.register_heartbeat(&addr(host), now);
                }
                Op::Remove(host) => {
                    table.remove(&addr(host));
                }
                Op::MakeLeader(host) => {
                    table.make_leader(&addr(host));
                }
                Op::Advance(ms) => {
                    now += Duration::from_millis(ms);
                    table.register_heartbeat(&local.address, now);
                    engine.sweep(&mut table, now);
                }
            }
            prop_assert!(table.is_consistent());
            prop_assert_eq!(table.local(), local);
            prop_assert!(table.ring().contains(&local.address));
            if let Some(leader) = table.current_leader() {
                prop_assert!(table.contains(&leader.address));
            }
        }
    }

    #[test]
    fn test_ring_neighbours_are_symmetric_property(
        hosts in prop::collection::btree_set(1u8..200, 1..12)
    ) {
        let ring = Ring::new(hosts.iter().copied().map(addr).collect());
        for member in ring.members() {
            let right = ring.neighbour(member, Direction::Right).unwrap();
            let left = ring.neighbour(member, Direction::Left).unwrap();
            prop_assert_eq!(ring.neighbour(&right, Direction::Left), Some(*member));
            prop_assert_eq!(ring.neighbour(&left, Direction::Right), Some(*member));
        }
    }

    #[test]
    fn test_walking_the_ring_visits_everyone_once_property(
        hosts in prop::collection::btree_set(1u8..200, 1..12),
        direction in prop_oneof![Just(Direction::Left), Just(Direction::Right)]
    ) {
        let ring = Ring::new(hosts.iter().copied().map(addr).collect());
        let start = ring.members()[0];
        let mut visited = vec![start];
        let mut current = start;
        for _ in 1..ring.len() {
            current = ring.neighbour(&current, direction).unwrap();
            visited.push(current);
        }
        prop_assert_eq!(ring.neighbour(&current, direction), Some(start));

        visited.sort();
        visited.dedup();
        prop_assert_eq!(visited.len(), ring.len());
    }

    #[test]
    fn test_delivery_is_in_order_property(
        seqs in prop::collection::vec(1u64..30, 1..60),
        limit in 1usize..8
    ) {
        let mut state = SequenceState::default();
        let mut delivered: Vec<u64> = Vec::new();
        for seq in seqs {
            let before = state.received();
            match state.accept(heartbeat(seq), limit) {
                Sequencing::Stale => prop_assert!(seq <= before || before == 0),
                Sequencing::HeldBack | Sequencing::Delivered(_) => {}
            }
            delivered.extend(state.take_ready().iter().map(|hb| hb.seq));
            prop_assert!(state.received() >= before);
            prop_assert!(state.held_back() <= limit);
        }
        prop_assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
