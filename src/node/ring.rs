//! Ring topology over the current members.
//!
//! A ring is built from the membership table's heartbeat key set every time it
//! is needed and never cached: any membership change invalidates it.
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Which way round the ring a message travels
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Left, Direction::Right];

    pub fn opposite(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Left => write!(f, "left"),
            Direction::Right => write!(f, "right"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ring {
    members: Vec<SocketAddr>,
}

impl Ring {
    pub fn new(mut members: Vec<SocketAddr>) -> Self {
        members.sort();
        members.dedup();
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[SocketAddr] {
        &self.members
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.position(address).is_some()
    }

    pub fn position(&self, address: &SocketAddr) -> Option<usize> {
        self.members.binary_search(address).ok()
    }

    /// Adjacent member in `direction`, wrapping at both ends.
    ///
    /// A single-member ring is its own neighbour; `None` if `address` is not a member.
    pub fn neighbour(&self, address: &SocketAddr, direction: Direction) -> Option<SocketAddr> {
        let index = self.position(address)?;
        let len = self.members.len();
        let next = match direction {
            Direction::Left => (index + len - 1) % len,
            Direction::Right => (index + 1) % len,
        };
        Some(self.members[next])
    }
}
