//! Cluster wire protocol
//!
//! Every datagram is a JSON object `{"opcode": .., "port": .., "data": ..}`.
//! The sender's IP comes from the UDP source address and its identity port
//! from `port`, so a reply can always be addressed even when the datagram
//! arrived on the shared broadcast port.
//!
//! `data` is decoded per opcode into a typed [`Payload`].
use std::net::SocketAddr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SerializationError};
use crate::node::election::ElectionId;
use crate::node::node_id::{InstanceId, NodeId};
use crate::node::ring::Direction;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Hello,
    HelloReply,
    Heartbeat,
    HeartbeatAck,
    HeartbeatNegAck,
    ElectionVote,
    ElectionReply,
    ElectionResult,
    StateDelta,
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Hello => "HELLO",
            OpCode::HelloReply => "HELLO_REPLY",
            OpCode::Heartbeat => "HEARTBEAT",
            OpCode::HeartbeatAck => "HEARTBEAT_ACK",
            OpCode::HeartbeatNegAck => "HEARTBEAT_NEG_ACK",
            OpCode::ElectionVote => "ELECTION_VOTE",
            OpCode::ElectionReply => "ELECTION_REPLY",
            OpCode::ElectionResult => "ELECTION_RESULT",
            OpCode::StateDelta => "STATE_DELTA",
        };
        write!(f, "{}", name)
    }
}

/// Envelope exchanged between nodes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Message {
    pub opcode: OpCode,
    pub port: u16,
    pub data: Option<Value>,
}

/// Discovery announcement
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HelloData {
    pub instance: InstanceId,
}

/// One row of the membership table as shipped to a joining node
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MemberRecord {
    pub id: NodeId,
    pub is_leader: bool,
    /// Milliseconds since the sender last heard from this member, if ever
    pub age_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HelloReplyData {
    pub members: Vec<MemberRecord>,
    pub leader: Option<NodeId>,
    pub snapshot: Option<Value>,
}

/// Per-peer counters piggybacked on every heartbeat
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PeerCounter {
    pub address: SocketAddr,
    /// In-order heartbeats the sender has delivered from this peer
    pub received: u64,
    pub age_ms: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeartbeatData {
    pub instance: InstanceId,
    pub seq: u64,
    /// Leader the sender currently follows
    pub leader: Option<NodeId>,
    pub peers: Vec<PeerCounter>,
}

impl HeartbeatData {
    /// Counter the sender reports for `address`
    pub fn counter_for(&self, address: &SocketAddr) -> Option<&PeerCounter> {
        self.peers.iter().find(|peer| peer.address == *address)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AckData {
    pub received: u64,
}

/// Election vote, or its reply when `hop` is absent
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VoteData {
    pub gid: ElectionId,
    pub candidate: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop: Option<u32>,
    pub phase: u32,
    pub direction: Direction,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResultData {
    pub gid: ElectionId,
    pub leader: NodeId,
}

/// Decoded message body
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Hello(HelloData),
    HelloReply(HelloReplyData),
    Heartbeat(HeartbeatData),
    HeartbeatAck(AckData),
    HeartbeatNegAck(AckData),
    ElectionVote(VoteData),
    ElectionReply(VoteData),
    ElectionResult(ResultData),
    StateDelta(Value),
}

impl Payload {
    pub fn opcode(&self) -> OpCode {
        match self {
            Payload::Hello(_) => OpCode::Hello,
            Payload::HelloReply(_) => OpCode::HelloReply,
            Payload::Heartbeat(_) => OpCode::Heartbeat,
            Payload::HeartbeatAck(_) => OpCode::HeartbeatAck,
            Payload::HeartbeatNegAck(_) => OpCode::HeartbeatNegAck,
            Payload::ElectionVote(_) => OpCode::ElectionVote,
            Payload::ElectionReply(_) => OpCode::ElectionReply,
            Payload::ElectionResult(_) => OpCode::ElectionResult,
            Payload::StateDelta(_) => OpCode::StateDelta,
        }
    }
}

impl Message {
    /// Wrap a payload for sending from identity port `port`
    pub fn new(port: u16, payload: Payload) -> Result<Self> {
        let opcode = payload.opcode();
        let data = match payload {
            Payload::Hello(data) => serde_json::to_value(data)?,
            Payload::HelloReply(data) => serde_json::to_value(data)?,
            Payload::Heartbeat(data) => serde_json::to_value(data)?,
            Payload::HeartbeatAck(data) | Payload::HeartbeatNegAck(data) => {
                serde_json::to_value(data)?
            }
            Payload::ElectionVote(data) | Payload::ElectionReply(data) => {
                serde_json::to_value(data)?
            }
            Payload::ElectionResult(data) => serde_json::to_value(data)?,
            Payload::StateDelta(value) => value,
        };
        Ok(Self {
            opcode,
            port,
            data: Some(data),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode `data` according to `opcode`
    pub fn payload(&self) -> Result<Payload> {
        let payload = match self.opcode {
            OpCode::Hello => Payload::Hello(self.decode_data()?),
            OpCode::HelloReply => Payload::HelloReply(self.decode_data()?),
            OpCode::Heartbeat => Payload::Heartbeat(self.decode_data()?),
            OpCode::HeartbeatAck => Payload::HeartbeatAck(self.decode_data()?),
            OpCode::HeartbeatNegAck => Payload::HeartbeatNegAck(self.decode_data()?),
            OpCode::ElectionVote => {
                let vote: VoteData = self.decode_data()?;
                if vote.hop.is_none() {
                    return Err(SerializationError::Payload(
                        "ELECTION_VOTE without a hop count".to_string(),
                    )
                    .into());
                }
                Payload::ElectionVote(vote)
            }
            OpCode::ElectionReply => {
                let mut reply: VoteData = self.decode_data()?;
                reply.hop = None;
                Payload::ElectionReply(reply)
            }
            OpCode::ElectionResult => Payload::ElectionResult(self.decode_data()?),
            OpCode::StateDelta => Payload::StateDelta(self.data.clone().unwrap_or(Value::Null)),
        };
        Ok(payload)
    }

    fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.data.clone().ok_or_else(|| {
            SerializationError::Payload(format!("{} carries no data", self.opcode))
        })?;
        Ok(serde_json::from_value(data)?)
    }
}
