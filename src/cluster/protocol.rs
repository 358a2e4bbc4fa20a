//! Cluster Protocol Messages
//!
//! Defines the binary protocol used for inter-node communication.
//! Messages are serialized using bincode for efficiency.

use bincode::{Decode, Encode};

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Full subscription state sync, sent once right after the handshake
    SubscriptionSync {
        /// All topic filters this node has subscribers for
        filters: Vec<String>,
    },

    /// A single replication event, stamped with a monotonically increasing
    /// id by the sender's replication queue.
    Event {
        /// Position in the sender's per-connection event sequence
        id: u64,
        /// Node ID of the sender (used to prevent re-forwarding loops)
        origin_node: String,
        /// The replicated operation
        payload: EventPayload,
    },

    /// Acknowledges that every event with id <= this value has been applied.
    Ack {
        id: u64,
    },

    /// Sent once per connection, right after Hello/HelloAck, carrying the
    /// sender's locally-generated session id.
    ResumeReq {
        session_id: u64,
    },

    /// Answer to ResumeReq. `restart` is true iff the responder has no
    /// record of that session id, in which case the requester must clear
    /// its queue and start numbering from 0. Otherwise `next_id` is the
    /// next event id the responder expects (inclusive).
    ResumeRsp {
        restart: bool,
        next_id: u64,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

/// The replicated operations carried by `ClusterMessage::Event`.
#[derive(Debug, Clone, Encode, Decode)]
pub enum EventPayload {
    Subscribe { filter: String },
    Unsubscribe { filter: String },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::SubscriptionSync { .. } => "SubscriptionSync",
            ClusterMessage::Event { .. } => "Event",
            ClusterMessage::Ack { .. } => "Ack",
            ClusterMessage::ResumeReq { .. } => "ResumeReq",
            ClusterMessage::ResumeRsp { .. } => "ResumeRsp",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}
