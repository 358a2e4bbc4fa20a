//! Cluster Module
//!
//! Provides gossip-based horizontal clustering for meshmq.
//!
//! # Architecture
//!
//! The cluster uses two communication channels:
//! - **Gossip (UDP via chitchat)**: Node discovery, membership, subscription state
//! - **Peer TCP**: Direct message forwarding between nodes, with ordered,
//!   acknowledged, resumable event delivery (see `queue` and `protocol`)
//!
//! # Usage
//!
//! ```toml
//! # meshmq.toml
//! [[cluster]]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! ```

mod manager;
mod peer;
mod protocol;
mod queue;

pub use manager::ClusterManager;
pub use peer::{ClusterInboundCallback, ClusterPeer};
pub use protocol::{ClusterMessage, EventPayload, CLUSTER_PROTOCOL_VERSION};
pub use queue::{DedupCache, ReplicationQueue};

// Re-export cluster config
pub use crate::config::ClusterConfig;
