//! MeshMQ - clustered MQTT v3.1/v3.1.1/v5.0 broker
//!
//! A multi-core MQTT broker implementation whose subscription state
//! replicates across a cluster of nodes via gossip membership and
//! per-peer reliable event streams.

pub mod broker;
pub mod buffer_pool;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod proxy;
pub mod remote;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::Broker;
pub use cluster::{ClusterConfig, ClusterManager};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
pub use remote::{RemoteError, RemotePeer, RemotePeerStatus};
