//! Cluster Manager
//!
//! Coordinates gossip-based cluster membership and message forwarding
//! between meshmq nodes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::protocol::QoS;
use crate::remote::RemotePeer;
use crate::remote::RemotePeerStatus;

use super::peer::{ClusterInboundCallback, ClusterPeer};
use super::protocol::{
    frame_message, read_frame_length, ClusterMessage, EventPayload, CLUSTER_PROTOCOL_VERSION,
};
use super::queue::DedupCache;

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";
const KEY_SUBSCRIPTIONS: &str = "subscriptions";

/// Capacity of the per-peer receive-side duplicate filter.
const DEDUP_CACHE_CAPACITY: usize = 4096;

/// Resume state the accepting side keeps per remote node, so a peer
/// reconnecting with the same session id resumes instead of replaying
/// from scratch.
struct InboundSession {
    session_id: u64,
    next_expected_id: u64,
    dedup: DedupCache,
}

impl InboundSession {
    fn fresh(session_id: u64) -> Self {
        Self {
            session_id,
            next_expected_id: 0,
            dedup: DedupCache::new(DEDUP_CACHE_CAPACITY),
        }
    }
}

/// Cluster manager for gossip-based horizontal scaling
pub struct ClusterManager {
    /// Our node ID
    node_id: String,
    /// Cluster configuration
    config: ClusterConfig,
    /// Chitchat handle for gossip communication
    chitchat: ChitchatHandle,
    /// Connected peer nodes
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    /// Local subscriptions (topic filters we have subscribers for)
    local_subscriptions: Arc<RwLock<HashSet<String>>>,
    /// Callback for inbound messages from cluster peers
    inbound_callback: ClusterInboundCallback,
    /// Resume/dedup bookkeeping for inbound peer connections, keyed by the
    /// remote node's id
    inbound_sessions: Arc<DashMap<String, Mutex<InboundSession>>>,
}

impl ClusterManager {
    /// Create a new cluster manager
    pub async fn new(
        config: ClusterConfig,
        inbound_callback: ClusterInboundCallback,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let node_id = config.get_node_id();
        let gossip_advertise_addr = config.get_gossip_advertise_addr();
        let peer_advertise_addr = config.get_peer_advertise_addr();

        info!(
            "Starting cluster node: {} (gossip_advertise={}, peer_advertise={})",
            node_id, gossip_advertise_addr, peer_advertise_addr
        );

        // Create chitchat ID with the advertise address (what peers use to reach us)
        let chitchat_id = ChitchatId::new(node_id.clone(), 0, gossip_advertise_addr);

        // Parse seed nodes as strings (chitchat expects Vec<String>)
        let seed_nodes: Vec<String> = config.seeds.clone();

        // Configure failure detector
        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval_duration(),
            ..Default::default()
        };

        // Create chitchat config
        let chitchat_config = ChitchatConfig {
            chitchat_id: chitchat_id.clone(),
            cluster_id: "meshmq".to_string(),
            gossip_interval: config.gossip_interval_duration(),
            listen_addr: config.gossip_addr, // Bind address (0.0.0.0 is fine)
            seed_nodes,
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period_duration(),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        // Create UDP transport
        let transport = UdpTransport;

        // Initial key-value pairs for our node - use advertise address for peer_addr
        let initial_kvs = vec![
            (KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string()),
            (KEY_SUBSCRIPTIONS.to_string(), "[]".to_string()),
        ];

        // Spawn chitchat
        let chitchat = spawn_chitchat(chitchat_config, initial_kvs, &transport).await?;

        Ok(Self {
            node_id,
            config,
            chitchat,
            peers: Arc::new(DashMap::new()),
            local_subscriptions: Arc::new(RwLock::new(HashSet::new())),
            inbound_callback,
            inbound_sessions: Arc::new(DashMap::new()),
        })
    }

    /// Get our node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Get the number of connected peers
    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == RemotePeerStatus::Connected)
            .count()
    }

    /// Update local subscriptions and sync to gossip state
    pub async fn update_subscriptions(&self, filters: HashSet<String>) {
        {
            let mut subs = self.local_subscriptions.write();
            *subs = filters.clone();
        }

        // Serialize to JSON for gossip state
        let json = serde_json::to_string(&filters.iter().collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".to_string());

        debug!(
            "Cluster: updating gossip state with subscriptions: {}",
            json
        );

        // Update chitchat state using with_chitchat
        self.chitchat
            .with_chitchat(|cc| {
                cc.self_node_state()
                    .set(KEY_SUBSCRIPTIONS.to_string(), json.clone());
            })
            .await;

        debug!("Cluster: gossip state updated");
    }

    /// Add a subscription filter
    pub async fn add_subscription(&self, filter: String) {
        debug!("Cluster: adding subscription filter '{}'", filter);
        let filters = {
            let mut subs = self.local_subscriptions.write();
            subs.insert(filter);
            subs.clone()
        };
        self.update_subscriptions(filters).await;
    }

    /// Remove a subscription filter
    pub async fn remove_subscription(&self, filter: &str) {
        let filters = {
            let mut subs = self.local_subscriptions.write();
            subs.remove(filter);
            subs.clone()
        };
        self.update_subscriptions(filters).await;
    }

    /// Replicate a new subscription to every connected peer's ordered event
    /// queue, in addition to the best-effort gossip-wide state.
    pub async fn notify_subscribe(&self, filter: &str, qos: QoS) {
        for peer in self.peers.iter() {
            let _ = peer.value().notify_subscribe(filter, qos).await;
        }
    }

    /// Replicate an unsubscribe to every connected peer's ordered event queue.
    pub async fn notify_unsubscribe(&self, filter: &str) {
        for peer in self.peers.iter() {
            let _ = peer.value().notify_unsubscribe(filter).await;
        }
    }

    /// Forward a published message to peers that have matching subscriptions
    pub async fn forward_publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        for peer in self.peers.iter() {
            let peer_ref = peer.value();
            let status = peer_ref.status();
            let should_fwd = peer_ref.should_forward(topic);
            debug!(
                "Cluster forward check: peer='{}' status={:?} should_forward={} topic='{}'",
                peer_ref.node_id(),
                status,
                should_fwd,
                topic
            );
            if status == RemotePeerStatus::Connected && should_fwd {
                debug!("Cluster: forwarding to peer '{}'", peer_ref.node_id());
                if let Err(e) = peer_ref
                    .forward_publish(topic, payload.clone(), qos, retain)
                    .await
                {
                    warn!(
                        "Failed to forward message to peer '{}': {}",
                        peer_ref.node_id(),
                        e
                    );
                }
            }
        }
    }

    /// Start the cluster manager background tasks
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "Cluster manager starting on gossip={}, peer={}",
            self.config.gossip_addr, self.config.peer_addr
        );

        // Spawn peer listener (accepts incoming TCP connections from other nodes)
        let listener = TcpListener::bind(self.config.peer_addr).await?;
        let inbound_callback = self.inbound_callback.clone();
        let local_node_id = self.node_id.clone();
        let local_subs = self.local_subscriptions.clone();
        let peers = self.peers.clone();
        let inbound_sessions = self.inbound_sessions.clone();

        tokio::spawn(async move {
            Self::peer_listener_loop(
                listener,
                inbound_callback,
                local_node_id,
                local_subs,
                peers,
                inbound_sessions,
            )
            .await;
        });

        // Spawn gossip watcher (discovers new peers, connects to them)
        let chitchat = self.chitchat.chitchat();
        let peers = self.peers.clone();
        let config = self.config.clone();
        let inbound_callback = self.inbound_callback.clone();
        let local_node_id = self.node_id.clone();

        tokio::spawn(async move {
            Self::gossip_watcher_loop(chitchat, peers, config, inbound_callback, local_node_id)
                .await;
        });

        Ok(())
    }

    /// Stop the cluster manager
    pub async fn stop(&self) {
        info!("Stopping cluster manager");

        // Stop all peer connections
        for peer in self.peers.iter() {
            let _ = peer.value().stop().await;
        }

        // Shutdown chitchat - it will stop when handle is dropped
    }

    /// Listen for incoming peer connections
    #[allow(clippy::too_many_arguments)]
    async fn peer_listener_loop(
        listener: TcpListener,
        inbound_callback: ClusterInboundCallback,
        local_node_id: String,
        local_subs: Arc<RwLock<HashSet<String>>>,
        peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
        inbound_sessions: Arc<DashMap<String, Mutex<InboundSession>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);

                    let callback = inbound_callback.clone();
                    let node_id = local_node_id.clone();
                    let subs = local_subs.clone();
                    let peers = peers.clone();
                    let inbound_sessions = inbound_sessions.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_incoming_peer(
                            stream,
                            callback,
                            node_id,
                            subs,
                            peers,
                            inbound_sessions,
                        )
                        .await
                        {
                            debug!("Incoming peer connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
        }
    }

    /// Handle an incoming peer connection: Hello/HelloAck, the resume
    /// handshake, then the receive loop that dedups and acks events.
    #[allow(clippy::too_many_arguments)]
    async fn handle_incoming_peer(
        stream: tokio::net::TcpStream,
        inbound_callback: ClusterInboundCallback,
        local_node_id: String,
        local_subs: Arc<RwLock<HashSet<String>>>,
        peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
        inbound_sessions: Arc<DashMap<String, Mutex<InboundSession>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = vec![0u8; 65536];
        let mut buf_offset = 0usize;

        macro_rules! read_one {
            () => {{
                loop {
                    if buf_offset >= 4 {
                        let len = read_frame_length(&read_buf).unwrap() as usize;
                        if buf_offset >= 4 + len {
                            let msg = ClusterMessage::decode(&read_buf[4..4 + len])?;
                            let consumed = 4 + len;
                            let remaining = buf_offset - consumed;
                            read_buf.copy_within(consumed..buf_offset, 0);
                            buf_offset = remaining;
                            break msg;
                        }
                    }
                    let n = tokio::time::timeout(
                        Duration::from_secs(10),
                        read_half.read(&mut read_buf[buf_offset..]),
                    )
                    .await??;
                    if n == 0 {
                        return Err("Connection closed".into());
                    }
                    buf_offset += n;
                }
            }};
        }

        // Wait for Hello
        let peer_node_id = match read_one!() {
            ClusterMessage::Hello { node_id, version } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )
                    .into());
                }
                node_id
            }
            _ => return Err("Expected Hello".into()),
        };

        info!("Incoming cluster peer: {}", peer_node_id);

        // Send HelloAck
        let ack = ClusterMessage::HelloAck {
            node_id: local_node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_half.write_all(&frame_message(&ack)?).await?;

        // Send our subscriptions (full resync, best effort)
        let subs: Vec<String> = local_subs.read().iter().cloned().collect();
        let sync = ClusterMessage::SubscriptionSync { filters: subs };
        write_half.write_all(&frame_message(&sync)?).await?;

        // Resume handshake: look up (or create) our record of this node's session.
        let session_id = match read_one!() {
            ClusterMessage::ResumeReq { session_id } => session_id,
            _ => return Err("Expected ResumeReq".into()),
        };

        let rsp = {
            let entry = inbound_sessions
                .entry(peer_node_id.clone())
                .or_insert_with(|| Mutex::new(InboundSession::fresh(session_id)));
            let mut session = entry.lock();
            if session.session_id == session_id {
                ClusterMessage::ResumeRsp {
                    restart: false,
                    next_id: session.next_expected_id,
                }
            } else {
                *session = InboundSession::fresh(session_id);
                ClusterMessage::ResumeRsp {
                    restart: true,
                    next_id: 0,
                }
            }
        };
        write_half.write_all(&frame_message(&rsp)?).await?;

        // Message loop: apply replicated events in order, ack, dedup on resend.
        loop {
            let msg = read_one!();
            match msg {
                ClusterMessage::Event {
                    id,
                    origin_node,
                    payload,
                } => {
                    let is_new = {
                        let entry = inbound_sessions
                            .get(&peer_node_id)
                            .expect("session created during handshake");
                        let mut session = entry.lock();
                        let new = session.dedup.insert(id);
                        session.next_expected_id = session.next_expected_id.max(id + 1);
                        new
                    };

                    if is_new {
                        Self::apply_event(&payload, &origin_node, &inbound_callback, &peers);
                    }

                    let ack = ClusterMessage::Ack { id };
                    write_half.write_all(&frame_message(&ack)?).await?;
                }
                ClusterMessage::Ping => {
                    let pong = ClusterMessage::Pong;
                    write_half.write_all(&frame_message(&pong)?).await?;
                }
                ClusterMessage::Goodbye => {
                    info!("Cluster peer '{}' said goodbye", peer_node_id);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Apply one replicated event received from a peer: fan a Publish out
    /// through the broker, or record a remote subscription interest so
    /// `should_forward` routes future publishes correctly.
    fn apply_event(
        payload: &EventPayload,
        origin_node: &str,
        inbound_callback: &ClusterInboundCallback,
        peers: &Arc<DashMap<String, Arc<ClusterPeer>>>,
    ) {
        match payload {
            EventPayload::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                let qos_level = match qos {
                    0 => QoS::AtMostOnce,
                    1 => QoS::AtLeastOnce,
                    _ => QoS::ExactlyOnce,
                };
                debug!(
                    "Cluster inbound: applying replicated publish '{}' (origin={})",
                    topic, origin_node
                );
                inbound_callback(
                    topic.clone(),
                    Bytes::from(payload.clone()),
                    qos_level,
                    *retain,
                    origin_node.to_string(),
                );
            }
            EventPayload::Subscribe { filter } => {
                if let Some(peer) = peers.get(origin_node) {
                    peer.update_remote_subscriptions(
                        peer.remote_subscriptions_snapshot()
                            .into_iter()
                            .chain(std::iter::once(filter.clone()))
                            .collect(),
                    );
                }
            }
            EventPayload::Unsubscribe { filter } => {
                if let Some(peer) = peers.get(origin_node) {
                    peer.update_remote_subscriptions(
                        peer.remote_subscriptions_snapshot()
                            .into_iter()
                            .filter(|f| f != filter)
                            .collect(),
                    );
                }
            }
        }
    }

    /// Watch gossip state for new peers and connect to them
    async fn gossip_watcher_loop(
        chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
        peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
        config: ClusterConfig,
        inbound_callback: ClusterInboundCallback,
        local_node_id: String,
    ) {
        let mut known_nodes: HashSet<String> = HashSet::new();

        loop {
            tokio::time::sleep(config.gossip_interval_duration()).await;

            // Get current cluster state
            let cluster_state = {
                let cc = chitchat.lock().await;
                cc.state_snapshot()
            };

            // Find new nodes
            for node_state in &cluster_state.node_states {
                let node_id_str = node_state.chitchat_id().node_id.clone();

                // Skip ourselves
                if node_id_str == local_node_id {
                    continue;
                }

                // Check if this is a new node
                if !known_nodes.contains(&node_id_str) {
                    known_nodes.insert(node_id_str.clone());

                    // Get peer address from gossip state - this should be the advertise address
                    let gossip_addr = node_state.chitchat_id().gossip_advertise_addr;

                    if let Some(peer_addr_str) = node_state.get(KEY_PEER_ADDR) {
                        if let Ok(peer_addr) = peer_addr_str.parse::<SocketAddr>() {
                            info!(
                                "Discovered new cluster peer: {} at peer={} gossip={}",
                                node_id_str, peer_addr, gossip_addr
                            );

                            // Create and spawn peer connection
                            let peer = ClusterPeer::new(
                                node_id_str.clone(),
                                peer_addr,
                                local_node_id.clone(),
                            );
                            let peer = peer.spawn(inbound_callback.clone());
                            peers.insert(node_id_str.clone(), peer);
                        }
                    }
                }

                // Subscription state itself is kept in sync by the ordered,
                // acked Subscribe/Unsubscribe events applied in `apply_event`
                // (reconciled on reconnect by the resume handshake in
                // `peer_listener_loop`); gossip only carries discovery info
                // (`KEY_PEER_ADDR`) here, it no longer overwrites
                // `remote_subscriptions` wholesale from a possibly-stale
                // snapshot.
            }

            // Remove dead nodes
            let current_nodes: HashSet<String> = cluster_state
                .node_states
                .iter()
                .map(|ns| ns.chitchat_id().node_id.clone())
                .collect();

            let dead_nodes: Vec<String> = known_nodes
                .iter()
                .filter(|n| *n != &local_node_id && !current_nodes.contains(*n))
                .cloned()
                .collect();

            for node_id in dead_nodes {
                info!("Cluster peer '{}' left the cluster", node_id);
                known_nodes.remove(&node_id);
                if let Some((_, peer)) = peers.remove(&node_id) {
                    let _ = peer.stop().await;
                }
            }
        }
    }
}

// ClusterManager is Send + Sync because all its fields are thread-safe
unsafe impl Send for ClusterManager {}
unsafe impl Sync for ClusterManager {}
