//! Cluster Peer
//!
//! Represents a connection to another node in the cluster.
//! Implements RemotePeer for unified message forwarding.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::protocol::QoS;
use crate::remote::{RemoteError, RemotePeer, RemotePeerStatus};
use crate::topic::topic_matches_filter;

use super::protocol::{
    frame_message, read_frame_length, ClusterMessage, EventPayload, CLUSTER_PROTOCOL_VERSION,
};
use super::queue::ReplicationQueue;

/// Generates a session id unique to this process's lifetime, so a restart
/// never collides with the id a peer remembers from before the crash.
fn generate_session_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let salt = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos ^ (std::process::id() as u64).rotate_left(32) ^ salt
}

/// Commands sent to the peer connection task
#[derive(Debug)]
pub enum ClusterCommand {
    /// Queue a replication event for ordered, acknowledged delivery
    Replicate(EventPayload),
    /// Send a full (unordered, best-effort) subscription resync
    SyncSubscriptions { filters: Vec<String> },
    /// Shutdown the connection
    Shutdown,
}

/// Callback for messages received from a cluster peer
pub type ClusterInboundCallback = Arc<dyn Fn(String, Bytes, QoS, bool, String) + Send + Sync>;

/// A connection to another cluster node. This side always dials out and
/// acts as the sender of replicated events: an ordered queue of events
/// generated locally is streamed to the peer and trimmed as acks arrive.
pub struct ClusterPeer {
    /// Remote node ID
    node_id: String,
    /// Remote peer address for TCP connection
    peer_addr: SocketAddr,
    /// Current connection status
    status: Arc<RwLock<RemotePeerStatus>>,
    /// Command channel for sending operations to the connection task
    command_tx: Option<mpsc::Sender<ClusterCommand>>,
    /// Remote node's subscriptions (updated via gossip and full resyncs)
    remote_subscriptions: Arc<RwLock<HashSet<String>>>,
    /// Our local node ID (for origin tracking)
    local_node_id: String,
    /// Ordered, acknowledged outbound event queue for this connection.
    /// Survives reconnects; entries are replayed from whatever id the
    /// peer's resume handshake reports.
    queue: Arc<ReplicationQueue>,
    /// Session id identifying this process's lifetime to the peer, used by
    /// the resume handshake on every (re)connection.
    session_id: u64,
}

impl ClusterPeer {
    /// Create a new cluster peer
    pub fn new(node_id: String, peer_addr: SocketAddr, local_node_id: String) -> Self {
        Self {
            node_id,
            peer_addr,
            status: Arc::new(RwLock::new(RemotePeerStatus::Disconnected)),
            command_tx: None,
            remote_subscriptions: Arc::new(RwLock::new(HashSet::new())),
            local_node_id,
            queue: Arc::new(ReplicationQueue::new()),
            session_id: generate_session_id(),
        }
    }

    /// Get the remote node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Update remote subscriptions (called when gossip state changes)
    pub fn update_remote_subscriptions(&self, filters: Vec<String>) {
        let mut subs = self.remote_subscriptions.write();
        subs.clear();
        subs.extend(filters);
    }

    /// Snapshot of the remote's currently known subscription filters.
    pub fn remote_subscriptions_snapshot(&self) -> Vec<String> {
        self.remote_subscriptions.read().iter().cloned().collect()
    }

    /// Send a full subscription resync to this peer
    pub async fn send_subscription_sync(&self, filters: Vec<String>) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            tx.send(ClusterCommand::SyncSubscriptions { filters })
                .await
                .map_err(|_| RemoteError::ConnectionLost("Command channel closed".to_string()))?;
        }
        Ok(())
    }

    /// Spawn the connection task and return the peer ready to use
    pub fn spawn(mut self, inbound_callback: ClusterInboundCallback) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1000);
        self.command_tx = Some(tx);

        let node_id = self.node_id.clone();
        let local_node_id = self.local_node_id.clone();
        let peer_addr = self.peer_addr;
        let status = self.status.clone();
        let remote_subs = self.remote_subscriptions.clone();
        let queue = self.queue.clone();
        let session_id = self.session_id;

        tokio::spawn(async move {
            Self::connection_loop(
                node_id,
                local_node_id,
                peer_addr,
                status,
                rx,
                inbound_callback,
                remote_subs,
                queue,
                session_id,
            )
            .await;
        });

        Arc::new(self)
    }

    /// Run the connection loop with reconnection
    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        node_id: String,
        local_node_id: String,
        peer_addr: SocketAddr,
        status: Arc<RwLock<RemotePeerStatus>>,
        mut command_rx: mpsc::Receiver<ClusterCommand>,
        inbound_callback: ClusterInboundCallback,
        remote_subs: Arc<RwLock<HashSet<String>>>,
        queue: Arc<ReplicationQueue>,
        session_id: u64,
    ) {
        // Dial retries at a fixed cadence until the peer comes up.
        let retry_interval = Duration::from_millis(500);

        loop {
            *status.write() = RemotePeerStatus::Connecting;
            debug!("ClusterPeer '{}': Connecting to {}", node_id, peer_addr);

            match Self::connect_and_run(
                &node_id,
                &local_node_id,
                peer_addr,
                &status,
                &mut command_rx,
                &inbound_callback,
                &remote_subs,
                &queue,
                session_id,
            )
            .await
            {
                Ok(()) => {
                    info!("ClusterPeer '{}': Disconnected gracefully", node_id);
                    *status.write() = RemotePeerStatus::Disconnected;
                    return; // Clean shutdown
                }
                Err(e) => {
                    error!("ClusterPeer '{}': Connection failed: {}", node_id, e);
                    *status.write() = RemotePeerStatus::Backoff;

                    debug!(
                        "ClusterPeer '{}': Reconnecting in {:?}",
                        node_id, retry_interval
                    );

                    tokio::time::sleep(retry_interval).await;
                }
            }

            // Check for shutdown command
            match command_rx.try_recv() {
                Ok(ClusterCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("ClusterPeer '{}': Shutdown requested", node_id);
                    *status.write() = RemotePeerStatus::Disconnected;
                    return;
                }
                _ => {}
            }
        }
    }

    /// Connect to the peer, run the resume handshake, and then run the
    /// send/receive message loop.
    #[allow(clippy::too_many_arguments)]
    async fn connect_and_run(
        node_id: &str,
        local_node_id: &str,
        peer_addr: SocketAddr,
        status: &Arc<RwLock<RemotePeerStatus>>,
        command_rx: &mut mpsc::Receiver<ClusterCommand>,
        _inbound_callback: &ClusterInboundCallback,
        remote_subs: &Arc<RwLock<HashSet<String>>>,
        queue: &Arc<ReplicationQueue>,
        session_id: u64,
    ) -> Result<(), RemoteError> {
        // Connect with timeout
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(peer_addr))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

        debug!("ClusterPeer '{}': TCP connected", node_id);

        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = vec![0u8; 65536];
        let mut buf_offset = 0usize;

        // --- Hello / HelloAck ---
        let hello = ClusterMessage::Hello {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        Self::write_message(&mut write_half, &hello).await?;
        debug!("ClusterPeer '{}': Hello sent", node_id);

        let msg = Self::read_message(&mut read_half, &mut read_buf, &mut buf_offset).await?;
        match msg {
            ClusterMessage::HelloAck {
                node_id: peer_id,
                version,
            } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                info!("ClusterPeer '{}': Connected (peer_id={})", node_id, peer_id);
            }
            _ => return Err(RemoteError::Other("Expected HelloAck".to_string())),
        }

        // --- Resume handshake: runs before the send/receive loop starts ---
        let resume_req = ClusterMessage::ResumeReq { session_id };
        Self::write_message(&mut write_half, &resume_req).await?;

        let mut cursor = match Self::read_message(&mut read_half, &mut read_buf, &mut buf_offset)
            .await?
        {
            ClusterMessage::ResumeRsp { restart, next_id } => {
                if restart {
                    debug!(
                        "ClusterPeer '{}': peer has no record of our session, restarting from 0",
                        node_id
                    );
                    queue.restart();
                    0
                } else {
                    queue.ack_through(next_id.saturating_sub(1));
                    next_id
                }
            }
            _ => return Err(RemoteError::Other("Expected ResumeRsp".to_string())),
        };

        *status.write() = RemotePeerStatus::Connected;

        // Message loop
        let ping_interval = Duration::from_secs(15);
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.reset();

        loop {
            // Flush everything queued from the current cursor onward, in
            // strict id order, before waiting on anything else.
            while let Some(ev) = queue.peek_from(cursor) {
                let msg = ClusterMessage::Event {
                    id: ev.id,
                    origin_node: local_node_id.to_string(),
                    payload: ev.payload,
                };
                if let Err(e) = Self::write_message(&mut write_half, &msg).await {
                    error!("ClusterPeer '{}': TCP write error: {}", node_id, e);
                    return Err(e);
                }
                cursor = ev.id + 1;
            }

            tokio::select! {
                // Handle commands from the cluster manager
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        ClusterCommand::Replicate(payload) => {
                            queue.enqueue(payload);
                        }
                        ClusterCommand::SyncSubscriptions { filters } => {
                            let msg = ClusterMessage::SubscriptionSync { filters };
                            if let Err(e) = Self::write_message(&mut write_half, &msg).await {
                                return Err(e);
                            }
                        }
                        ClusterCommand::Shutdown => {
                            let msg = ClusterMessage::Goodbye;
                            let _ = Self::write_message(&mut write_half, &msg).await;
                            return Ok(());
                        }
                    }
                }

                // Handle incoming messages from peer (acks, keep-alives, resync)
                result = read_half.read(&mut read_buf[buf_offset..]) => {
                    let n = result.map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
                    }

                    buf_offset += n;

                    while buf_offset >= 4 {
                        let len = read_frame_length(&read_buf).unwrap() as usize;
                        if buf_offset < 4 + len {
                            break; // Need more data
                        }

                        if let Ok(msg) = ClusterMessage::decode(&read_buf[4..4 + len]) {
                            match msg {
                                ClusterMessage::SubscriptionSync { filters } => {
                                    debug!(
                                        "ClusterPeer '{}': Received subscription sync ({} filters)",
                                        node_id, filters.len()
                                    );
                                    let mut subs = remote_subs.write();
                                    subs.clear();
                                    subs.extend(filters);
                                }
                                ClusterMessage::Ack { id } => {
                                    queue.ack_through(id);
                                }
                                ClusterMessage::Ping => {
                                    let pong = ClusterMessage::Pong;
                                    if let Err(e) = Self::write_message(&mut write_half, &pong).await {
                                        return Err(e);
                                    }
                                }
                                ClusterMessage::Pong => {
                                    debug!("ClusterPeer '{}': Pong received", node_id);
                                }
                                ClusterMessage::Goodbye => {
                                    info!("ClusterPeer '{}': Received Goodbye", node_id);
                                    return Err(RemoteError::ConnectionLost("Peer disconnected".to_string()));
                                }
                                _ => {}
                            }
                        }

                        read_buf.copy_within(4 + len..buf_offset, 0);
                        buf_offset -= 4 + len;
                    }
                }

                // Send periodic ping
                _ = ping_timer.tick() => {
                    let ping = ClusterMessage::Ping;
                    if let Err(e) = Self::write_message(&mut write_half, &ping).await {
                        return Err(e);
                    }
                }

                // A new event was enqueued: loop back around to flush it.
                _ = queue.notified() => {}
            }
        }
    }

    async fn write_message(
        write_half: &mut OwnedWriteHalf,
        msg: &ClusterMessage,
    ) -> Result<(), RemoteError> {
        let frame =
            frame_message(msg).map_err(|e| RemoteError::Other(format!("Encode error: {}", e)))?;
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))
    }

    /// Reads one complete, framed `ClusterMessage`, buffering partial reads
    /// as needed. Used for the handshake, where messages are exchanged one
    /// at a time before the main select loop takes over framing.
    async fn read_message(
        read_half: &mut OwnedReadHalf,
        read_buf: &mut [u8],
        buf_offset: &mut usize,
    ) -> Result<ClusterMessage, RemoteError> {
        loop {
            if *buf_offset >= 4 {
                let len = read_frame_length(read_buf).unwrap() as usize;
                if *buf_offset >= 4 + len {
                    let msg = ClusterMessage::decode(&read_buf[4..4 + len])
                        .map_err(|e| RemoteError::Other(format!("Decode error: {}", e)))?;
                    let consumed = 4 + len;
                    let remaining = *buf_offset - consumed;
                    read_buf.copy_within(consumed..*buf_offset, 0);
                    *buf_offset = remaining;
                    return Ok(msg);
                }
            }

            let n = tokio::time::timeout(
                Duration::from_secs(10),
                read_half.read(&mut read_buf[*buf_offset..]),
            )
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

            if n == 0 {
                return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
            }
            *buf_offset += n;
        }
    }
}

#[async_trait]
impl RemotePeer for ClusterPeer {
    fn name(&self) -> &str {
        &self.node_id
    }

    fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    async fn forward_publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        self.queue.enqueue(EventPayload::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: qos as u8,
            retain,
        });
        Ok(())
    }

    async fn notify_subscribe(&self, filter: &str, _qos: QoS) -> Result<(), RemoteError> {
        self.queue.enqueue(EventPayload::Subscribe {
            filter: filter.to_string(),
        });
        Ok(())
    }

    async fn notify_unsubscribe(&self, filter: &str) -> Result<(), RemoteError> {
        self.queue.enqueue(EventPayload::Unsubscribe {
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn should_forward(&self, topic: &str) -> bool {
        // Check if the peer has any subscription that matches this topic
        let subs = self.remote_subscriptions.read();
        let subs_list: Vec<_> = subs.iter().cloned().collect();
        let matches = subs
            .iter()
            .any(|filter| topic_matches_filter(topic, filter));
        tracing::debug!(
            "ClusterPeer '{}': should_forward('{}')={} remote_subs={:?}",
            self.node_id,
            topic,
            matches,
            subs_list
        );
        matches
    }

    async fn start(&self) -> Result<(), RemoteError> {
        info!("ClusterPeer '{}': Starting", self.node_id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(ClusterCommand::Shutdown).await;
        }
        info!("ClusterPeer '{}': Stopped", self.node_id);
        Ok(())
    }
}
