//! MQTT Broker Core
//!
//! The main broker implementation that handles client connections,
//! message routing, and coordinates all components.

mod connection;
mod router;
mod stats;
mod sys_topics;
mod tls;
mod writer;

pub use connection::Connection;
pub use router::MessageRouter;
pub use stats::Stats;
pub use tls::{load_tls_config, TlsError};
pub(crate) use writer::SharedWriter;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterConfig, ClusterInboundCallback, ClusterManager};
use crate::config::ProxyProtocolConfig;
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::PersistenceManager;
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS};
use crate::proxy::{read_proxy_header, ProxyInfo};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;
use crate::transport::WsStream;

/// TLS configuration for a listener
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the server certificate chain (PEM)
    pub cert_path: String,
    /// Path to the server private key (PEM)
    pub key_path: String,
    /// Path to a CA bundle used to verify client certificates
    pub ca_cert_path: Option<String>,
    /// Require and verify a client certificate (mutual TLS)
    pub require_client_cert: bool,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// TLS bind address (optional, enables MQTT over TLS)
    pub tls_bind_addr: Option<SocketAddr>,
    /// TLS configuration, required when `tls_bind_addr` is set
    pub tls_config: Option<TlsConfig>,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    pub ws_path: String,
    /// Maximum connections
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Default keep alive (if client specifies 0)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Session expiry check interval
    pub session_expiry_check_interval: Duration,
    /// Receive maximum (flow control)
    pub receive_maximum: u16,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Subscription identifiers available
    pub subscription_identifiers_available: bool,
    /// Shared subscriptions available
    pub shared_subscriptions_available: bool,
    /// Maximum topic alias
    pub max_topic_alias: u16,
    /// Number of worker tasks
    pub num_workers: usize,
    /// Publish $SYS/broker/... status topics
    pub sys_topics_enabled: bool,
    /// Interval in seconds between $SYS topic publishes
    pub sys_topics_interval: u64,
    /// Maximum in-flight QoS 1/2 messages per client
    pub max_inflight: u16,
    /// Maximum queued messages for an offline persistent session
    pub max_queued_messages: usize,
    /// Maximum pending PUBREL (QoS 2) per client
    pub max_awaiting_rel: usize,
    /// Interval before retrying an unacknowledged QoS 1/2 message
    pub retry_interval: Duration,
    /// Per-connection outbound channel capacity
    pub outbound_channel_capacity: usize,
    /// Maximum topic levels accepted in a published topic name
    pub max_topic_levels: usize,
    /// PROXY protocol handling for the plain TCP listener
    pub proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the TLS listener
    pub tls_proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the WebSocket listener
    pub ws_proxy_protocol: ProxyProtocolConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            tls_bind_addr: None,
            tls_config: None,
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024, // 1 MB
            default_keep_alive: 60,
            max_keep_alive: 65535,
            session_expiry_check_interval: Duration::from_secs(60),
            receive_maximum: 65535,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            max_topic_alias: 65535,
            num_workers: num_cpus::get(),
            sys_topics_enabled: true,
            sys_topics_interval: 10,
            max_inflight: 32,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
            retry_interval: Duration::from_secs(30),
            outbound_channel_capacity: 1024,
            max_topic_levels: 128,
            proxy_protocol: ProxyProtocolConfig::default(),
            tls_proxy_protocol: ProxyProtocolConfig::default(),
            ws_proxy_protocol: ProxyProtocolConfig::default(),
        }
    }
}

// Helper to get number of CPUs
mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub timestamp: Instant,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
    },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str> },
    /// Message published, after local fan-out
    MessagePublished {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A queued message was dropped because a persistent session's queue was full
    MessageDropped,
    /// A client installed a new subscription
    SubscriptionAdded { filter: String, client_id: Arc<str> },
    /// A client removed a subscription
    SubscriptionRemoved { filter: String, client_id: Arc<str> },
}

/// The MQTT Broker
#[derive(Clone)]
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Session store
    sessions: Arc<SessionStore>,
    /// Subscription store
    subscriptions: Arc<SubscriptionStore>,
    /// Retained messages
    retained: Arc<DashMap<String, RetainedMessage>>,
    /// Active connections (client_id -> shared writer handle)
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<BrokerEvent>,
    /// Hooks for auth/ACL and events
    hooks: Arc<dyn Hooks>,
    /// Internal counters backing $SYS topics
    stats: Option<Arc<Stats>>,
    /// Durable storage for retained messages and sessions
    persistence: Option<Arc<PersistenceManager>>,
    /// Gossip-based cluster membership and replication
    cluster_manager: Option<Arc<ClusterManager>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self::with_hooks_and_store(config, hooks, Arc::new(SubscriptionStore::new()))
    }

    /// Create a new broker with custom hooks and a pre-built subscription store,
    /// e.g. one backed by a durable [`crate::topic::SubscriptionBackend`].
    pub fn with_hooks_and_store(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        subscriptions: Arc<SubscriptionStore>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            subscriptions,
            retained: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            shutdown,
            events,
            hooks,
            stats: Some(Arc::new(Stats::new())),
            persistence: None,
            cluster_manager: None,
        }
    }

    /// Access to the retained message map, for restoring persisted state at startup
    pub fn retained(&self) -> &DashMap<String, RetainedMessage> {
        &self.retained
    }

    /// Access to the subscription store, for wiring a durable backend at startup
    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    /// Attach a persistence manager. Must be called before `run`.
    pub fn set_persistence(&mut self, persistence: Arc<PersistenceManager>) {
        self.persistence = Some(persistence);
    }

    /// Create and start a cluster manager from configuration.
    ///
    /// The manager's inbound callback applies messages received from peers
    /// directly to local state without re-forwarding them, to avoid echo
    /// loops across the gossip mesh.
    pub async fn create_cluster_manager(
        &self,
        config: ClusterConfig,
    ) -> Result<Arc<ClusterManager>, Box<dyn std::error::Error + Send + Sync>> {
        let broker = self.clone();
        let callback: ClusterInboundCallback = Arc::new(move |topic, payload, qos, retain, origin_node| {
            broker.apply_remote_publish(topic, payload, qos, retain, origin_node);
        });

        let manager = Arc::new(ClusterManager::new(config, callback).await?);
        manager.start().await?;
        Ok(manager)
    }

    /// Attach a running cluster manager and start forwarding local events to it.
    pub fn set_cluster_manager(&mut self, manager: Arc<ClusterManager>) {
        self.spawn_cluster_forwarder(manager.clone());
        self.cluster_manager = Some(manager);
    }

    /// Forward local subscription and publish events onto the cluster so
    /// other nodes learn about them through gossip and peer forwarding.
    fn spawn_cluster_forwarder(&self, manager: Arc<ClusterManager>) {
        let mut events_rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(BrokerEvent::SubscriptionAdded { filter, .. }) => {
                        manager.add_subscription(filter.clone()).await;
                        manager.notify_subscribe(&filter, QoS::AtMostOnce).await;
                    }
                    Ok(BrokerEvent::SubscriptionRemoved { filter, .. }) => {
                        manager.remove_subscription(&filter).await;
                        manager.notify_unsubscribe(&filter).await;
                    }
                    Ok(BrokerEvent::MessagePublished {
                        topic,
                        payload,
                        qos,
                        retain,
                    }) => {
                        manager.forward_publish(&topic, payload, qos, retain).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Apply a publish received from a cluster peer to local subscribers only.
    fn apply_remote_publish(&self, topic: String, payload: Bytes, qos: QoS, retain: bool, origin_node: String) {
        let sender: Arc<str> = Arc::from(origin_node.as_str());
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic.as_str()),
            packet_id: None,
            payload,
            properties: Properties::default(),
        };

        if retain && self.config.retain_available {
            if publish.payload.is_empty() {
                self.retained.remove(&topic);
            } else {
                self.retained.insert(
                    topic.clone(),
                    RetainedMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos,
                        properties: Properties::default(),
                        timestamp: Instant::now(),
                    },
                );
            }
        }

        self.dispatch_local(&sender, &publish);
    }

    /// Run the broker
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        // Spawn TLS listener if configured
        if let (Some(tls_addr), Some(tls_cfg)) =
            (self.config.tls_bind_addr, self.config.tls_config.as_ref())
        {
            let acceptor = match load_tls_config(tls_cfg) {
                Ok(a) => a,
                Err(e) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("TLS configuration error: {}", e),
                    ))
                }
            };
            let tls_listener = TcpListener::bind(tls_addr).await?;
            info!("MQTT/TLS listening on {}", tls_addr);
            self.spawn_tls_accept_loop(tls_listener, acceptor);
        }

        // Spawn WebSocket listener if configured
        if let Some(ws_addr) = self.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(ws_addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_addr, self.config.ws_path
            );
            self.spawn_ws_accept_loop(ws_listener);
        }

        // Spawn session expiry cleanup task
        let sessions = self.sessions.clone();
        let interval = self.config.session_expiry_check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;

                    _ = ticker.tick() => {
                        sessions.cleanup_expired();
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        // Spawn $SYS topic publisher
        if self.config.sys_topics_enabled {
            sys_topics::spawn_sys_topics_task(
                self.clone(),
                self.config.sys_topics_interval,
                Instant::now(),
                self.shutdown.subscribe(),
            );
        }

        debug!("Starting TCP accept loop");
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New TCP connection from {}", addr);
                    self.handle_connection(stream, addr, self.config.proxy_protocol.clone(), None);
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    fn spawn_tls_accept_loop(&self, listener: TcpListener, acceptor: TlsAcceptor) {
        let broker = self.clone();
        let proxy_cfg = self.config.tls_proxy_protocol.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("New TLS connection from {}", addr);
                                let acceptor = acceptor.clone();
                                let broker = broker.clone();
                                let proxy_cfg = proxy_cfg.clone();
                                tokio::spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            broker.handle_connection(tls_stream, addr, proxy_cfg, None);
                                        }
                                        Err(e) => {
                                            debug!("TLS handshake failed for {}: {}", addr, e);
                                        }
                                    }
                                });
                            }
                            Err(e) => error!("Failed to accept TLS connection: {}", e),
                        }
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    fn spawn_ws_accept_loop(&self, listener: TcpListener) {
        let broker = self.clone();
        let proxy_cfg = self.config.ws_proxy_protocol.clone();
        let ws_path = self.config.ws_path.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, addr)) => {
                                debug!("New WebSocket connection from {}", addr);
                                let broker = broker.clone();
                                let proxy_cfg = proxy_cfg.clone();
                                let ws_path = ws_path.clone();
                                tokio::spawn(async move {
                                    let proxy_info = if proxy_cfg.enabled {
                                        match read_proxy_header(&mut stream, proxy_cfg.timeout).await {
                                            Ok(info) => Some(info),
                                            Err(e) => {
                                                debug!("PROXY header read failed for {}: {}", addr, e);
                                                return;
                                            }
                                        }
                                    } else {
                                        None
                                    };

                                    match WsStream::accept_with_path(stream, &ws_path).await {
                                        Ok(ws_stream) => {
                                            debug!("WebSocket handshake complete for {}", addr);
                                            broker.handle_connection(ws_stream, addr, ProxyProtocolConfig::default(), proxy_info);
                                        }
                                        Err(e) => {
                                            debug!("WebSocket handshake failed for {}: {}", addr, e);
                                        }
                                    }
                                });
                            }
                            Err(e) => error!("Failed to accept WebSocket connection: {}", e),
                        }
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    /// Handle a new connection
    fn handle_connection<T>(&self, stream: T, addr: SocketAddr, proxy_cfg: ProxyProtocolConfig, proxy_info: Option<ProxyInfo>)
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let stats = self.stats.clone();
        let persistence = self.persistence.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut stream = stream;
            let resolved_proxy_info = if proxy_cfg.enabled && proxy_info.is_none() {
                match read_proxy_header(&mut stream, proxy_cfg.timeout).await {
                    Ok(info) => Some(info),
                    Err(e) => {
                        debug!("PROXY header read failed from {}: {}", addr, e);
                        return;
                    }
                }
            } else {
                proxy_info
            };

            if let Some(ref stats) = stats {
                stats.record_connection();
            }

            let mut conn = Connection::new(
                stream,
                addr,
                resolved_proxy_info,
                sessions,
                subscriptions,
                retained,
                connections,
                config,
                events,
                hooks,
                stats,
                persistence,
            );

            // Pin the connection future so we can poll it repeatedly
            let conn_fut = conn.run();
            tokio::pin!(conn_fut);

            loop {
                tokio::select! {
                    biased;

                    result = &mut conn_fut => {
                        if let Err(e) = result {
                            debug!("Connection error from {}: {}", addr, e);
                        }
                        break;
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => {
                                debug!("Connection {} shutting down", addr);
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Connection {} shutdown (channel closed)", addr);
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                // Missed some messages, continue running
                                continue;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Get live subscription count
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    /// Internal counters backing $SYS topics, if stats collection is enabled
    pub fn stats(&self) -> Option<&Arc<Stats>> {
        self.stats.as_ref()
    }

    /// The attached cluster manager, if clustering is enabled
    pub fn cluster_manager(&self) -> Option<&Arc<ClusterManager>> {
        self.cluster_manager.as_ref()
    }

    /// Publish a message from the server (e.g. from an HTTP API or a bridge)
    pub fn publish(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic.as_str()),
            packet_id: None,
            payload: payload.clone(),
            properties: Properties::default(),
        };

        if retain {
            if payload.is_empty() {
                self.retained.remove(&topic);
            } else {
                self.retained.insert(
                    topic.clone(),
                    RetainedMessage {
                        topic: publish.topic.clone(),
                        payload,
                        qos,
                        properties: Properties::default(),
                        timestamp: Instant::now(),
                    },
                );
            }
        }

        let local_sender: Arc<str> = Arc::from("");
        self.dispatch_local(&local_sender, &publish);

        let _ = self.events.send(BrokerEvent::MessagePublished {
            topic,
            payload: publish.payload.clone(),
            qos,
            retain,
        });
    }

    /// Fan a publish out to locally-connected subscribers and offline session queues.
    fn dispatch_local(&self, sender_id: &Arc<str>, publish: &Publish) {
        let matches = self.subscriptions.matches(&publish.topic);

        // Deduplicate by client_id (keep highest QoS)
        let mut client_qos: HashMap<Arc<str>, QoS> = HashMap::new();
        for sub in matches {
            if sub.no_local && sub.client_id == *sender_id {
                continue;
            }
            let entry = client_qos
                .entry(sub.client_id.clone())
                .or_insert(QoS::AtMostOnce);
            if sub.qos > *entry {
                *entry = sub.qos;
            }
        }

        for (client_id, sub_qos) in client_qos {
            let effective_qos = publish.qos.min(sub_qos);

            if let Some(writer) = self.connections.get(&client_id) {
                let mut outgoing = publish.clone();
                if let Err(e) = writer.send_publish(&mut outgoing, effective_qos, publish.retain) {
                    warn!("failed to send publish to {}: {:?}", client_id, e);
                }
            } else if let Some(session) = self.sessions.get(client_id.as_ref()) {
                let mut s = session.write();
                if !s.clean_start {
                    let mut outgoing = publish.clone();
                    outgoing.qos = effective_qos;
                    s.queue_message(outgoing);
                }
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
