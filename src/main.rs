//! MeshMQ - clustered MQTT v3.1/v3.1.1/v5.0 broker
//!
//! Usage:
//!   meshmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   -w, --workers <N>      Number of worker threads (default: CPU count)
//!   --max-connections <N>  Maximum connections (default: 100000)
//!   --max-packet-size <N>  Maximum packet size (default: 1MB)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meshmq::broker::{Broker, BrokerConfig, RetainedMessage, TlsConfig};
use meshmq::config::{Config, StoreType};
use meshmq::hooks::DefaultHooks;
use meshmq::persistence::{FjallBackend, PersistenceManager};
use meshmq::protocol::{Properties, QoS};
use meshmq::topic::{FjallSubscriptionBackend, RedisSubscriptionBackend, SubscriptionStore};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// MeshMQ - clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "meshmq")]
#[command(author = "MeshMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Clustered MQTT v3.1/v3.1.1/v5.0 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket bind address (optional, enables MQTT over WebSocket)
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Number of worker threads (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Default keep alive in seconds
    #[arg(long)]
    keep_alive: Option<u16>,

    /// Enable retained messages
    #[arg(long)]
    retain: Option<bool>,

    /// Enable wildcard subscriptions
    #[arg(long)]
    wildcard_subs: Option<bool>,

    /// Maximum topic aliases
    #[arg(long)]
    max_topic_alias: Option<u16>,

    /// Receive maximum (flow control)
    #[arg(long)]
    receive_maximum: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use env vars + defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::from_env().unwrap_or_default()
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if args.config.is_some() {
        info!(
            "Loaded configuration from {:?}",
            args.config.as_ref().unwrap()
        );
    }

    // CLI args override file config
    let bind_addr = args.bind.unwrap_or(file_config.server.bind);
    let tls_bind_addr = file_config.server.tls_bind;
    let tls_config = file_config.server.tls.as_ref().map(|tls| TlsConfig {
        cert_path: tls.cert.clone(),
        key_path: tls.key.clone(),
        ca_cert_path: tls.ca_cert.clone(),
        require_client_cert: tls.require_client_cert,
    });
    let ws_bind_addr = args.ws_bind.or(file_config.server.ws_bind);
    let max_connections = args
        .max_connections
        .unwrap_or(file_config.limits.max_connections);
    let max_connections = if max_connections == 0 {
        10_000_000
    } else {
        max_connections
    };
    let max_packet_size = args
        .max_packet_size
        .unwrap_or(file_config.limits.max_packet_size);
    let max_packet_size = if max_packet_size == 0 {
        usize::MAX
    } else {
        max_packet_size
    };
    let keep_alive = args
        .keep_alive
        .unwrap_or(file_config.session.default_keep_alive);
    let max_keep_alive = file_config.session.max_keep_alive;
    let max_topic_alias = args
        .max_topic_alias
        .unwrap_or(file_config.session.max_topic_aliases);
    let receive_maximum = args.receive_maximum.unwrap_or(65535);
    let retain_available = args.retain.unwrap_or(file_config.mqtt.retain_available);
    let wildcard_subs = args
        .wildcard_subs
        .unwrap_or(file_config.mqtt.wildcard_subscriptions);

    // Parse max QoS
    let max_qos_value = args.max_qos.unwrap_or(file_config.mqtt.max_qos);
    let max_qos = match max_qos_value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => {
            eprintln!(
                "Invalid max-qos value: {}. Must be 0, 1, or 2.",
                max_qos_value
            );
            std::process::exit(1);
        }
    };

    // Determine worker count
    let workers = args.workers.unwrap_or(file_config.server.workers);
    let num_workers = if workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        workers
    };

    // Build broker configuration
    let broker_config = BrokerConfig {
        bind_addr,
        tls_bind_addr,
        tls_config,
        ws_bind_addr,
        ws_path: file_config.server.ws_path.clone(),
        max_connections,
        max_packet_size,
        default_keep_alive: keep_alive,
        max_keep_alive,
        session_expiry_check_interval: file_config.session.expiry_check_interval_duration(),
        receive_maximum,
        max_qos,
        retain_available,
        wildcard_subscription_available: wildcard_subs,
        subscription_identifiers_available: file_config.mqtt.subscription_identifiers,
        shared_subscriptions_available: file_config.mqtt.shared_subscriptions,
        max_topic_alias,
        num_workers,
        sys_topics_enabled: file_config.mqtt.sys_topics,
        sys_topics_interval: file_config.mqtt.sys_interval,
        // 0 = unbounded for all limits
        max_inflight: if file_config.limits.max_inflight == 0 {
            u16::MAX
        } else {
            file_config.limits.max_inflight
        },
        max_queued_messages: if file_config.limits.max_queued_messages == 0 {
            usize::MAX
        } else {
            file_config.limits.max_queued_messages
        },
        max_awaiting_rel: if file_config.limits.max_awaiting_rel == 0 {
            usize::MAX
        } else {
            file_config.limits.max_awaiting_rel
        },
        retry_interval: file_config.limits.retry_interval_duration(),
        outbound_channel_capacity: if file_config.limits.outbound_channel_capacity == 0 {
            // tokio mpsc channel max is ~2^61, use a large but safe value
            1_000_000
        } else {
            file_config.limits.outbound_channel_capacity
        },
        max_topic_levels: file_config.limits.max_topic_levels,
        proxy_protocol: file_config.server.proxy_protocol.clone(),
        tls_proxy_protocol: file_config.server.tls_proxy_protocol.clone(),
        ws_proxy_protocol: file_config.server.ws_proxy_protocol.clone(),
    };

    info!("Starting MeshMQ broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    if let Some(tls_addr) = &broker_config.tls_bind_addr {
        info!("  TLS address: {}", tls_addr);
    }
    if let Some(ws_addr) = &broker_config.ws_bind_addr {
        info!("  WebSocket address: {}", ws_addr);
    }
    info!("  Workers: {}", broker_config.num_workers);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max inflight: {}", broker_config.max_inflight);
    info!(
        "  Max queued messages: {}",
        broker_config.max_queued_messages
    );
    info!(
        "  Outbound channel capacity: {}",
        broker_config.outbound_channel_capacity
    );
    info!("  Max QoS: {:?}", broker_config.max_qos);

    // Log PROXY protocol status
    if broker_config.proxy_protocol.enabled {
        info!(
            "  PROXY protocol (TCP): enabled{}",
            if broker_config.proxy_protocol.tls_termination {
                " (TLS termination)"
            } else {
                ""
            }
        );
    }
    if broker_config.tls_proxy_protocol.enabled {
        info!(
            "  PROXY protocol (TLS): enabled{}",
            if broker_config.tls_proxy_protocol.tls_termination {
                " (TLS termination)"
            } else {
                ""
            }
        );
    }
    if broker_config.ws_proxy_protocol.enabled {
        info!(
            "  PROXY protocol (WebSocket): enabled{}",
            if broker_config.ws_proxy_protocol.tls_termination {
                " (TLS termination)"
            } else {
                ""
            }
        );
    }

    // Open the persistence backend first, if enabled, so the fjall keyspace can
    // be shared with a disk-backed subscription store below.
    let fjall_backend = if file_config.persistence.enabled {
        match FjallBackend::open(&file_config.persistence.path) {
            Ok(b) => Some(Arc::new(b)),
            Err(e) => {
                eprintln!("Error opening persistence backend: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    // Build the subscription store backend
    info!("  Subscription store: {:?}", file_config.store.store_type);
    let subscriptions = match file_config.store.store_type {
        StoreType::Ram => Arc::new(SubscriptionStore::new()),
        StoreType::Disk => {
            let keyspace = match &fjall_backend {
                Some(backend) => backend.keyspace().clone(),
                None => {
                    eprintln!("store.type = \"disk\" requires persistence to be enabled");
                    std::process::exit(1);
                }
            };
            match FjallSubscriptionBackend::open(&keyspace) {
                Ok(backend) => Arc::new(SubscriptionStore::with_backend(Arc::new(backend))),
                Err(e) => {
                    eprintln!("Error opening subscription store backend: {}", e);
                    std::process::exit(1);
                }
            }
        }
        StoreType::Redis => {
            let redis_cfg = &file_config.store.redis;
            match RedisSubscriptionBackend::connect(
                &redis_cfg.addrs,
                redis_cfg.user.as_deref(),
                redis_cfg.pwd.as_deref(),
            )
            .await
            {
                Ok(backend) => Arc::new(SubscriptionStore::with_backend(Arc::new(backend))),
                Err(e) => {
                    eprintln!("Error connecting to redis subscription store: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    if file_config.store.store_type != StoreType::Ram {
        if let Err(e) = subscriptions.restore_from_backend().await {
            tracing::warn!("failed to restore subscriptions from backend: {}", e);
        } else {
            info!(
                "  Restored {} subscriptions from backend",
                subscriptions.subscription_count()
            );
        }
    }

    // Create broker with default hooks (allow-all) and the configured store
    let hooks = Arc::new(DefaultHooks);
    let mut broker = Broker::with_hooks_and_store(broker_config, hooks, subscriptions);

    // Initialize persistence if enabled
    let persistence_manager = if let Some(backend) = fjall_backend {
        info!(
            "  Persistence: enabled ({:?})",
            file_config.persistence.path
        );

        let manager = Arc::new(PersistenceManager::new(
            backend,
            std::time::Duration::from_millis(file_config.persistence.flush_interval_ms),
            file_config.persistence.max_batch_size,
        ));

        let loaded = match manager.load_all().await {
            Ok(data) => data,
            Err(e) => {
                eprintln!("Error loading persistence data: {}", e);
                std::process::exit(1);
            }
        };

        info!(
            "  Loaded: {} retained messages, {} sessions",
            loaded.retained.len(),
            loaded.sessions.len()
        );

        // Restore retained messages
        for (topic, stored) in loaded.retained {
            let msg = RetainedMessage {
                topic: Arc::from(topic.as_str()),
                payload: bytes::Bytes::from(stored.payload),
                qos: QoS::from_u8(stored.qos).unwrap_or_default(),
                properties: Properties::from(stored.properties),
                timestamp: Instant::now(), // Approximate - original timestamp lost
            };
            broker.retained().insert(topic, msg);
        }

        // Sessions are recreated on client reconnect; the session store itself
        // does not yet support cold restoration from persisted state.

        broker.set_persistence(manager.clone());

        Some(manager)
    } else {
        info!("  Persistence: disabled");
        None
    };

    // Setup clustering if configured
    let enabled_clusters = file_config.cluster.iter().filter(|c| c.enabled).count();
    if enabled_clusters > 0 {
        let cluster_cfg = file_config.cluster[0].clone(); // Only first cluster config is used
        info!(
            "  Cluster: enabled (gossip={}, peer={})",
            cluster_cfg.gossip_addr, cluster_cfg.peer_addr
        );
        if !cluster_cfg.seeds.is_empty() {
            info!("    Seeds: {}", cluster_cfg.seeds.join(", "));
        }

        match broker.create_cluster_manager(cluster_cfg).await {
            Ok(cluster_manager) => {
                broker.set_cluster_manager(cluster_manager);
            }
            Err(e) => {
                eprintln!("Error initializing cluster: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("  Cluster: disabled");
    }

    // Run the broker (it handles Ctrl+C internally via the shutdown signal)
    let result = broker.run().await;

    // Shutdown persistence (flush pending writes)
    if let Some(persistence) = persistence_manager {
        info!("Flushing persistence...");
        if let Err(e) = persistence.shutdown().await {
            tracing::error!("Error during persistence shutdown: {}", e);
        }
    }

    result?;
    Ok(())
}
