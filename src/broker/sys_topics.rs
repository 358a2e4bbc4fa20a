//! $SYS Topics Publisher
//!
//! Publishes broker statistics as retained messages to standard $SYS/# topics.
//! Topics are updated periodically based on configuration.

use std::time::Instant;

use bytes::Bytes;

use super::Broker;
use crate::protocol::QoS;

/// Version string for $SYS/broker/version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Publish all $SYS topics as retained messages
pub fn publish_sys_topics(broker: &Broker, start_time: Instant) {
    let uptime = start_time.elapsed().as_secs();

    publish(broker, "$SYS/broker/version", VERSION);
    publish(broker, "$SYS/broker/uptime", &uptime.to_string());
    publish(
        broker,
        "$SYS/broker/clients/connected",
        &broker.connection_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/sessions/count",
        &broker.session_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/subscriptions/count",
        &broker.subscription_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/retained messages/count",
        &broker.retained_count().to_string(),
    );

    if let Some(stats) = broker.stats() {
        publish(
            broker,
            "$SYS/broker/connections/total",
            &stats.connections_total().to_string(),
        );
        publish(
            broker,
            "$SYS/broker/bytes/received",
            &stats.bytes_received().to_string(),
        );
        publish(
            broker,
            "$SYS/broker/bytes/sent",
            &stats.bytes_sent().to_string(),
        );
    }

    if let Some(manager) = broker.cluster_manager() {
        publish(
            broker,
            "$SYS/broker/cluster/node_id",
            manager.node_id(),
        );
        publish(
            broker,
            "$SYS/broker/cluster/peers",
            &manager.peer_count().to_string(),
        );
        publish(
            broker,
            "$SYS/broker/cluster/peers/connected",
            &manager.connected_peer_count().to_string(),
        );
    }
}

/// Helper to publish a single $SYS topic as QoS 0 retained
fn publish(broker: &Broker, topic: &str, value: &str) {
    broker.publish(
        topic.to_string(),
        Bytes::from(value.to_string()),
        QoS::AtMostOnce,
        true, // retained
    );
}

/// Spawn the $SYS topics publishing task
pub fn spawn_sys_topics_task(
    broker: Broker,
    interval_secs: u64,
    start_time: Instant,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        // Publish immediately on startup
        publish_sys_topics(&broker, start_time);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    publish_sys_topics(&broker, start_time);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("$SYS topics task shutting down");
                    break;
                }
            }
        }
    });
}
