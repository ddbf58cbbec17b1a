//! # Connection Manager
//!
//! Tracks every open transport: its outbound channel, pool membership,
//! liveness and traffic counters. The socket task owns the receiving half of
//! the channel; dropping the record here closes that task.
//!
//! Pools group connections for load-balanced sends. Pool sends only consider
//! healthy members; a failed send flips the member to unhealthy and the call
//! reports `false`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::configs::config_live::{ConnectionConfig, LoadBalancingStrategy};

/// A serialized frame shared across all recipients of a fan-out.
pub type OutboundFrame = Arc<str>;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

/// Where `send_message` routes a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget<'a> {
    Connection(&'a str),
    Pool(&'a str),
}

struct ConnectionRecord {
    sender: OutboundSender,
    pools: HashSet<String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    healthy: bool,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    send_failures: u64,
}

impl ConnectionRecord {
    fn deliver(&mut self, connection_id: &str, frame: &OutboundFrame) -> bool {
        match self.sender.send(frame.clone()) {
            Ok(()) => {
                self.messages_sent += 1;
                self.bytes_sent += frame.len() as u64;
                true
            }
            Err(_) => {
                self.healthy = false;
                self.send_failures += 1;
                warn!(connection_id, "send failed, connection marked unhealthy");
                false
            }
        }
    }
}

#[derive(Default)]
struct Pool {
    members: Vec<String>,
    cursor: usize,
    routed_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub connection_id: String,
    pub pools: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub healthy: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub pool_id: String,
    pub members: usize,
    pub healthy_members: usize,
    pub routed_messages: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub total_pools: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
}

/// Outcome of one heartbeat sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    /// Newly marked unhealthy.
    pub stale: Vec<String>,
    /// Removed; the caller cleans up their components.
    pub evicted: Vec<String>,
}

/// # Connection Manager
pub struct ConnectionManager {
    config: ConnectionConfig,
    connections: Mutex<HashMap<String, ConnectionRecord>>,
    pools: Mutex<HashMap<String, Pool>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Registers a transport. Re-registering an id replaces its sender.
    pub fn register_connection(&self, connection_id: &str, sender: OutboundSender, pool_id: Option<&str>) {
        self.register_connection_at(connection_id, sender, pool_id, Utc::now());
    }

    pub fn register_connection_at(
        &self,
        connection_id: &str,
        sender: OutboundSender,
        pool_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        {
            let mut connections = self.connections.lock().expect("Connection lock poisoned");
            let record = ConnectionRecord {
                sender,
                pools: HashSet::new(),
                connected_at: now,
                last_activity: now,
                healthy: true,
                messages_sent: 0,
                messages_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
                send_failures: 0,
            };
            if connections.insert(connection_id.to_string(), record).is_some() {
                warn!(connection_id, "connection re-registered, previous sender dropped");
            }
        }
        info!(connection_id, "connection registered");

        if let Some(pool_id) = pool_id {
            self.join_pool(connection_id, pool_id);
        }
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections
            .lock()
            .expect("Connection lock poisoned")
            .contains_key(connection_id)
    }

    /// Marks inbound traffic. Any frame counts as a heartbeat.
    pub fn record_inbound(&self, connection_id: &str, bytes: usize) -> bool {
        self.record_inbound_at(connection_id, bytes, Utc::now())
    }

    pub fn record_inbound_at(&self, connection_id: &str, bytes: usize, now: DateTime<Utc>) -> bool {
        let mut connections = self.connections.lock().expect("Connection lock poisoned");
        match connections.get_mut(connection_id) {
            Some(record) => {
                record.last_activity = now;
                record.healthy = true;
                record.messages_received += 1;
                record.bytes_received += bytes as u64;
                true
            }
            None => false,
        }
    }

    /// Sends to one connection or one member of a pool.
    pub fn send_message(&self, frame: impl Into<OutboundFrame>, target: SendTarget<'_>) -> bool {
        let frame: OutboundFrame = frame.into();
        match target {
            SendTarget::Connection(connection_id) => {
                let mut connections = self.connections.lock().expect("Connection lock poisoned");
                match connections.get_mut(connection_id) {
                    Some(record) => record.deliver(connection_id, &frame),
                    None => {
                        debug!(connection_id, "send to unknown connection dropped");
                        false
                    }
                }
            }
            SendTarget::Pool(pool_id) => self.send_to_pool(pool_id, &frame),
        }
    }

    fn send_to_pool(&self, pool_id: &str, frame: &OutboundFrame) -> bool {
        let (members, cursor) = {
            let mut pools = self.pools.lock().expect("Pool lock poisoned");
            let Some(pool) = pools.get_mut(pool_id) else {
                debug!(pool_id, "send to unknown pool dropped");
                return false;
            };
            let cursor = pool.cursor;
            pool.cursor = pool.cursor.wrapping_add(1);
            pool.routed_messages += 1;
            (pool.members.clone(), cursor)
        };

        let mut connections = self.connections.lock().expect("Connection lock poisoned");
        let healthy: Vec<&String> = members
            .iter()
            .filter(|id| connections.get(id.as_str()).is_some_and(|r| r.healthy))
            .collect();
        if healthy.is_empty() {
            warn!(pool_id, "no healthy connection in pool");
            return false;
        }

        let chosen = match self.config.load_balancing {
            LoadBalancingStrategy::RoundRobin => healthy[cursor % healthy.len()].clone(),
            LoadBalancingStrategy::LeastLoaded => healthy
                .iter()
                .min_by_key(|id| connections.get(id.as_str()).map(|r| r.messages_sent).unwrap_or(u64::MAX))
                .map(|id| (*id).clone())
                .unwrap_or_else(|| healthy[0].clone()),
            LoadBalancingStrategy::Random => {
                let index = rand::rng().random_range(0..healthy.len());
                healthy[index].clone()
            }
        };

        match connections.get_mut(&chosen) {
            Some(record) => record.deliver(&chosen, frame),
            None => false,
        }
    }

    /// Sends to each listed connection except `exclude`. Returns the delivered count.
    pub fn broadcast(
        &self,
        frame: impl Into<OutboundFrame>,
        connection_ids: &[String],
        exclude: Option<&str>,
    ) -> usize {
        let frame: OutboundFrame = frame.into();
        let mut connections = self.connections.lock().expect("Connection lock poisoned");
        let mut delivered = 0;
        for id in connection_ids {
            if Some(id.as_str()) == exclude {
                continue;
            }
            if let Some(record) = connections.get_mut(id) {
                if record.deliver(id, &frame) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Adds a connection to a pool, creating the pool on first use.
    pub fn join_pool(&self, connection_id: &str, pool_id: &str) -> bool {
        {
            let mut connections = self.connections.lock().expect("Connection lock poisoned");
            let Some(record) = connections.get_mut(connection_id) else {
                return false;
            };
            record.pools.insert(pool_id.to_string());
        }
        let mut pools = self.pools.lock().expect("Pool lock poisoned");
        let pool = pools.entry(pool_id.to_string()).or_default();
        if !pool.members.iter().any(|m| m == connection_id) {
            pool.members.push(connection_id.to_string());
        }
        debug!(connection_id, pool_id, "joined pool");
        true
    }

    pub fn leave_pool(&self, connection_id: &str, pool_id: &str) -> bool {
        {
            let mut connections = self.connections.lock().expect("Connection lock poisoned");
            if let Some(record) = connections.get_mut(connection_id) {
                record.pools.remove(pool_id);
            }
        }
        self.remove_from_pools(connection_id, std::iter::once(pool_id.to_string()))
    }

    fn remove_from_pools(&self, connection_id: &str, pool_ids: impl IntoIterator<Item = String>) -> bool {
        let mut pools = self.pools.lock().expect("Pool lock poisoned");
        let mut removed = false;
        for pool_id in pool_ids {
            if let Some(pool) = pools.get_mut(&pool_id) {
                let before = pool.members.len();
                pool.members.retain(|m| m != connection_id);
                removed |= pool.members.len() != before;
                if pool.members.is_empty() {
                    pools.remove(&pool_id);
                }
            }
        }
        removed
    }

    /// Removes the record and its pool memberships. Dropping the sender ends the socket task.
    pub fn cleanup_connection(&self, connection_id: &str) -> bool {
        let record = self
            .connections
            .lock()
            .expect("Connection lock poisoned")
            .remove(connection_id);
        match record {
            Some(record) => {
                self.remove_from_pools(connection_id, record.pools);
                info!(connection_id, sent = record.messages_sent, received = record.messages_received, "connection removed");
                true
            }
            None => false,
        }
    }

    /// Marks idle connections unhealthy and evicts the ones idle past the eviction window.
    pub fn heartbeat_sweep(&self, now: DateTime<Utc>) -> HeartbeatReport {
        let stale_after = ChronoDuration::seconds(self.config.stale_after_secs as i64);
        let evict_after = ChronoDuration::seconds(self.config.evict_after_secs as i64);
        let mut report = HeartbeatReport::default();
        let mut candidates = Vec::new();

        {
            let mut connections = self.connections.lock().expect("Connection lock poisoned");
            for (id, record) in connections.iter_mut() {
                let idle = now - record.last_activity;
                if idle > evict_after {
                    candidates.push(id.clone());
                } else if idle > stale_after && record.healthy {
                    record.healthy = false;
                    report.stale.push(id.clone());
                }
            }
        }

        for id in candidates {
            let still_idle = {
                let connections = self.connections.lock().expect("Connection lock poisoned");
                connections
                    .get(&id)
                    .is_some_and(|r| now - r.last_activity > evict_after)
            };
            if still_idle && self.cleanup_connection(&id) {
                warn!(connection_id = %id, "connection evicted after heartbeat timeout");
                report.evicted.push(id);
            }
        }

        report
    }

    pub fn connection_metrics(&self, connection_id: &str) -> Option<ConnectionMetrics> {
        let connections = self.connections.lock().expect("Connection lock poisoned");
        connections.get(connection_id).map(|r| to_metrics(connection_id, r))
    }

    pub fn all_connection_metrics(&self) -> Vec<ConnectionMetrics> {
        let connections = self.connections.lock().expect("Connection lock poisoned");
        let mut all: Vec<ConnectionMetrics> = connections.iter().map(|(id, r)| to_metrics(id, r)).collect();
        all.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        all
    }

    pub fn pool_metrics(&self) -> Vec<PoolMetrics> {
        let pools: Vec<(String, Vec<String>, u64)> = {
            let pools = self.pools.lock().expect("Pool lock poisoned");
            pools
                .iter()
                .map(|(id, p)| (id.clone(), p.members.clone(), p.routed_messages))
                .collect()
        };
        let connections = self.connections.lock().expect("Connection lock poisoned");
        let mut metrics: Vec<PoolMetrics> = pools
            .into_iter()
            .map(|(pool_id, members, routed_messages)| PoolMetrics {
                healthy_members: members
                    .iter()
                    .filter(|m| connections.get(m.as_str()).is_some_and(|r| r.healthy))
                    .count(),
                members: members.len(),
                pool_id,
                routed_messages,
            })
            .collect();
        metrics.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        metrics
    }

    pub fn stats(&self) -> ConnectionStats {
        let total_pools = self.pools.lock().expect("Pool lock poisoned").len();
        let connections = self.connections.lock().expect("Connection lock poisoned");
        let mut stats = ConnectionStats {
            total_connections: connections.len(),
            total_pools,
            ..Default::default()
        };
        for record in connections.values() {
            if record.healthy {
                stats.healthy_connections += 1;
            }
            stats.messages_sent += record.messages_sent;
            stats.messages_received += record.messages_received;
            stats.bytes_sent += record.bytes_sent;
            stats.bytes_received += record.bytes_received;
            stats.send_failures += record.send_failures;
        }
        stats
    }
}

fn to_metrics(connection_id: &str, record: &ConnectionRecord) -> ConnectionMetrics {
    let mut pools: Vec<String> = record.pools.iter().cloned().collect();
    pools.sort();
    ConnectionMetrics {
        connection_id: connection_id.to_string(),
        pools,
        connected_at: record.connected_at,
        last_activity: record.last_activity,
        healthy: record.healthy,
        messages_sent: record.messages_sent,
        messages_received: record.messages_received,
        bytes_sent: record.bytes_sent,
        bytes_received: record.bytes_received,
        send_failures: record.send_failures,
    }
}
