//! Configuration types for ShardSync
//!
//! This module defines configuration structures used across components.
//! Every section deserializes with defaults so a node config file only
//! needs to name what differs.

use crate::error::{Error, Result};
use crate::types::{DiscoveryNode, NodeId, ShardId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a ShardSync node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Node-wide segment cache
    pub cache: CacheConfig,
    /// Replica-side replication behaviour
    pub replication: ReplicationConfig,
    /// Inbound request admission control
    pub admission: AdmissionConfig,
    /// Static cluster membership and shard routing
    pub cluster: ClusterConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.network.validate()?;
        self.cache.validate()?;
        self.replication.validate()?;
        self.admission.validate()?;
        self.cluster.validate()
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name; must match an entry in `cluster.nodes`
    pub name: String,
    /// Root directory holding one subdirectory per shard
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "shardsync-node".to_string(),
            data_dir: PathBuf::from("/var/lib/shardsync"),
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("node.name must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.name.clone())
    }
}

/// Network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address for the internal transport (replication traffic)
    pub transport_listen: SocketAddr,
    /// Address for the metrics and health endpoint
    pub metrics_listen: SocketAddr,
    /// Largest frame accepted on the wire
    pub max_frame_size: usize,
    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport_listen: SocketAddr::from(([0, 0, 0, 0], 9300)),
            metrics_listen: SocketAddr::from(([0, 0, 0, 0], 9310)),
            max_frame_size: 64 * 1024 * 1024, // 64 MB
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl NetworkConfig {
    fn validate(&self) -> Result<()> {
        if self.max_frame_size < 1024 {
            return Err(Error::Configuration(
                "network.max_frame_size must be at least 1024 bytes".into(),
            ));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Configuration(
                "network timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Which entries the segment cache evicts first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Largest entries first, ties broken by recency
    LargestFirst,
}

/// Node-wide segment cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Soft capacity in bytes; referenced entries may push usage past it
    pub capacity_bytes: u64,
    /// Eviction ordering among unreferenced entries
    pub eviction_policy: EvictionPolicyKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024, // 512 MB
            eviction_policy: EvictionPolicyKind::Lru,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(Error::Configuration(
                "cache.capacity_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Backoff settings for transient transport failures
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between retries (milliseconds)
    pub max_backoff_ms: u64,
    /// Growth factor applied after each retry
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Replica-side replication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Retry policy for transient failures within one attempt
    pub retry: RetryConfig,
    /// Fresh attempts started after an attempt fails, before the driver
    /// gives up and waits for the next checkpoint
    pub max_attempt_restarts: u32,
    /// Size of file chunks streamed by the primary
    pub chunk_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_attempt_restarts: 3,
            chunk_size: 512 * 1024, // 512 KB
        }
    }
}

impl ReplicationConfig {
    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "replication.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Configuration(
                "replication.retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Configuration(
                "replication.retry.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(Error::Configuration(
                "replication.chunk_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// How admission control treats a tripped predicate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Reject the request
    #[default]
    Enforced,
    /// Count the would-be rejection but let the request through
    MonitorOnly,
    /// Skip all checks
    Disabled,
}

/// Limits for one category of inbound actions (0 = unlimited)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryLimits {
    /// Maximum concurrently executing requests
    pub max_in_flight: u64,
    /// Sustained requests per second
    pub max_requests_per_sec: u64,
    /// Burst size for the rate limit (defaults to one second's worth)
    pub burst: u64,
}

/// Admission control configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub mode: AdmissionMode,
    /// Limits for `replication/*` actions
    pub replication: CategoryLimits,
    /// Limits for every other action
    pub internal: CategoryLimits,
    /// Reject replication requests when referenced cache bytes exceed this
    /// fraction of cache capacity (0 disables the check)
    pub cache_pressure_threshold: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mode: AdmissionMode::Enforced,
            replication: CategoryLimits {
                max_in_flight: 64,
                max_requests_per_sec: 0,
                burst: 0,
            },
            internal: CategoryLimits::default(),
            cache_pressure_threshold: 0.95,
        }
    }
}

impl AdmissionConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cache_pressure_threshold) {
            return Err(Error::Configuration(
                "admission.cache_pressure_threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// A node entry in the static membership table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub address: SocketAddr,
}

/// Where the copies of one shard live
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardRouting {
    /// Shard in `<index>/<shard>` form
    pub shard: String,
    /// Node hosting the primary copy
    pub primary: String,
    /// Nodes hosting replica copies
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// Static cluster membership
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeEntry>,
    pub shards: Vec<ShardRouting>,
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        let known = |id: &str| self.nodes.iter().any(|n| n.id == id);
        for routing in &self.shards {
            routing.shard.parse::<ShardId>().map_err(|e| {
                Error::Configuration(format!("cluster.shards: {}: {e}", routing.shard))
            })?;
            if !known(&routing.primary) {
                return Err(Error::Configuration(format!(
                    "cluster.shards: {}: unknown primary node {}",
                    routing.shard, routing.primary
                )));
            }
            for replica in &routing.replicas {
                if !known(replica) {
                    return Err(Error::Configuration(format!(
                        "cluster.shards: {}: unknown replica node {replica}",
                        routing.shard
                    )));
                }
                if *replica == routing.primary {
                    return Err(Error::Configuration(format!(
                        "cluster.shards: {}: node {replica} is both primary and replica",
                        routing.shard
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a node by ID
    #[must_use]
    pub fn node(&self, id: &str) -> Option<DiscoveryNode> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| DiscoveryNode::new(NodeId::new(n.id.clone()), n.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.name, "shardsync-node");
        assert_eq!(config.network.transport_listen.port(), 9300);
        assert_eq!(config.cache.eviction_policy, EvictionPolicyKind::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [node]
            name = "node-b"

            [cache]
            capacity_bytes = 1048576
            eviction_policy = "largest_first"

            [admission]
            mode = "monitor_only"

            [[cluster.nodes]]
            id = "node-a"
            address = "127.0.0.1:9300"

            [[cluster.nodes]]
            id = "node-b"
            address = "127.0.0.1:9301"

            [[cluster.shards]]
            shard = "logs/0"
            primary = "node-a"
            replicas = ["node-b"]
            "#,
        )
        .unwrap();

        assert_eq!(config.node.name, "node-b");
        assert_eq!(config.cache.capacity_bytes, 1_048_576);
        assert_eq!(config.cache.eviction_policy, EvictionPolicyKind::LargestFirst);
        assert_eq!(config.admission.mode, AdmissionMode::MonitorOnly);
        assert_eq!(config.replication.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.cluster.node("node-b").unwrap().address.port(),
            9301
        );
    }

    #[test]
    fn test_cluster_validation() {
        let mut cluster = ClusterConfig {
            nodes: vec![NodeEntry {
                id: "node-a".into(),
                address: "127.0.0.1:9300".parse().unwrap(),
            }],
            shards: vec![ShardRouting {
                shard: "logs/0".into(),
                primary: "node-a".into(),
                replicas: vec!["node-x".into()],
            }],
        };
        assert!(cluster.validate().is_err());

        cluster.shards[0].replicas = vec!["node-a".into()];
        assert!(cluster.validate().is_err());

        cluster.shards[0].replicas.clear();
        cluster.shards[0].shard = "logs".into();
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn test_replication_validation() {
        let mut config = ReplicationConfig::default();
        assert!(config.validate().is_ok());

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 3;
        config.retry.initial_backoff_ms = 20_000;
        assert!(config.validate().is_err());
    }
}
