//! Cluster membership
//!
//! Resolves which node holds the primary and the replicas of a shard.

use shardsync_common::config::ClusterConfig;
use shardsync_common::{DiscoveryNode, Error, NodeId, Result, ShardId};
use std::collections::HashMap;

pub trait ClusterMembership: Send + Sync {
    fn node(&self, id: &NodeId) -> Option<DiscoveryNode>;

    fn primary(&self, shard: &ShardId) -> Option<DiscoveryNode>;

    fn replicas(&self, shard: &ShardId) -> Vec<DiscoveryNode>;

    /// Shards a node is primary for
    fn primary_shards(&self, node: &NodeId) -> Vec<ShardId>;

    /// Shards a node holds a replica of
    fn replica_shards(&self, node: &NodeId) -> Vec<ShardId>;
}

#[derive(Debug, Clone)]
struct Routing {
    primary: NodeId,
    replicas: Vec<NodeId>,
}

/// Membership fixed at startup from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    nodes: HashMap<NodeId, DiscoveryNode>,
    shards: HashMap<ShardId, Routing>,
}

impl StaticMembership {
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let mut membership = Self::default();
        for entry in &config.nodes {
            membership.add_node(DiscoveryNode::new(NodeId::new(entry.id.clone()), entry.address));
        }
        for routing in &config.shards {
            let shard: ShardId = routing
                .shard
                .parse()
                .map_err(|e| Error::Configuration(format!("{}: {}", routing.shard, e)))?;
            membership.assign(
                shard,
                NodeId::new(routing.primary.clone()),
                routing.replicas.iter().cloned().map(NodeId::new).collect(),
            )?;
        }
        Ok(membership)
    }

    pub fn add_node(&mut self, node: DiscoveryNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Route a shard. Every node named must already be known.
    pub fn assign(&mut self, shard: ShardId, primary: NodeId, replicas: Vec<NodeId>) -> Result<()> {
        for node in std::iter::once(&primary).chain(&replicas) {
            if !self.nodes.contains_key(node) {
                return Err(Error::Configuration(format!(
                    "{} routed to unknown node {}",
                    shard, node
                )));
            }
        }
        self.shards.insert(shard, Routing { primary, replicas });
        Ok(())
    }

    fn shards_where(&self, pred: impl Fn(&Routing) -> bool) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .shards
            .iter()
            .filter(|(_, routing)| pred(routing))
            .map(|(shard, _)| shard.clone())
            .collect();
        shards.sort();
        shards
    }
}

impl ClusterMembership for StaticMembership {
    fn node(&self, id: &NodeId) -> Option<DiscoveryNode> {
        self.nodes.get(id).cloned()
    }

    fn primary(&self, shard: &ShardId) -> Option<DiscoveryNode> {
        self.shards
            .get(shard)
            .and_then(|routing| self.node(&routing.primary))
    }

    fn replicas(&self, shard: &ShardId) -> Vec<DiscoveryNode> {
        self.shards
            .get(shard)
            .map(|routing| {
                routing
                    .replicas
                    .iter()
                    .filter_map(|id| self.node(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn primary_shards(&self, node: &NodeId) -> Vec<ShardId> {
        self.shards_where(|routing| &routing.primary == node)
    }

    fn replica_shards(&self, node: &NodeId) -> Vec<ShardId> {
        self.shards_where(|routing| routing.replicas.contains(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_common::config::{NodeEntry, ShardRouting};

    fn config() -> ClusterConfig {
        ClusterConfig {
            nodes: vec![
                NodeEntry {
                    id: "node-a".into(),
                    address: "127.0.0.1:9300".parse().unwrap(),
                },
                NodeEntry {
                    id: "node-b".into(),
                    address: "127.0.0.1:9301".parse().unwrap(),
                },
            ],
            shards: vec![
                ShardRouting {
                    shard: "logs/0".into(),
                    primary: "node-a".into(),
                    replicas: vec!["node-b".into()],
                },
                ShardRouting {
                    shard: "logs/1".into(),
                    primary: "node-b".into(),
                    replicas: vec!["node-a".into()],
                },
            ],
        }
    }

    #[test]
    fn test_resolves_routing() {
        let membership = StaticMembership::from_config(&config()).unwrap();
        let shard0: ShardId = "logs/0".parse().unwrap();
        let a = NodeId::new("node-a");
        let b = NodeId::new("node-b");

        assert_eq!(membership.primary(&shard0).unwrap().id, a);
        assert_eq!(membership.replicas(&shard0)[0].address.port(), 9301);
        assert_eq!(membership.primary_shards(&a), vec![shard0.clone()]);
        assert_eq!(membership.replica_shards(&b), vec![shard0]);
        assert_eq!(membership.replica_shards(&a).len(), 1);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let mut membership = StaticMembership::from_config(&config()).unwrap();
        let err = membership
            .assign(
                "logs/9".parse().unwrap(),
                NodeId::new("node-z"),
                Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unrouted_shard() {
        let membership = StaticMembership::from_config(&config()).unwrap();
        let shard: ShardId = "metrics/0".parse().unwrap();
        assert!(membership.primary(&shard).is_none());
        assert!(membership.replicas(&shard).is_empty());
    }
}
