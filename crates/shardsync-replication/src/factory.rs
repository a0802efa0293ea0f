//! Picking a replication source for a shard

use crate::local::LocalPrimarySource;
use crate::membership::ClusterMembership;
use crate::primary::SegmentReplicationSourceService;
use crate::remote::RemoteSegmentReplicationSource;
use crate::source::SegmentReplicationSource;
use shardsync_common::{Error, NodeId, Result, ShardId};
use shardsync_transport::TransportClient;
use std::sync::Arc;

/// Resolves the source a replica shard pulls from. Called once per
/// attempt, so a moved primary is picked up by the next attempt.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, shard: &ShardId) -> Result<Arc<dyn SegmentReplicationSource>>;
}

/// Resolves through cluster membership: the local primary service when the
/// primary is this node, the transport otherwise
pub struct SegmentReplicationSourceFactory {
    client: Arc<TransportClient>,
    membership: Arc<dyn ClusterMembership>,
    local_node: NodeId,
    local_primary: Option<Arc<SegmentReplicationSourceService>>,
}

impl SegmentReplicationSourceFactory {
    pub fn new(
        client: Arc<TransportClient>,
        membership: Arc<dyn ClusterMembership>,
        local_node: NodeId,
    ) -> Self {
        Self {
            client,
            membership,
            local_node,
            local_primary: None,
        }
    }

    #[must_use]
    pub fn with_local_primary(mut self, primary: Arc<SegmentReplicationSourceService>) -> Self {
        self.local_primary = Some(primary);
        self
    }
}

impl SourceResolver for SegmentReplicationSourceFactory {
    fn resolve(&self, shard: &ShardId) -> Result<Arc<dyn SegmentReplicationSource>> {
        let primary = self
            .membership
            .primary(shard)
            .ok_or_else(|| Error::ServiceUnavailable(format!("no primary known for {}", shard)))?;

        if primary.id == self.local_node {
            return match &self.local_primary {
                Some(service) => Ok(Arc::new(LocalPrimarySource::new(
                    Arc::clone(service),
                    self.local_node.clone(),
                ))),
                None => Err(Error::ServiceUnavailable(format!(
                    "{} is primary for {} but serves no primaries",
                    self.local_node, shard
                ))),
            };
        }
        Ok(Arc::new(RemoteSegmentReplicationSource::new(
            Arc::clone(&self.client),
            primary,
            self.local_node.clone(),
        )))
    }
}

/// Always resolves to the same source
pub struct FixedSourceResolver(Arc<dyn SegmentReplicationSource>);

impl FixedSourceResolver {
    pub fn new(source: Arc<dyn SegmentReplicationSource>) -> Self {
        Self(source)
    }
}

impl SourceResolver for FixedSourceResolver {
    fn resolve(&self, _shard: &ShardId) -> Result<Arc<dyn SegmentReplicationSource>> {
        Ok(Arc::clone(&self.0))
    }
}
