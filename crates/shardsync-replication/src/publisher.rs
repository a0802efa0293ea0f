//! Announcing new primary checkpoints to replicas

use crate::membership::ClusterMembership;
use crate::protocol::{PUBLISH_CHECKPOINT_ACTION, PublishCheckpointRequest, PublishCheckpointResponse};
use crate::service::SegmentReplicationTargetService;
use futures::future::join_all;
use shardsync_common::{DiscoveryNode, NodeId, Result};
use shardsync_storage::ReplicationCheckpoint;
use shardsync_transport::TransportClient;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends a primary's checkpoints to every replica of the shard.
///
/// Publishing is fire and forget: a replica that misses a notification
/// catches up on the next one or through its own sync request.
pub struct CheckpointPublisher {
    client: Arc<TransportClient>,
    membership: Arc<dyn ClusterMembership>,
    local_node: NodeId,
    local_replicas: Option<SegmentReplicationTargetService>,
}

impl CheckpointPublisher {
    pub fn new(
        client: Arc<TransportClient>,
        membership: Arc<dyn ClusterMembership>,
        local_node: NodeId,
    ) -> Self {
        Self {
            client,
            membership,
            local_node,
            local_replicas: None,
        }
    }

    /// Deliver to replicas on this node without going through the transport
    #[must_use]
    pub fn with_local_replicas(mut self, service: SegmentReplicationTargetService) -> Self {
        self.local_replicas = Some(service);
        self
    }

    /// Publish `checkpoint` and return how many replicas accepted it
    pub async fn publish(&self, checkpoint: &ReplicationCheckpoint) -> usize {
        let replicas = self.membership.replicas(checkpoint.shard_id());
        if replicas.is_empty() {
            debug!("{} has no replicas to publish to", checkpoint.shard_id());
            return 0;
        }

        let request = PublishCheckpointRequest {
            checkpoint: checkpoint.clone(),
        };
        let results = join_all(
            replicas
                .iter()
                .map(|replica| self.publish_to(replica, &request)),
        )
        .await;

        let mut accepted = 0;
        for (replica, result) in replicas.iter().zip(results) {
            match result {
                Ok(true) => accepted += 1,
                Ok(false) => debug!("{} already has {} or newer", replica, checkpoint),
                Err(e) => warn!("Failed to publish {} to {}: {}", checkpoint, replica, e),
            }
        }
        debug!(
            "Published {} to {}/{} replicas",
            checkpoint,
            accepted,
            replicas.len()
        );
        accepted
    }

    async fn publish_to(
        &self,
        replica: &DiscoveryNode,
        request: &PublishCheckpointRequest,
    ) -> Result<bool> {
        if replica.id == self.local_node
            && let Some(service) = &self.local_replicas
        {
            return service.on_new_checkpoint(request.checkpoint.clone());
        }
        let response: PublishCheckpointResponse = self
            .client
            .request(replica.address, PUBLISH_CHECKPOINT_ACTION, request)
            .await?;
        Ok(response.accepted)
    }
}
